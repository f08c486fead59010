//! Channel client configuration: per-call defaults from the environment plus static network
//! descriptions parsed from JSON.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{OnceLock, RwLock},
    time::Duration,
};

use serde::Deserialize;
use thiserror::Error;

use crate::{
    discovery::{DEFAULT_DISCOVERY_TIMEOUT, DEFAULT_SNAPSHOT_TTL, PeerRule, StaticDiscovery},
    policy::{DEFAULT_MAX_ORG_GROUPS, Policy, PolicyError},
    providers::{OrdererEndpoint, Peer, StaticPolicyProvider},
    retry::RetryPolicy,
};

/// Process-local overrides consulted before the real environment.
static ENV_OVERRIDES: OnceLock<RwLock<HashMap<String, String>>> = OnceLock::new();

fn env_overrides() -> &'static RwLock<HashMap<String, String>> {
    ENV_OVERRIDES.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Returns an environment variable, preferring process-local overrides.
pub(crate) fn read_env_var(name: &str) -> Option<String> {
    if let Ok(guard) = env_overrides().read()
        && let Some(value) = guard.get(name)
    {
        return Some(value.clone());
    }
    std::env::var(name).ok()
}

/// Replaces all process-local overrides.
#[cfg(test)]
pub(crate) fn set_env_overrides(overrides: impl IntoIterator<Item = (String, String)>) {
    let mut map = HashMap::new();
    map.extend(overrides);
    if let Ok(mut guard) = env_overrides().write() {
        *guard = map;
    }
}

/// Clears all process-local overrides.
#[cfg(test)]
pub(crate) fn clear_env_overrides() {
    if let Ok(mut guard) = env_overrides().write() {
        guard.clear();
    }
}

fn read_duration_ms(name: &str, default: Duration) -> Duration {
    read_env_var(name)
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .map_or(default, Duration::from_millis)
}

/// Suspension points with their own timeout.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum TimeoutKind {
    /// Waiting for endorsement responses.
    Proposal,
    /// One orderer broadcast.
    Orderer,
    /// Waiting for commit status.
    Commit,
    /// One discovery fetch.
    Discovery,
}

/// Timeout per [`TimeoutKind`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Timeouts {
    /// Endorsement fan-out bound.
    pub proposal: Duration,
    /// Per-orderer broadcast bound.
    pub orderer: Duration,
    /// Commit wait bound.
    pub commit: Duration,
    /// Discovery fetch bound.
    pub discovery: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            proposal: Duration::from_secs(30),
            orderer: Duration::from_secs(30),
            commit: Duration::from_secs(180),
            discovery: DEFAULT_DISCOVERY_TIMEOUT,
        }
    }
}

impl Timeouts {
    /// Returns the timeout for `kind`.
    #[must_use]
    pub const fn get(&self, kind: TimeoutKind) -> Duration {
        match kind {
            TimeoutKind::Proposal => self.proposal,
            TimeoutKind::Orderer => self.orderer,
            TimeoutKind::Commit => self.commit,
            TimeoutKind::Discovery => self.discovery,
        }
    }

    /// Sets the timeout for `kind`.
    #[must_use]
    pub const fn with(mut self, kind: TimeoutKind, timeout: Duration) -> Self {
        match kind {
            TimeoutKind::Proposal => self.proposal = timeout,
            TimeoutKind::Orderer => self.orderer = timeout,
            TimeoutKind::Commit => self.commit = timeout,
            TimeoutKind::Discovery => self.discovery = timeout,
        }
        self
    }
}

/// Client-wide defaults; per-call options override them.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    /// Default timeouts.
    pub timeouts: Timeouts,
    /// Default retry policy.
    pub retry: RetryPolicy,
    /// Discovery snapshot freshness window.
    pub discovery_ttl: Duration,
    /// Background discovery refresh interval.
    pub discovery_refresh: Duration,
    /// Cap on candidate organization groups during selection.
    pub max_org_groups: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            timeouts: Timeouts::default(),
            retry: RetryPolicy::default(),
            discovery_ttl: DEFAULT_SNAPSHOT_TTL,
            discovery_refresh: Duration::from_secs(60),
            max_org_groups: DEFAULT_MAX_ORG_GROUPS,
        }
    }
}

impl ChannelConfig {
    /// Reads `ENDORSE_TX_*` variables over the defaults.
    ///
    /// Missing, unparsable, and zero values fall back to the default.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let timeouts = Timeouts {
            proposal: read_duration_ms(
                "ENDORSE_TX_PROPOSAL_TIMEOUT_MS",
                defaults.timeouts.proposal,
            ),
            orderer: read_duration_ms("ENDORSE_TX_ORDERER_TIMEOUT_MS", defaults.timeouts.orderer),
            commit: read_duration_ms("ENDORSE_TX_COMMIT_TIMEOUT_MS", defaults.timeouts.commit),
            discovery: read_duration_ms(
                "ENDORSE_TX_DISCOVERY_TIMEOUT_MS",
                defaults.timeouts.discovery,
            ),
        };
        let retry = RetryPolicy {
            max_attempts: read_env_var("ENDORSE_TX_RETRY_ATTEMPTS")
                .and_then(|value| value.parse::<u32>().ok())
                .filter(|value| *value > 0)
                .unwrap_or(defaults.retry.max_attempts),
            initial_backoff: read_duration_ms(
                "ENDORSE_TX_RETRY_INITIAL_BACKOFF_MS",
                defaults.retry.initial_backoff,
            ),
            max_backoff: read_duration_ms(
                "ENDORSE_TX_RETRY_MAX_BACKOFF_MS",
                defaults.retry.max_backoff,
            ),
            backoff_multiplier: read_env_var("ENDORSE_TX_RETRY_BACKOFF_FACTOR")
                .and_then(|value| value.parse::<f64>().ok())
                .filter(|value| value.is_finite() && *value >= 1.0)
                .unwrap_or(defaults.retry.backoff_multiplier),
            retryable_codes: defaults.retry.retryable_codes.clone(),
        };
        Self {
            timeouts,
            retry,
            discovery_ttl: read_duration_ms("ENDORSE_TX_DISCOVERY_TTL_MS", defaults.discovery_ttl),
            discovery_refresh: read_duration_ms(
                "ENDORSE_TX_DISCOVERY_REFRESH_MS",
                defaults.discovery_refresh,
            ),
            max_org_groups: defaults.max_org_groups,
        }
        .normalized()
    }

    /// Returns a normalized config with bounded minimums.
    #[must_use]
    pub fn normalized(self) -> Self {
        let floor = Duration::from_millis(1);
        Self {
            timeouts: Timeouts {
                proposal: self.timeouts.proposal.max(floor),
                orderer: self.timeouts.orderer.max(floor),
                commit: self.timeouts.commit.max(floor),
                discovery: self.timeouts.discovery.max(floor),
            },
            retry: self.retry.normalized(),
            discovery_ttl: self.discovery_ttl,
            discovery_refresh: self.discovery_refresh.max(floor),
            max_org_groups: self.max_org_groups.max(1),
        }
    }
}

/// Configuration failures.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum ConfigError {
    /// The JSON document could not be decoded.
    #[error("invalid network configuration: {message}")]
    Parse {
        /// Decoder description.
        message: String,
    },
    /// The channel ID is empty.
    #[error("network configuration has no channel id")]
    MissingChannel,
    /// A peer entry is unusable.
    #[error("peer entry {index} is invalid: {reason}")]
    InvalidPeer {
        /// Position in the peer list.
        index: usize,
        /// What is wrong.
        reason: &'static str,
    },
    /// A configured policy does not parse.
    #[error("policy for chaincode `{chaincode_id}` is invalid: {source}")]
    InvalidPolicy {
        /// Chaincode whose policy failed.
        chaincode_id: String,
        /// Collection whose policy failed, if any.
        collection: Option<String>,
        /// Parser error.
        source: PolicyError,
    },
}

/// Policies configured for one chaincode.
#[derive(Debug, Clone, Default, Eq, PartialEq, Deserialize)]
pub struct ChaincodeConfig {
    /// Chaincode endorsement policy.
    pub policy: String,
    /// Collection override policies by collection name.
    #[serde(default)]
    pub collections: BTreeMap<String, String>,
}

/// Static description of one channel.
#[derive(Debug, Clone, Default, Eq, PartialEq, Deserialize)]
pub struct NetworkConfig {
    /// Channel ID.
    pub channel_id: String,
    /// Configured peers.
    #[serde(default)]
    pub peers: Vec<Peer>,
    /// Ordering-service endpoints.
    #[serde(default)]
    pub orderers: Vec<OrdererEndpoint>,
    /// Chaincode policies by chaincode ID.
    #[serde(default)]
    pub chaincodes: BTreeMap<String, ChaincodeConfig>,
    /// Ordered peer rules; the first match wins.
    #[serde(default)]
    pub peer_rules: Vec<PeerRule>,
}

impl NetworkConfig {
    /// Parses and validates a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when decoding or validation fails.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text).map_err(|error| ConfigError::Parse {
            message: error.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks channel, peer, and policy entries.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channel_id.trim().is_empty() {
            return Err(ConfigError::MissingChannel);
        }
        for (index, peer) in self.peers.iter().enumerate() {
            if peer.url.trim().is_empty() {
                return Err(ConfigError::InvalidPeer {
                    index,
                    reason: "empty url",
                });
            }
            if peer.msp_id.trim().is_empty() {
                return Err(ConfigError::InvalidPeer {
                    index,
                    reason: "empty msp id",
                });
            }
        }
        for (chaincode_id, chaincode) in &self.chaincodes {
            Policy::parse(&chaincode.policy).map_err(|source| ConfigError::InvalidPolicy {
                chaincode_id: chaincode_id.clone(),
                collection: None,
                source,
            })?;
            for (collection, policy) in &chaincode.collections {
                Policy::parse(policy).map_err(|source| ConfigError::InvalidPolicy {
                    chaincode_id: chaincode_id.clone(),
                    collection: Some(collection.clone()),
                    source,
                })?;
            }
        }
        Ok(())
    }

    /// Builds a policy source from the configured chaincodes.
    #[must_use]
    pub fn policy_provider(&self) -> StaticPolicyProvider {
        let mut provider = StaticPolicyProvider::new();
        for (chaincode_id, chaincode) in &self.chaincodes {
            provider = provider.with_chaincode(chaincode_id.clone(), chaincode.policy.clone());
            for (collection, policy) in &chaincode.collections {
                provider = provider.with_collection(
                    chaincode_id.clone(),
                    collection.clone(),
                    policy.clone(),
                );
            }
        }
        provider
    }

    /// Builds a static discovery backend from the configured peers.
    #[must_use]
    pub fn static_discovery(&self) -> StaticDiscovery {
        StaticDiscovery::new(self.peers.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::PolicyProvider;

    const NETWORK_JSON: &str = r#"{
        "channel_id": "mychannel",
        "peers": [
            { "url": "peer0.org1.example.com:7051", "msp_id": "Org1MSP" },
            {
                "url": "peer0.org2.example.com:7051",
                "msp_id": "Org2MSP",
                "roles": { "endorsing_peer": false },
                "ledger_height": 42
            }
        ],
        "orderers": [ { "url": "orderer.example.com:7050" } ],
        "chaincodes": {
            "exampleCC": {
                "policy": "AND('Org1MSP.member','Org2MSP.member')",
                "collections": { "private": "'Org1MSP.member'" }
            }
        },
        "peer_rules": [ { "url_pattern": "*.org3.*", "ignore": true } ]
    }"#;

    #[test]
    fn network_config_parses_from_json() {
        let config = NetworkConfig::from_json(NETWORK_JSON);
        assert!(config.is_ok());
        if let Ok(config) = config {
            assert_eq!(config.channel_id, "mychannel");
            assert_eq!(config.peers.len(), 2);
            let second = config.peers.get(1);
            assert!(second.is_some_and(|peer| !peer.roles.endorsing_peer
                && peer.roles.chaincode_query
                && peer.ledger_height == Some(42)));
            assert_eq!(config.orderers.len(), 1);
            assert_eq!(config.peer_rules.len(), 1);
            assert!(config.peer_rules.first().is_some_and(|rule| rule.ignore));
        }
    }

    #[tokio::test]
    async fn policy_provider_serves_configured_policies() {
        let config = NetworkConfig::from_json(NETWORK_JSON);
        assert!(config.is_ok());
        let Ok(config) = config else {
            return;
        };
        let provider = config.policy_provider();
        assert_eq!(
            provider.chaincode_policy("mychannel", "exampleCC").await,
            Ok("AND('Org1MSP.member','Org2MSP.member')".to_owned())
        );
        assert_eq!(
            provider
                .collection_policy("mychannel", "exampleCC", "private")
                .await,
            Ok(Some("'Org1MSP.member'".to_owned()))
        );
    }

    #[test]
    fn invalid_documents_are_rejected() {
        assert!(matches!(
            NetworkConfig::from_json("{"),
            Err(ConfigError::Parse { .. })
        ));
        assert_eq!(
            NetworkConfig::from_json(r#"{ "channel_id": " " }"#),
            Err(ConfigError::MissingChannel)
        );
        assert!(matches!(
            NetworkConfig::from_json(
                r#"{ "channel_id": "c", "chaincodes": { "cc": { "policy": "AND(" } } }"#
            ),
            Err(ConfigError::InvalidPolicy { ref chaincode_id, .. }) if chaincode_id == "cc"
        ));
        assert!(matches!(
            NetworkConfig::from_json(
                r#"{ "channel_id": "c", "peers": [ { "url": "", "msp_id": "A" } ] }"#
            ),
            Err(ConfigError::InvalidPeer { index: 0, .. })
        ));
    }

    #[test]
    fn env_overrides_apply_and_invalid_values_fall_back() {
        set_env_overrides([
            ("ENDORSE_TX_PROPOSAL_TIMEOUT_MS".to_owned(), "1500".to_owned()),
            ("ENDORSE_TX_COMMIT_TIMEOUT_MS".to_owned(), "0".to_owned()),
            ("ENDORSE_TX_RETRY_ATTEMPTS".to_owned(), "7".to_owned()),
            ("ENDORSE_TX_RETRY_BACKOFF_FACTOR".to_owned(), "0.5".to_owned()),
            ("ENDORSE_TX_DISCOVERY_TTL_MS".to_owned(), "nope".to_owned()),
        ]);
        let config = ChannelConfig::from_env();
        clear_env_overrides();

        let defaults = ChannelConfig::default();
        assert_eq!(config.timeouts.get(TimeoutKind::Proposal), Duration::from_millis(1500));
        assert_eq!(config.timeouts.get(TimeoutKind::Commit), defaults.timeouts.commit);
        assert_eq!(config.retry.max_attempts, 7);
        assert!((config.retry.backoff_multiplier - 2.0).abs() < f64::EPSILON);
        assert_eq!(config.discovery_ttl, defaults.discovery_ttl);
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = ChannelConfig::default();
        assert_eq!(config.timeouts.proposal, Duration::from_secs(30));
        assert_eq!(config.timeouts.orderer, Duration::from_secs(30));
        assert_eq!(config.timeouts.commit, Duration::from_secs(180));
        assert_eq!(config.timeouts.discovery, Duration::from_secs(15));
        assert_eq!(config.discovery_ttl, Duration::from_secs(30));
        assert_eq!(config.discovery_refresh, Duration::from_secs(60));
        assert_eq!(config.retry.max_attempts, 4);
        assert_eq!(config.max_org_groups, 4_096);

        let tuned = Timeouts::default().with(TimeoutKind::Orderer, Duration::from_secs(2));
        assert_eq!(tuned.get(TimeoutKind::Orderer), Duration::from_secs(2));
    }
}
