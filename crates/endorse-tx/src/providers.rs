//! Peer/orderer endpoint types and the policy-source trait used by endorser selection.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Capabilities a channel peer may serve.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerRoles {
    /// Peer may endorse state-changing proposals.
    pub endorsing_peer: bool,
    /// Peer may answer read-only chaincode queries.
    pub chaincode_query: bool,
    /// Peer may serve ledger reads.
    pub ledger_query: bool,
    /// Peer may serve block/transaction events.
    pub event_source: bool,
}

impl Default for PeerRoles {
    fn default() -> Self {
        Self {
            endorsing_peer: true,
            chaincode_query: true,
            ledger_query: true,
            event_source: true,
        }
    }
}

impl PeerRoles {
    /// Returns true when `role` is served.
    #[must_use]
    pub const fn has(self, role: PeerRole) -> bool {
        match role {
            PeerRole::EndorsingPeer => self.endorsing_peer,
            PeerRole::ChaincodeQuery => self.chaincode_query,
            PeerRole::LedgerQuery => self.ledger_query,
            PeerRole::EventSource => self.event_source,
        }
    }
}

/// One peer capability, used to pick peers for a call kind.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum PeerRole {
    /// Endorses state-changing proposals.
    EndorsingPeer,
    /// Answers read-only chaincode queries.
    ChaincodeQuery,
    /// Serves ledger reads.
    LedgerQuery,
    /// Serves block/transaction events.
    EventSource,
}

/// One endorsing node on a channel.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Peer {
    /// Network address (`host:port` or URL).
    pub url: String,
    /// Organization (MSP) the peer belongs to.
    pub msp_id: String,
    /// Capabilities served on this channel.
    #[serde(default)]
    pub roles: PeerRoles,
    /// PEM-encoded TLS identity presented by the peer.
    #[serde(default)]
    pub tls_identity: Option<String>,
    /// Last known ledger height, when discovery reports one.
    #[serde(default)]
    pub ledger_height: Option<u64>,
}

impl Peer {
    /// Creates a peer with default roles and no TLS identity.
    #[must_use]
    pub fn new(url: impl Into<String>, msp_id: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            msp_id: msp_id.into(),
            roles: PeerRoles::default(),
            tls_identity: None,
            ledger_height: None,
        }
    }

    /// Sets the reported ledger height.
    #[must_use]
    pub const fn with_ledger_height(mut self, height: u64) -> Self {
        self.ledger_height = Some(height);
        self
    }

    /// Sets the served roles.
    #[must_use]
    pub const fn with_roles(mut self, roles: PeerRoles) -> Self {
        self.roles = roles;
        self
    }
}

/// Groups peers by organization, preserving input order within each organization.
#[must_use]
pub fn peers_by_org<'peer, I>(peers: I) -> HashMap<String, Vec<Peer>>
where
    I: IntoIterator<Item = &'peer Peer>,
{
    let mut grouped: HashMap<String, Vec<Peer>> = HashMap::new();
    for peer in peers {
        grouped
            .entry(peer.msp_id.clone())
            .or_default()
            .push(peer.clone());
    }
    grouped
}

/// One ordering-service endpoint.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct OrdererEndpoint {
    /// Network address (`host:port` or URL).
    pub url: String,
    /// Organization operating the orderer, when known.
    #[serde(default)]
    pub msp_id: Option<String>,
    /// PEM-encoded TLS identity presented by the orderer.
    #[serde(default)]
    pub tls_identity: Option<String>,
}

impl OrdererEndpoint {
    /// Creates an orderer endpoint without organization or TLS metadata.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            msp_id: None,
            tls_identity: None,
        }
    }
}

/// Errors surfaced by policy sources.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum PolicyLookupError {
    /// No endorsement policy is known for the chaincode.
    #[error("no endorsement policy known for chaincode `{chaincode_id}` on channel `{channel_id}`")]
    UnknownChaincode {
        /// Channel queried.
        channel_id: String,
        /// Chaincode queried.
        chaincode_id: String,
    },
    /// The source could not be reached.
    #[error("policy source unavailable: {message}")]
    Unavailable {
        /// Human-readable description.
        message: String,
    },
}

/// Source of raw endorsement-policy encodings.
#[async_trait]
pub trait PolicyProvider: Send + Sync {
    /// Returns the chaincode-level endorsement policy.
    async fn chaincode_policy(
        &self,
        channel_id: &str,
        chaincode_id: &str,
    ) -> Result<String, PolicyLookupError>;

    /// Returns the collection-level override policy, if the collection defines one.
    async fn collection_policy(
        &self,
        channel_id: &str,
        chaincode_id: &str,
        collection: &str,
    ) -> Result<Option<String>, PolicyLookupError>;
}

/// In-memory policy source built from static configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticPolicyProvider {
    /// Chaincode policies keyed by chaincode ID.
    chaincodes: BTreeMap<String, String>,
    /// Collection policies keyed by `(chaincode ID, collection)`.
    collections: BTreeMap<(String, String), String>,
}

impl StaticPolicyProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a chaincode endorsement policy.
    #[must_use]
    pub fn with_chaincode(
        mut self,
        chaincode_id: impl Into<String>,
        policy: impl Into<String>,
    ) -> Self {
        let _ = self.chaincodes.insert(chaincode_id.into(), policy.into());
        self
    }

    /// Registers a collection override policy.
    #[must_use]
    pub fn with_collection(
        mut self,
        chaincode_id: impl Into<String>,
        collection: impl Into<String>,
        policy: impl Into<String>,
    ) -> Self {
        let _ = self
            .collections
            .insert((chaincode_id.into(), collection.into()), policy.into());
        self
    }
}

#[async_trait]
impl PolicyProvider for StaticPolicyProvider {
    async fn chaincode_policy(
        &self,
        channel_id: &str,
        chaincode_id: &str,
    ) -> Result<String, PolicyLookupError> {
        self.chaincodes
            .get(chaincode_id)
            .cloned()
            .ok_or_else(|| PolicyLookupError::UnknownChaincode {
                channel_id: channel_id.to_owned(),
                chaincode_id: chaincode_id.to_owned(),
            })
    }

    async fn collection_policy(
        &self,
        _channel_id: &str,
        chaincode_id: &str,
        collection: &str,
    ) -> Result<Option<String>, PolicyLookupError> {
        Ok(self
            .collections
            .get(&(chaincode_id.to_owned(), collection.to_owned()))
            .cloned())
    }
}
