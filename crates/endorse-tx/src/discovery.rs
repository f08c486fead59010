//! Live peer discovery with immutable, atomically swapped snapshots.

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use arcshift::ArcShift;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{sync::Mutex, task::JoinHandle, time::Instant};

use crate::{
    cancel::CancelSignal,
    pattern::Pattern,
    providers::{Peer, PeerRole, PeerRoles, peers_by_org},
};

/// Default snapshot freshness window.
pub const DEFAULT_SNAPSHOT_TTL: Duration = Duration::from_secs(30);

/// Default bound for one backend fetch.
pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(15);

/// Discovery failures.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum DiscoveryError {
    /// The backend failed.
    #[error("discovery backend failed for channel `{channel_id}`: {message}")]
    Backend {
        /// Channel queried.
        channel_id: String,
        /// Backend description.
        message: String,
    },
    /// The backend did not answer in time.
    #[error("discovery for channel `{channel_id}` timed out after {timeout:?}")]
    Timeout {
        /// Channel queried.
        channel_id: String,
        /// Configured bound.
        timeout: Duration,
    },
    /// The caller cancelled while the fetch was outstanding.
    #[error("discovery for channel `{channel_id}` was cancelled")]
    Cancelled {
        /// Channel queried.
        channel_id: String,
    },
}

/// Source of the peers serving a channel.
#[async_trait]
pub trait DiscoveryBackend: Send + Sync {
    /// Returns every peer currently known for `channel_id`.
    async fn peers(&self, channel_id: &str) -> Result<Vec<Peer>, DiscoveryError>;
}

/// Backend serving a fixed peer list loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticDiscovery {
    /// Configured peers.
    peers: Vec<Peer>,
}

impl StaticDiscovery {
    /// Creates a static backend.
    #[must_use]
    pub const fn new(peers: Vec<Peer>) -> Self {
        Self { peers }
    }
}

#[async_trait]
impl DiscoveryBackend for StaticDiscovery {
    async fn peers(&self, _channel_id: &str) -> Result<Vec<Peer>, DiscoveryError> {
        Ok(self.peers.clone())
    }
}

/// Configuration-level override applied to discovered peers whose URL matches.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct PeerRule {
    /// URL pattern with `*` wildcards.
    pub url_pattern: Pattern,
    /// Drops matching peers entirely.
    #[serde(default)]
    pub ignore: bool,
    /// Replaces the roles of matching peers.
    #[serde(default)]
    pub roles: Option<PeerRoles>,
}

impl PeerRule {
    /// Creates a rule that changes nothing.
    #[must_use]
    pub fn new(url_pattern: impl Into<String>) -> Self {
        Self {
            url_pattern: Pattern::new(url_pattern),
            ignore: false,
            roles: None,
        }
    }

    /// Marks matching peers as ignored.
    #[must_use]
    pub const fn ignored(mut self) -> Self {
        self.ignore = true;
        self
    }

    /// Overrides the roles of matching peers.
    #[must_use]
    pub const fn with_roles(mut self, roles: PeerRoles) -> Self {
        self.roles = Some(roles);
        self
    }
}

/// Applies `rules` to `peers`. Only the first matching rule is used for each peer.
#[must_use]
pub fn apply_peer_rules(rules: &[PeerRule], peers: Vec<Peer>) -> Vec<Peer> {
    peers
        .into_iter()
        .filter_map(|mut peer| {
            let Some(rule) = rules.iter().find(|rule| rule.url_pattern.matches(&peer.url)) else {
                return Some(peer);
            };
            if rule.ignore {
                return None;
            }
            if let Some(roles) = rule.roles {
                peer.roles = roles;
            }
            Some(peer)
        })
        .collect()
}

/// Immutable view of a channel's live peers.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    /// Channel.
    channel_id: String,
    /// Peers in discovery order.
    peers: Vec<Peer>,
    /// Fetch time.
    fetched_at: Instant,
}

impl PeerSnapshot {
    /// Creates a snapshot stamped with the current time.
    #[must_use]
    pub fn new(channel_id: impl Into<String>, peers: Vec<Peer>) -> Self {
        Self {
            channel_id: channel_id.into(),
            peers,
            fetched_at: Instant::now(),
        }
    }

    /// Returns the channel.
    #[must_use]
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Returns all peers.
    #[must_use]
    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    /// Returns the snapshot age.
    #[must_use]
    pub fn age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.fetched_at)
    }

    /// Returns peers serving `role`, grouped by organization.
    #[must_use]
    pub fn orgs_with_role(&self, role: PeerRole) -> HashMap<String, Vec<Peer>> {
        peers_by_org(self.peers.iter().filter(|peer| peer.roles.has(role)))
    }
}

/// Caches discovery results per channel with a TTL, stale fallback, and optional
/// background refresh.
pub struct DiscoveryService {
    /// Channel served.
    channel_id: String,
    /// Peer source.
    backend: Arc<dyn DiscoveryBackend>,
    /// Ordered peer rules.
    rules: Vec<PeerRule>,
    /// Freshness window.
    ttl: Duration,
    /// Default bound for one backend fetch.
    timeout: Duration,
    /// Reader handle on the latest snapshot; replaced whole, never mutated.
    published: ArcShift<Option<Arc<PeerSnapshot>>>,
    /// Writer handle; held for the whole fetch so refreshes never overlap.
    publisher: Mutex<ArcShift<Option<Arc<PeerSnapshot>>>>,
}

impl fmt::Debug for DiscoveryService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryService")
            .field("channel_id", &self.channel_id)
            .field("rules", &self.rules.len())
            .field("ttl", &self.ttl)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl DiscoveryService {
    /// Creates a service with default TTL and timeout.
    #[must_use]
    pub fn new(channel_id: impl Into<String>, backend: Arc<dyn DiscoveryBackend>) -> Self {
        let published = ArcShift::new(None);
        let publisher = Mutex::new(published.clone());
        Self {
            channel_id: channel_id.into(),
            backend,
            rules: Vec::new(),
            ttl: DEFAULT_SNAPSHOT_TTL,
            timeout: DEFAULT_DISCOVERY_TIMEOUT,
            published,
            publisher,
        }
    }

    /// Sets the ordered peer rules.
    #[must_use]
    pub fn with_rules(mut self, rules: Vec<PeerRule>) -> Self {
        self.rules = rules;
        self
    }

    /// Sets the freshness window.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets the default per-fetch bound (minimum one millisecond).
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout.max(Duration::from_millis(1));
        self
    }

    /// Returns the channel served.
    #[must_use]
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    /// Returns the default per-fetch bound.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns the cached snapshot regardless of age.
    #[must_use]
    pub fn current(&self) -> Option<Arc<PeerSnapshot>> {
        (*self.published.shared_get()).clone()
    }

    /// Returns a fresh snapshot using the default fetch bound.
    ///
    /// # Errors
    ///
    /// See [`DiscoveryService::snapshot_within`].
    pub async fn snapshot(&self) -> Result<Arc<PeerSnapshot>, DiscoveryError> {
        self.snapshot_within(self.timeout, &CancelSignal::new()).await
    }

    /// Returns a fresh snapshot, refreshing when the cached one is older than the TTL.
    ///
    /// The fetch is bounded by `timeout` and abandoned when `cancel` fires. A failed refresh
    /// falls back to the stale snapshot when one exists; cancellation never does.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError::Cancelled`] on cancellation, otherwise the refresh error when
    /// nothing is cached.
    pub async fn snapshot_within(
        &self,
        timeout: Duration,
        cancel: &CancelSignal,
    ) -> Result<Arc<PeerSnapshot>, DiscoveryError> {
        let cached = self.current();
        if let Some(snapshot) = &cached
            && snapshot.age() < self.ttl
        {
            return Ok(snapshot.clone());
        }
        match self.refresh_within(timeout, cancel).await {
            Ok(snapshot) => Ok(snapshot),
            Err(error @ DiscoveryError::Cancelled { .. }) => Err(error),
            Err(error) => match cached {
                Some(stale) => {
                    tracing::warn!(
                        channel_id = %self.channel_id,
                        age_ms = u64::try_from(stale.age().as_millis()).unwrap_or(u64::MAX),
                        %error,
                        "discovery refresh failed; serving stale peer snapshot"
                    );
                    Ok(stale)
                }
                None => Err(error),
            },
        }
    }

    /// Fetches from the backend and swaps in a new snapshot, using the default fetch bound.
    ///
    /// # Errors
    ///
    /// See [`DiscoveryService::refresh_within`].
    pub async fn refresh(&self) -> Result<Arc<PeerSnapshot>, DiscoveryError> {
        self.refresh_within(self.timeout, &CancelSignal::new()).await
    }

    /// Fetches from the backend and swaps in a new snapshot.
    ///
    /// Concurrent refreshes run one at a time; readers keep the previous snapshot meanwhile.
    ///
    /// # Errors
    ///
    /// Returns [`DiscoveryError`] when the backend fails, exceeds `timeout` (minimum one
    /// millisecond), or `cancel` fires first.
    pub async fn refresh_within(
        &self,
        timeout: Duration,
        cancel: &CancelSignal,
    ) -> Result<Arc<PeerSnapshot>, DiscoveryError> {
        let timeout = timeout.max(Duration::from_millis(1));
        let cancelled = || DiscoveryError::Cancelled {
            channel_id: self.channel_id.clone(),
        };
        let mut publisher = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(cancelled()),
            publisher = self.publisher.lock() => publisher,
        };
        let started = Instant::now();
        let fetch = tokio::time::timeout(timeout, self.backend.peers(&self.channel_id));
        let fetched = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(cancelled()),
            fetched = fetch => fetched,
        };
        let peers = match fetched {
            Ok(Ok(peers)) => peers,
            Ok(Err(error)) => {
                tracing::warn!(channel_id = %self.channel_id, %error, "discovery refresh failed");
                return Err(error);
            }
            Err(_elapsed) => {
                let error = DiscoveryError::Timeout {
                    channel_id: self.channel_id.clone(),
                    timeout,
                };
                tracing::warn!(channel_id = %self.channel_id, %error, "discovery refresh failed");
                return Err(error);
            }
        };
        let peers = apply_peer_rules(&self.rules, peers);
        let snapshot = Arc::new(PeerSnapshot::new(self.channel_id.clone(), peers));
        publisher.update(Some(snapshot.clone()));
        tracing::debug!(
            channel_id = %self.channel_id,
            peers = snapshot.peers().len(),
            fetch_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "discovery snapshot refreshed"
        );
        Ok(snapshot)
    }

    /// Spawns a periodic refresh task that runs until `stop` fires.
    pub fn spawn_refresh(
        self: &Arc<Self>,
        interval: Duration,
        stop: CancelSignal,
    ) -> JoinHandle<()> {
        let service = Arc::clone(self);
        let period = interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut refresh_tick = tokio::time::interval(period);
            refresh_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = stop.cancelled() => break,
                    _ = refresh_tick.tick() => {
                        let _ = service.refresh().await;
                    }
                }
            }
            tracing::debug!(channel_id = %service.channel_id, "discovery refresh task stopped");
        })
    }
}
