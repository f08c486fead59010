//! Shared channel context and per-attempt request state.

use std::{fmt, sync::Arc};

use super::{
    EndorserTransport, InvokeError, InvokeOptions, OrdererTransport, Response, TargetFailure,
};
use crate::{
    commit::{CommitCoordinator, PendingCommit},
    config::{ChannelConfig, ConfigError, NetworkConfig, TimeoutKind, Timeouts},
    discovery::DiscoveryService,
    events::{EventService, TxStatusEvent},
    metrics::CallKind,
    proposal::{Envelope, ProposalResponse, Request, SignedProposal},
    providers::{OrdererEndpoint, Peer, PeerRole},
    selection::SelectionEngine,
    signing::Signer,
};

/// Long-lived collaborators for one ledger channel, shared by every call.
pub struct ChannelContext {
    /// Caller identity and crypto suite.
    signer: Signer,
    /// Live peer snapshots.
    discovery: Arc<DiscoveryService>,
    /// Endorser selection.
    selection: SelectionEngine,
    /// Commit waits.
    commits: CommitCoordinator,
    /// Event subscriptions.
    events: Arc<dyn EventService>,
    /// Optional endorsement transport.
    endorser_transport: Option<Arc<dyn EndorserTransport>>,
    /// Optional broadcast transport.
    orderer_transport: Option<Arc<dyn OrdererTransport>>,
    /// Known orderers.
    orderers: Vec<OrdererEndpoint>,
    /// Client-wide defaults.
    config: ChannelConfig,
}

impl fmt::Debug for ChannelContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelContext")
            .field("channel_id", &self.channel_id())
            .field("signer", &self.signer)
            .field("orderers", &self.orderers)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ChannelContext {
    /// Creates a context with no transports preconfigured.
    #[must_use]
    pub fn new(
        signer: Signer,
        discovery: Arc<DiscoveryService>,
        selection: SelectionEngine,
        events: Arc<dyn EventService>,
    ) -> Self {
        Self {
            signer,
            discovery,
            selection,
            commits: CommitCoordinator::new(events.clone()),
            events,
            endorser_transport: None,
            orderer_transport: None,
            orderers: Vec::new(),
            config: ChannelConfig::default(),
        }
    }

    /// Builds a context from a static network description.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when `network` fails validation.
    pub fn from_network(
        network: &NetworkConfig,
        config: ChannelConfig,
        signer: Signer,
        events: Arc<dyn EventService>,
    ) -> Result<Self, ConfigError> {
        network.validate()?;
        let config = config.normalized();
        let discovery = DiscoveryService::new(
            network.channel_id.clone(),
            Arc::new(network.static_discovery()),
        )
        .with_rules(network.peer_rules.clone())
        .with_ttl(config.discovery_ttl)
        .with_timeout(config.timeouts.discovery);
        let selection = SelectionEngine::new(Arc::new(network.policy_provider()))
            .with_max_groups(config.max_org_groups);
        Ok(Self::new(signer, Arc::new(discovery), selection, events)
            .with_orderers(network.orderers.clone())
            .with_config(config))
    }

    /// Sets the endorsement transport.
    #[must_use]
    pub fn with_endorser_transport(mut self, transport: Arc<dyn EndorserTransport>) -> Self {
        self.endorser_transport = Some(transport);
        self
    }

    /// Sets the broadcast transport.
    #[must_use]
    pub fn with_orderer_transport(mut self, transport: Arc<dyn OrdererTransport>) -> Self {
        self.orderer_transport = Some(transport);
        self
    }

    /// Sets the orderer endpoints.
    #[must_use]
    pub fn with_orderers(mut self, orderers: Vec<OrdererEndpoint>) -> Self {
        self.orderers = orderers;
        self
    }

    /// Sets call defaults. Discovery and selection keep the settings they were built with.
    #[must_use]
    pub fn with_config(mut self, config: ChannelConfig) -> Self {
        self.config = config.normalized();
        self
    }

    /// Returns the channel ID.
    #[must_use]
    pub fn channel_id(&self) -> &str {
        self.discovery.channel_id()
    }

    /// Returns the signer.
    #[must_use]
    pub const fn signer(&self) -> &Signer {
        &self.signer
    }

    /// Returns the discovery service.
    #[must_use]
    pub const fn discovery(&self) -> &Arc<DiscoveryService> {
        &self.discovery
    }

    /// Returns the selection engine.
    #[must_use]
    pub const fn selection(&self) -> &SelectionEngine {
        &self.selection
    }

    /// Returns the commit coordinator.
    #[must_use]
    pub const fn commits(&self) -> &CommitCoordinator {
        &self.commits
    }

    /// Returns the event layer.
    #[must_use]
    pub const fn events(&self) -> &Arc<dyn EventService> {
        &self.events
    }

    /// Returns the orderer endpoints.
    #[must_use]
    pub fn orderers(&self) -> &[OrdererEndpoint] {
        &self.orderers
    }

    /// Returns call defaults.
    #[must_use]
    pub const fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Returns the endorsement transport.
    ///
    /// # Errors
    ///
    /// Returns [`InvokeError::Configuration`] when none is set.
    pub fn endorser_transport(&self) -> Result<&Arc<dyn EndorserTransport>, InvokeError> {
        self.endorser_transport
            .as_ref()
            .ok_or_else(|| InvokeError::Configuration {
                message: "no endorser transport configured".to_owned(),
            })
    }

    /// Returns the broadcast transport.
    ///
    /// # Errors
    ///
    /// Returns [`InvokeError::Configuration`] when none is set.
    pub fn orderer_transport(&self) -> Result<&Arc<dyn OrdererTransport>, InvokeError> {
        self.orderer_transport
            .as_ref()
            .ok_or_else(|| InvokeError::Configuration {
                message: "no orderer transport configured".to_owned(),
            })
    }
}

/// Mutable state shared by the handlers of one attempt.
///
/// Built fresh for every attempt, so nothing leaks between retries.
pub struct RequestContext {
    /// Channel collaborators.
    channel: Arc<ChannelContext>,
    /// Operation kind.
    kind: CallKind,
    /// Caller request.
    request: Request,
    /// Per-call options.
    options: InvokeOptions,
    /// Effective timeouts.
    timeouts: Timeouts,
    /// 1-based attempt number.
    attempt: u32,
    /// Signed proposal for this attempt.
    proposal: SignedProposal,
    /// Peer role required of discovered endorsers.
    pub endorser_role: PeerRole,
    /// Resolved endorsers.
    pub targets: Vec<Peer>,
    /// Endorsement responses; validated once the validation stage has run.
    pub responses: Vec<ProposalResponse>,
    /// Endorsers that failed or timed out.
    pub failures: Vec<TargetFailure>,
    /// Envelope accepted by an orderer.
    pub envelope: Option<Envelope>,
    /// Commit subscription registered before broadcast.
    pub pending_commit: Option<PendingCommit>,
    /// Ledger status for the transaction.
    pub commit: Option<TxStatusEvent>,
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("tx_id", &self.tx_id())
            .field("kind", &self.kind)
            .field("attempt", &self.attempt)
            .field("targets", &self.targets.len())
            .field("responses", &self.responses.len())
            .field("failures", &self.failures)
            .field("commit", &self.commit)
            .finish_non_exhaustive()
    }
}

impl RequestContext {
    /// Creates attempt state around a signed proposal.
    #[must_use]
    pub fn new(
        channel: Arc<ChannelContext>,
        kind: CallKind,
        request: Request,
        options: InvokeOptions,
        proposal: SignedProposal,
        attempt: u32,
    ) -> Self {
        let defaults = channel
            .config()
            .timeouts
            .with(TimeoutKind::Discovery, channel.discovery().timeout());
        let timeouts = options.effective_timeouts(defaults);
        let endorser_role = match kind {
            CallKind::Query => PeerRole::ChaincodeQuery,
            CallKind::Execute | CallKind::Custom => PeerRole::EndorsingPeer,
        };
        Self {
            channel,
            kind,
            request,
            options,
            timeouts,
            attempt,
            proposal,
            endorser_role,
            targets: Vec::new(),
            responses: Vec::new(),
            failures: Vec::new(),
            envelope: None,
            pending_commit: None,
            commit: None,
        }
    }

    /// Returns the channel collaborators.
    #[must_use]
    pub const fn channel(&self) -> &Arc<ChannelContext> {
        &self.channel
    }

    /// Returns the operation kind.
    #[must_use]
    pub const fn kind(&self) -> CallKind {
        self.kind
    }

    /// Returns the caller request.
    #[must_use]
    pub const fn request(&self) -> &Request {
        &self.request
    }

    /// Returns per-call options.
    #[must_use]
    pub const fn options(&self) -> &InvokeOptions {
        &self.options
    }

    /// Returns the effective timeout for `kind`.
    #[must_use]
    pub const fn timeout(&self, kind: TimeoutKind) -> std::time::Duration {
        self.timeouts.get(kind)
    }

    /// Returns the 1-based attempt number.
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Returns the signed proposal.
    #[must_use]
    pub const fn proposal(&self) -> &SignedProposal {
        &self.proposal
    }

    /// Returns the transaction ID of this attempt.
    #[must_use]
    pub fn tx_id(&self) -> &str {
        self.proposal.tx_id()
    }

    /// Converts the finished attempt into a caller response.
    #[must_use]
    pub fn into_response(self) -> Response {
        let (payload, chaincode_status) = self
            .responses
            .first()
            .map(|response| (response.response.payload.clone(), response.response.status))
            .unwrap_or_default();
        Response {
            tx_id: self.proposal.tx_id().to_owned(),
            payload,
            chaincode_status,
            validation_code: self.commit.as_ref().map(|event| event.validation_code),
            block_number: self.commit.as_ref().map(|event| event.block_number),
            responses: self.responses,
        }
    }
}
