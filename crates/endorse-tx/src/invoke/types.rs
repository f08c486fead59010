//! Shared invocation types, errors, and transport traits.

use std::{collections::BTreeSet, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    cancel::CancelSignal,
    commit::CommitError,
    config::{TimeoutKind, Timeouts},
    discovery::DiscoveryError,
    events::ValidationCode,
    proposal::{BroadcastAck, Envelope, ProposalResponse, SignedProposal},
    providers::{OrdererEndpoint, Peer},
    retry::{Classify, ErrorCode, RetryPolicy},
    selection::{PeerFilter, PeerSorter, SelectionError, SelectionOptions},
    signing::CryptoError,
};

/// Transport-layer error representation.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum TransportError {
    /// Peer or orderer could not be reached or failed mid-call.
    #[error("transport failure: {message}")]
    Failure {
        /// Human-readable description.
        message: String,
    },
}

/// Endorsement transport to peers.
#[async_trait]
pub trait EndorserTransport: Send + Sync {
    /// Sends one signed proposal to `peer` and returns its response.
    async fn send_proposal(
        &self,
        peer: &Peer,
        proposal: &SignedProposal,
    ) -> Result<ProposalResponse, TransportError>;
}

/// Broadcast transport to orderers.
#[async_trait]
pub trait OrdererTransport: Send + Sync {
    /// Sends one envelope to `orderer` and returns its acknowledgement.
    async fn broadcast(
        &self,
        orderer: &OrdererEndpoint,
        envelope: &Envelope,
    ) -> Result<BroadcastAck, TransportError>;
}

/// One endorser that did not produce a response.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TargetFailure {
    /// Peer URL.
    pub peer_url: String,
    /// Failure description.
    pub reason: String,
}

/// Invocation-level error taxonomy.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum InvokeError {
    /// Bad or missing configuration, policy, or transport.
    #[error("configuration error: {message}")]
    Configuration {
        /// Human-readable description.
        message: String,
    },
    /// Filters or availability left no group able to satisfy the policy.
    #[error("no eligible peers for organizations {missing:?}")]
    NoEligiblePeers {
        /// Organizations that could not be covered.
        missing: BTreeSet<String>,
    },
    /// Endorsers disagreed, or no endorser produced a usable response.
    #[error("endorsement mismatch: {message}")]
    EndorsementMismatch {
        /// Human-readable description.
        message: String,
    },
    /// An endorser returned a chaincode status outside the success range.
    #[error("peer `{peer_url}` returned chaincode status {status}: {message}")]
    ChaincodeStatus {
        /// Responding peer.
        peer_url: String,
        /// Chaincode status code.
        status: i32,
        /// Chaincode message.
        message: String,
    },
    /// An endorsement signature did not verify.
    #[error("invalid endorsement signature from peer `{peer_url}`")]
    InvalidEndorsement {
        /// Responding peer.
        peer_url: String,
    },
    /// Peers or orderers were unreachable or timed out.
    #[error("transient network failure: {message}")]
    TransientNetwork {
        /// Human-readable description.
        message: String,
    },
    /// The orderer explicitly refused the envelope.
    #[error("orderer `{orderer_url}` rejected transaction with status {status}: {info}")]
    OrdererRejected {
        /// Rejecting orderer.
        orderer_url: String,
        /// Broadcast status.
        status: i32,
        /// Orderer detail.
        info: String,
    },
    /// No commit status arrived in time; outcome unknown.
    #[error("transaction `{tx_id}` not confirmed within {timeout:?}")]
    CommitTimeout {
        /// Transaction ID.
        tx_id: String,
        /// Configured wait.
        timeout: Duration,
    },
    /// Commit wait was cancelled; outcome unknown.
    #[error("commit wait for transaction `{tx_id}` cancelled")]
    CommitCancelled {
        /// Transaction ID.
        tx_id: String,
    },
    /// The event stream dropped.
    #[error("event connection lost: {reason}")]
    ConnectionLost {
        /// Disconnect description.
        reason: String,
    },
    /// The ledger committed the transaction as invalid.
    #[error("transaction `{tx_id}` invalidated with code {code} in block {block_number}")]
    TxInvalidated {
        /// Transaction ID.
        tx_id: String,
        /// Validation code reported by the ledger.
        code: ValidationCode,
        /// Block carrying the transaction.
        block_number: u64,
    },
    /// The caller cancelled before the transaction was submitted.
    #[error("invocation cancelled")]
    Cancelled,
    /// Encoding, signing, or internal synchronization failure.
    #[error("internal error: {message}")]
    Internal {
        /// Human-readable description.
        message: String,
    },
    /// Failure raised by a named handler stage.
    #[error("stage `{stage}` failed: {source}")]
    Stage {
        /// Handler name.
        stage: String,
        /// Underlying failure.
        source: Box<InvokeError>,
    },
}

impl InvokeError {
    /// Tags the error with the stage that raised it, keeping the innermost stage.
    #[must_use]
    pub fn in_stage(self, stage: &str) -> Self {
        match self {
            Self::Stage { .. } => self,
            other => Self::Stage {
                stage: stage.to_owned(),
                source: Box::new(other),
            },
        }
    }

    /// Returns the error with stage tags removed.
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    /// Returns the originating stage name, when known.
    #[must_use]
    pub fn stage(&self) -> Option<&str> {
        match self {
            Self::Stage { stage, .. } => Some(stage),
            _ => None,
        }
    }
}

impl Classify for InvokeError {
    fn error_code(&self) -> ErrorCode {
        match self {
            Self::Configuration { .. } => ErrorCode::Configuration,
            Self::NoEligiblePeers { .. } => ErrorCode::NoEligiblePeers,
            Self::EndorsementMismatch { .. } => ErrorCode::EndorsementMismatch,
            Self::ChaincodeStatus { status, .. } => ErrorCode::ChaincodeStatus(*status),
            Self::InvalidEndorsement { .. } => ErrorCode::InvalidEndorsement,
            Self::TransientNetwork { .. } => ErrorCode::TransientNetwork,
            Self::OrdererRejected { .. } => ErrorCode::OrdererRejected,
            Self::CommitTimeout { .. } => ErrorCode::CommitTimeout,
            Self::CommitCancelled { .. } => ErrorCode::CommitCancelled,
            Self::ConnectionLost { .. } => ErrorCode::ConnectionLost,
            Self::TxInvalidated { code, .. } => ErrorCode::TxInvalidated(*code),
            Self::Cancelled => ErrorCode::Cancelled,
            Self::Internal { .. } => ErrorCode::Internal,
            Self::Stage { source, .. } => source.error_code(),
        }
    }
}

impl From<SelectionError> for InvokeError {
    fn from(error: SelectionError) -> Self {
        match error {
            SelectionError::NoEligiblePeers { missing } => Self::NoEligiblePeers { missing },
            other => Self::Configuration {
                message: other.to_string(),
            },
        }
    }
}

impl From<CommitError> for InvokeError {
    fn from(error: CommitError) -> Self {
        match error {
            CommitError::TimedOut { tx_id, timeout } => Self::CommitTimeout { tx_id, timeout },
            CommitError::Cancelled { tx_id } => Self::CommitCancelled { tx_id },
            CommitError::ConnectionLost { tx_id, reason } => Self::ConnectionLost {
                reason: format!("{reason} (transaction `{tx_id}`)"),
            },
            CommitError::Registration { source } => Self::ConnectionLost {
                reason: source.to_string(),
            },
        }
    }
}

impl From<DiscoveryError> for InvokeError {
    fn from(error: DiscoveryError) -> Self {
        match error {
            DiscoveryError::Cancelled { .. } => Self::Cancelled,
            error => Self::TransientNetwork {
                message: error.to_string(),
            },
        }
    }
}

impl From<CryptoError> for InvokeError {
    fn from(error: CryptoError) -> Self {
        Self::Internal {
            message: error.to_string(),
        }
    }
}

/// Hook called before each retry with the failed error, attempt number, and backoff.
pub type BeforeRetryHook = Arc<dyn Fn(&InvokeError, u32, Duration) + Send + Sync>;

/// Per-call options; unset fields fall back to the client's [`crate::ChannelConfig`].
#[derive(Clone, Default)]
pub struct InvokeOptions {
    /// Explicit endorsers used verbatim instead of discovery and selection.
    pub targets: Option<Vec<Peer>>,
    /// Filter and sorter applied during selection.
    pub selection: SelectionOptions,
    /// Retry policy override.
    pub retry: Option<RetryPolicy>,
    /// Timeout overrides.
    pub timeouts: Vec<(TimeoutKind, Duration)>,
    /// Cooperative cancellation signal.
    pub cancel: CancelSignal,
    /// Optional before-retry hook.
    pub before_retry: Option<BeforeRetryHook>,
}

impl fmt::Debug for InvokeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvokeOptions")
            .field("targets", &self.targets)
            .field("retry", &self.retry)
            .field("timeouts", &self.timeouts)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl InvokeOptions {
    /// Creates empty options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends to exactly these peers.
    #[must_use]
    pub fn with_targets(mut self, targets: Vec<Peer>) -> Self {
        self.targets = Some(targets);
        self
    }

    /// Sets the selection peer filter.
    #[must_use]
    pub fn with_target_filter(mut self, filter: Arc<dyn PeerFilter>) -> Self {
        self.selection = self.selection.with_filter(filter);
        self
    }

    /// Sets the selection peer sorter.
    #[must_use]
    pub fn with_peer_sorter(mut self, sorter: Arc<dyn PeerSorter>) -> Self {
        self.selection = self.selection.with_sorter(sorter);
        self
    }

    /// Overrides the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Overrides one timeout.
    #[must_use]
    pub fn with_timeout(mut self, kind: TimeoutKind, timeout: Duration) -> Self {
        self.timeouts.retain(|(existing, _)| *existing != kind);
        self.timeouts.push((kind, timeout));
        self
    }

    /// Uses `cancel` for every suspension point of the call.
    #[must_use]
    pub fn with_cancel_signal(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    /// Sets the before-retry hook.
    #[must_use]
    pub fn with_before_retry<H>(mut self, hook: H) -> Self
    where
        H: Fn(&InvokeError, u32, Duration) + Send + Sync + 'static,
    {
        self.before_retry = Some(Arc::new(hook));
        self
    }

    /// Applies overrides on top of `defaults`.
    #[must_use]
    pub fn effective_timeouts(&self, defaults: Timeouts) -> Timeouts {
        self.timeouts
            .iter()
            .fold(defaults, |timeouts, (kind, timeout)| timeouts.with(*kind, *timeout))
    }
}

/// Result of a successful query or execute.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Response {
    /// Transaction ID of the successful attempt.
    pub tx_id: String,
    /// Agreed application payload.
    pub payload: Vec<u8>,
    /// Chaincode status reported by the endorsers.
    pub chaincode_status: i32,
    /// Ledger validation code; `None` for queries.
    pub validation_code: Option<ValidationCode>,
    /// Block carrying the transaction; `None` for queries.
    pub block_number: Option<u64>,
    /// Validated endorsement responses.
    pub responses: Vec<ProposalResponse>,
}
