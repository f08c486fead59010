#![forbid(unsafe_code)]

//! Client SDK for endorsing, ordering, and confirming transactions on a permissioned ledger
//! channel.

/// Cooperative cancellation signal.
pub mod cancel;
/// Commit coordinator for transaction status waits.
pub mod commit;
/// Client defaults and static network descriptions.
pub mod config;
/// Peer discovery backends, peer rules, and snapshot caching.
pub mod discovery;
/// Ledger event types and the event subscription layer.
pub mod events;
/// Channel client and proposal/response handler pipeline.
pub mod invoke;
/// Call instrumentation capability.
pub mod metrics;
/// `*` glob patterns for peer rules and event filters.
pub mod pattern;
/// Endorsement policy parsing and evaluation.
pub mod policy;
/// Transaction proposals, endorsement responses, and envelopes.
pub mod proposal;
/// Peer model and policy source traits.
pub mod providers;
/// Retry invoker and error classification.
pub mod retry;
/// Endorser selection engine.
pub mod selection;
/// Signing boundary types.
pub mod signing;

pub use cancel::CancelSignal;
pub use commit::{CommitCoordinator, CommitError, CommitState, PendingCommit};
pub use config::{
    ChaincodeConfig, ChannelConfig, ConfigError, NetworkConfig, TimeoutKind, Timeouts,
};
pub use discovery::{
    DiscoveryBackend, DiscoveryError, DiscoveryService, PeerRule, PeerSnapshot, StaticDiscovery,
};
pub use events::{
    ChaincodeEvent, ChaincodeEventNotification, EventError, EventService, LocalEventHub,
    SubscriptionHandle, TxStatusEvent, TxStatusNotification, ValidationCode,
};
pub use invoke::{
    ChaincodeEventStream, ChannelClient, ChannelContext, EndorserTransport, Handler,
    HandlerChain, InvokeError, InvokeOptions, Next, OrdererTransport, RequestContext, Response,
    TargetFailure, TransportError,
};
pub use metrics::{CallCounters, CallKind, CallStats, MetricsRecorder, NoopRecorder};
pub use pattern::Pattern;
pub use policy::{Policy, PolicyError, Principal, PrincipalRole};
pub use proposal::{
    BroadcastAck, ChaincodeCall, ChaincodeResponse, Endorsement, Envelope, ProposalResponse,
    Request, SignedProposal, TransactionProposal,
};
pub use providers::{
    OrdererEndpoint, Peer, PeerRole, PeerRoles, PolicyLookupError, PolicyProvider,
    StaticPolicyProvider,
};
pub use retry::{Classify, ErrorCode, RetryError, RetryPolicy};
pub use selection::{
    ExcludePeers, MinLedgerHeight, PeerFilter, PeerSorter, PreferHighestLedger, SelectionEngine,
    SelectionError, SelectionOptions,
};
pub use signing::{CryptoError, CryptoSuite, SerializedIdentity, Signer, SigningIdentity};
