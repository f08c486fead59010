//! Channel client and the proposal/response handler pipeline.

/// Channel client implementation and event subscriptions.
mod client;
/// Shared channel context and per-attempt state.
mod context;
/// Handler trait and chain dispatch.
mod handler;
/// Built-in pipeline stages.
pub mod stages;
/// Shared invocation types, errors, and transport traits.
mod types;

pub use client::{ChaincodeEventStream, ChannelClient};
pub use context::{ChannelContext, RequestContext};
pub use handler::{Handler, HandlerChain, Next};
pub use types::{
    BeforeRetryHook, EndorserTransport, InvokeError, InvokeOptions, OrdererTransport, Response,
    TargetFailure, TransportError,
};
