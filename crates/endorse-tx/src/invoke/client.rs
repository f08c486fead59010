//! Channel client: query, execute, custom chains, and chaincode event subscriptions.

use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::task::JoinHandle;

use super::{ChannelContext, HandlerChain, InvokeError, InvokeOptions, RequestContext, Response};
use crate::{
    cancel::CancelSignal,
    events::{
        ChaincodeEvent, ChaincodeEventNotification, ChaincodeEventReceiver, EventService,
        SubscriptionHandle,
    },
    metrics::{CallKind, MetricsRecorder, NoopRecorder},
    pattern::Pattern,
    proposal::{Request, TransactionProposal},
    retry::{self, Classify, RetryError},
};

/// Client bound to one ledger channel.
#[derive(Clone)]
pub struct ChannelClient {
    /// Shared channel collaborators.
    context: Arc<ChannelContext>,
    /// Call instrumentation.
    metrics: Arc<dyn MetricsRecorder>,
}

impl fmt::Debug for ChannelClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelClient")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl ChannelClient {
    /// Creates a client without instrumentation.
    #[must_use]
    pub fn new(context: ChannelContext) -> Self {
        Self {
            context: Arc::new(context),
            metrics: Arc::new(NoopRecorder),
        }
    }

    /// Sets the metrics recorder.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Returns the channel context.
    #[must_use]
    pub const fn context(&self) -> &Arc<ChannelContext> {
        &self.context
    }

    /// Runs the read-only pipeline; nothing is sent to an orderer.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError`] wrapping the final attempt's [`InvokeError`].
    pub async fn query(
        &self,
        request: &Request,
        options: InvokeOptions,
    ) -> Result<Response, RetryError<InvokeError>> {
        self.run(CallKind::Query, &HandlerChain::query(), request, options)
            .await
    }

    /// Runs the full pipeline through commit confirmation.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError`] wrapping the final attempt's [`InvokeError`].
    pub async fn execute(
        &self,
        request: &Request,
        options: InvokeOptions,
    ) -> Result<Response, RetryError<InvokeError>> {
        self.run(CallKind::Execute, &HandlerChain::execute(), request, options)
            .await
    }

    /// Runs a caller-supplied chain under the same retry, proposal, and metrics handling.
    ///
    /// # Errors
    ///
    /// Returns [`RetryError`] wrapping the final attempt's [`InvokeError`].
    pub async fn invoke_handler(
        &self,
        chain: &HandlerChain,
        request: &Request,
        options: InvokeOptions,
    ) -> Result<Response, RetryError<InvokeError>> {
        self.run(CallKind::Custom, chain, request, options).await
    }

    /// Subscribes to chaincode events whose name matches `event_filter`.
    ///
    /// # Errors
    ///
    /// Returns [`InvokeError::ConnectionLost`] when the event layer refuses the registration.
    pub fn register_chaincode_event(
        &self,
        chaincode_id: &str,
        event_filter: impl Into<Pattern>,
    ) -> Result<ChaincodeEventStream, InvokeError> {
        let event_filter = event_filter.into();
        let events = self.context.events().clone();
        let (handle, receiver) = events
            .register_chaincode_events(chaincode_id, &event_filter)
            .map_err(|error| InvokeError::ConnectionLost {
                reason: error.to_string(),
            })?;
        tracing::debug!(
            chaincode_id,
            filter = %event_filter.as_str(),
            handle = handle.id(),
            "registered chaincode event subscription"
        );
        Ok(ChaincodeEventStream {
            handle,
            receiver,
            events,
            released: false,
        })
    }

    /// Starts periodic discovery refresh at the configured interval until `stop` fires.
    #[must_use]
    pub fn spawn_discovery_refresh(&self, stop: CancelSignal) -> JoinHandle<()> {
        self.context
            .discovery()
            .spawn_refresh(self.context.config().discovery_refresh, stop)
    }

    async fn run(
        &self,
        kind: CallKind,
        chain: &HandlerChain,
        request: &Request,
        options: InvokeOptions,
    ) -> Result<Response, RetryError<InvokeError>> {
        let started = Instant::now();
        let policy = options
            .retry
            .clone()
            .unwrap_or_else(|| self.context.config().retry.clone());
        let cancel = options.cancel.clone();
        let hook = options.before_retry.clone();
        let options = &options;
        let result = retry::invoke_with_hook(
            &policy,
            &cancel,
            |error: &InvokeError, attempt, backoff: Duration| {
                self.metrics.record_retry(kind, attempt);
                if let Some(hook) = &hook {
                    hook(error, attempt, backoff);
                }
            },
            |attempt| self.attempt(kind, chain, request, options, attempt),
        )
        .await;

        let failure = result.as_ref().err().map(|error| error.error_code());
        self.metrics.record_call(kind, started.elapsed(), failure);
        match &result {
            Ok(response) => tracing::debug!(
                ?kind,
                tx_id = %response.tx_id,
                validation = ?response.validation_code,
                "call succeeded"
            ),
            Err(error) => tracing::debug!(
                ?kind,
                attempts = error.attempts,
                stage = error.cause().stage().unwrap_or("client"),
                %error,
                "call failed"
            ),
        }
        result
    }

    async fn attempt(
        &self,
        kind: CallKind,
        chain: &HandlerChain,
        request: &Request,
        options: &InvokeOptions,
        attempt: u32,
    ) -> Result<Response, InvokeError> {
        if options.cancel.is_cancelled() {
            return Err(InvokeError::Cancelled);
        }
        let signer = self.context.signer();
        let proposal =
            TransactionProposal::new(self.context.channel_id(), request, signer).sign(signer)?;
        tracing::debug!(
            ?kind,
            attempt,
            tx_id = %proposal.tx_id(),
            chaincode_id = %request.chaincode_id,
            function = %request.function,
            "starting attempt"
        );
        let mut ctx = RequestContext::new(
            self.context.clone(),
            kind,
            request.clone(),
            options.clone(),
            proposal,
            attempt,
        );
        chain.run(&mut ctx).await?;
        Ok(ctx.into_response())
    }
}

/// Explicit chaincode event subscription. Unregisters exactly once, on close or drop.
pub struct ChaincodeEventStream {
    /// Event-layer handle.
    handle: SubscriptionHandle,
    /// Notification source.
    receiver: ChaincodeEventReceiver,
    /// Event layer used for unregistration.
    events: Arc<dyn EventService>,
    /// Set once unregistered.
    released: bool,
}

impl fmt::Debug for ChaincodeEventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChaincodeEventStream")
            .field("handle", &self.handle)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl ChaincodeEventStream {
    /// Returns the subscription handle.
    #[must_use]
    pub const fn handle(&self) -> SubscriptionHandle {
        self.handle
    }

    /// Waits for the next matching event.
    ///
    /// # Errors
    ///
    /// Returns [`InvokeError::ConnectionLost`] when the stream drops or the subscription closes.
    pub async fn next(&mut self) -> Result<ChaincodeEvent, InvokeError> {
        match self.receiver.recv().await {
            Some(ChaincodeEventNotification::Event(event)) => Ok(event),
            Some(ChaincodeEventNotification::StreamLost { reason }) => {
                Err(InvokeError::ConnectionLost { reason })
            }
            None => Err(InvokeError::ConnectionLost {
                reason: "chaincode event subscription closed".to_owned(),
            }),
        }
    }

    /// Waits up to `timeout`; `Ok(None)` means no event arrived in time.
    ///
    /// # Errors
    ///
    /// See [`ChaincodeEventStream::next`].
    pub async fn next_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<ChaincodeEvent>, InvokeError> {
        match tokio::time::timeout(timeout, self.next()).await {
            Ok(received) => received.map(Some),
            Err(_elapsed) => Ok(None),
        }
    }

    /// Unregisters the subscription.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.events.unregister(self.handle);
        }
    }
}

impl Drop for ChaincodeEventStream {
    fn drop(&mut self) {
        self.release();
    }
}
