//! Commit coordinator: waits for a transaction's ledger status with timeout and cancellation.

use std::{fmt, sync::Arc, time::Duration};

use thiserror::Error;

use crate::{
    cancel::CancelSignal,
    events::{
        EventError, EventService, SubscriptionHandle, TxStatusEvent, TxStatusNotification,
        TxStatusReceiver,
    },
};

/// Lifecycle of one commit wait.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum CommitState {
    /// Registered, waiting for a status.
    Subscribed,
    /// A matching status arrived.
    Delivered,
    /// The timeout expired first.
    TimedOut,
    /// The caller cancelled first.
    Cancelled,
    /// The event stream dropped first.
    ConnectionLost,
}

/// Commit-wait failures.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum CommitError {
    /// Status subscription could not be registered.
    #[error("failed to register commit subscription: {source}")]
    Registration {
        /// Event-layer error.
        source: EventError,
    },
    /// No status arrived before the timeout; outcome unknown.
    #[error("transaction `{tx_id}` not confirmed within {timeout:?}")]
    TimedOut {
        /// Transaction ID.
        tx_id: String,
        /// Configured wait.
        timeout: Duration,
    },
    /// The caller cancelled the wait; outcome unknown.
    #[error("commit wait for transaction `{tx_id}` cancelled")]
    Cancelled {
        /// Transaction ID.
        tx_id: String,
    },
    /// The event stream dropped during the wait.
    #[error("event stream lost while awaiting transaction `{tx_id}`: {reason}")]
    ConnectionLost {
        /// Transaction ID.
        tx_id: String,
        /// Disconnect description.
        reason: String,
    },
}

impl CommitError {
    /// Terminal state this error corresponds to.
    #[must_use]
    pub const fn state(&self) -> CommitState {
        match self {
            Self::Registration { .. } | Self::ConnectionLost { .. } => CommitState::ConnectionLost,
            Self::TimedOut { .. } => CommitState::TimedOut,
            Self::Cancelled { .. } => CommitState::Cancelled,
        }
    }
}

/// Registers and awaits transaction-status subscriptions.
#[derive(Clone)]
pub struct CommitCoordinator {
    /// Event subscription layer.
    events: Arc<dyn EventService>,
}

impl fmt::Debug for CommitCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommitCoordinator").finish_non_exhaustive()
    }
}

impl CommitCoordinator {
    /// Creates a coordinator over an event service.
    #[must_use]
    pub fn new(events: Arc<dyn EventService>) -> Self {
        Self { events }
    }

    /// Registers interest in `tx_id` without waiting yet.
    ///
    /// Registering before the envelope is broadcast guarantees the status cannot be missed.
    ///
    /// # Errors
    ///
    /// Returns [`CommitError::Registration`] when the event layer rejects the registration.
    pub fn register(&self, tx_id: &str) -> Result<PendingCommit, CommitError> {
        let (handle, receiver) = self
            .events
            .register_tx_status(tx_id)
            .map_err(|source| CommitError::Registration { source })?;
        tracing::debug!(tx_id, handle = handle.id(), "registered commit subscription");
        Ok(PendingCommit {
            tx_id: tx_id.to_owned(),
            handle,
            receiver,
            events: self.events.clone(),
            released: false,
        })
    }

    /// Registers and waits in one step.
    ///
    /// # Errors
    ///
    /// See [`PendingCommit::wait`].
    pub async fn await_commit(
        &self,
        tx_id: &str,
        timeout: Duration,
        cancel: &CancelSignal,
    ) -> Result<TxStatusEvent, CommitError> {
        self.register(tx_id)?.wait(timeout, cancel).await
    }
}

/// A registered status subscription. Unregisters exactly once, on wait completion or drop.
pub struct PendingCommit {
    /// Transaction ID.
    tx_id: String,
    /// Event-layer handle.
    handle: SubscriptionHandle,
    /// Notification source.
    receiver: TxStatusReceiver,
    /// Event layer used for unregistration.
    events: Arc<dyn EventService>,
    /// Set once unregistered.
    released: bool,
}

impl fmt::Debug for PendingCommit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingCommit")
            .field("tx_id", &self.tx_id)
            .field("handle", &self.handle)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl PendingCommit {
    /// Returns the transaction ID.
    #[must_use]
    pub fn tx_id(&self) -> &str {
        &self.tx_id
    }

    /// Waits for the first of: matching status, timeout, cancellation, or stream loss.
    ///
    /// # Errors
    ///
    /// Returns [`CommitError::TimedOut`], [`CommitError::Cancelled`], or
    /// [`CommitError::ConnectionLost`] for the corresponding outcome.
    pub async fn wait(
        mut self,
        timeout: Duration,
        cancel: &CancelSignal,
    ) -> Result<TxStatusEvent, CommitError> {
        let tx_id = self.tx_id.clone();
        let outcome = {
            let receiver = &mut self.receiver;
            let receive = async {
                loop {
                    match receiver.recv().await {
                        Some(TxStatusNotification::Status(event)) if event.tx_id == tx_id => {
                            return Ok(event);
                        }
                        Some(TxStatusNotification::Status(event)) => {
                            tracing::debug!(
                                tx_id = %tx_id,
                                foreign = %event.tx_id,
                                "ignoring status for another transaction"
                            );
                        }
                        Some(TxStatusNotification::StreamLost { reason }) => return Err(reason),
                        None => return Err("event subscription closed".to_owned()),
                    }
                }
            };
            tokio::select! {
                biased;
                () = cancel.cancelled() => Err(CommitError::Cancelled { tx_id: tx_id.clone() }),
                received = tokio::time::timeout(timeout, receive) => match received {
                    Ok(Ok(event)) => Ok(event),
                    Ok(Err(reason)) => Err(CommitError::ConnectionLost {
                        tx_id: tx_id.clone(),
                        reason,
                    }),
                    Err(_) => Err(CommitError::TimedOut {
                        tx_id: tx_id.clone(),
                        timeout,
                    }),
                },
            }
        };
        self.release();
        match &outcome {
            Ok(event) => tracing::debug!(
                tx_id = %tx_id,
                state = ?CommitState::Delivered,
                code = %event.validation_code,
                block = event.block_number,
                "commit wait finished"
            ),
            Err(error) => tracing::debug!(
                tx_id = %tx_id,
                state = ?error.state(),
                %error,
                "commit wait finished"
            ),
        }
        outcome
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.events.unregister(self.handle);
        }
    }
}

impl Drop for PendingCommit {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio::time::Instant;

    use super::*;
    use crate::{
        events::{LocalEventHub, ValidationCode},
        pattern::Pattern,
    };

    /// Event layer that records unregister calls and forwards to a real hub.
    #[derive(Default)]
    struct SpyEvents {
        hub: LocalEventHub,
        unregistered: Mutex<u64>,
    }

    impl SpyEvents {
        fn unregister_calls(&self) -> u64 {
            self.unregistered.lock().map(|calls| *calls).unwrap_or_default()
        }
    }

    impl EventService for SpyEvents {
        fn register_tx_status(
            &self,
            tx_id: &str,
        ) -> Result<(SubscriptionHandle, TxStatusReceiver), EventError> {
            self.hub.register_tx_status(tx_id)
        }

        fn register_chaincode_events(
            &self,
            chaincode_id: &str,
            event_filter: &Pattern,
        ) -> Result<(SubscriptionHandle, crate::events::ChaincodeEventReceiver), EventError>
        {
            self.hub.register_chaincode_events(chaincode_id, event_filter)
        }

        fn unregister(&self, handle: SubscriptionHandle) {
            if let Ok(mut calls) = self.unregistered.lock() {
                *calls = calls.saturating_add(1);
            }
            self.hub.unregister(handle);
        }
    }

    fn valid(tx_id: &str) -> TxStatusEvent {
        TxStatusEvent {
            tx_id: tx_id.to_owned(),
            validation_code: ValidationCode::Valid,
            block_number: 12,
            source_url: "peer0.org1:7051".to_owned(),
        }
    }

    #[tokio::test]
    async fn delivered_status_is_returned_and_unregistered_once() {
        let spy = Arc::new(SpyEvents::default());
        let coordinator = CommitCoordinator::new(spy.clone());
        let pending = coordinator.register("tx1");
        assert!(pending.is_ok());
        let Ok(pending) = pending else {
            return;
        };
        assert!(spy.hub.publish_tx_status(valid("tx1")));
        let result = pending
            .wait(Duration::from_secs(5), &CancelSignal::new())
            .await;
        assert_eq!(result, Ok(valid("tx1")));
        assert_eq!(spy.unregister_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_no_earlier_than_configured() {
        let spy = Arc::new(SpyEvents::default());
        let coordinator = CommitCoordinator::new(spy.clone());
        let timeout = Duration::from_secs(3);
        let started = Instant::now();
        let result = coordinator
            .await_commit("tx1", timeout, &CancelSignal::new())
            .await;
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(CommitError::TimedOut { .. })));
        assert!(elapsed >= timeout);
        assert!(elapsed <= timeout + Duration::from_millis(50));
        assert_eq!(spy.unregister_calls(), 1);
        assert_eq!(spy.hub.active_registrations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_returns_promptly_and_unregisters_once() {
        let spy = Arc::new(SpyEvents::default());
        let coordinator = CommitCoordinator::new(spy.clone());
        let cancel = CancelSignal::new();
        let trigger = cancel.clone();
        let _canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let started = Instant::now();
        let result = coordinator
            .await_commit("tx1", Duration::from_secs(60), &cancel)
            .await;

        assert_eq!(
            result,
            Err(CommitError::Cancelled {
                tx_id: "tx1".to_owned()
            })
        );
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(spy.unregister_calls(), 1);
    }

    #[tokio::test]
    async fn stream_loss_surfaces_connection_lost() {
        let spy = Arc::new(SpyEvents::default());
        let coordinator = CommitCoordinator::new(spy.clone());
        let pending = coordinator.register("tx1");
        assert!(pending.is_ok());
        let Ok(pending) = pending else {
            return;
        };
        spy.hub.notify_stream_lost("deliver stream reset");
        let result = pending
            .wait(Duration::from_secs(5), &CancelSignal::new())
            .await;
        assert!(matches!(
            result,
            Err(CommitError::ConnectionLost { ref reason, .. }) if reason == "deliver stream reset"
        ));
        if let Err(error) = result {
            assert_eq!(error.state(), CommitState::ConnectionLost);
        }
        assert_eq!(spy.unregister_calls(), 1);
    }

    #[test]
    fn dropping_a_pending_commit_unregisters() {
        let spy = Arc::new(SpyEvents::default());
        let coordinator = CommitCoordinator::new(spy.clone());
        let pending = coordinator.register("tx1");
        assert!(pending.is_ok());
        drop(pending);
        assert_eq!(spy.unregister_calls(), 1);
        assert_eq!(spy.hub.active_registrations(), 0);
    }
}
