//! Transaction-status and chaincode event subscriptions.
//!
//! Subscriptions are explicit: register, receive from the returned channel, unregister.
//! [`LocalEventHub`] is the in-process implementation a block-delivery client feeds.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::pattern::Pattern;

/// Ledger validation outcome of a committed transaction.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum ValidationCode {
    /// Transaction is valid and its writes were applied.
    Valid,
    /// Envelope was empty.
    NilEnvelope,
    /// Payload could not be decoded.
    BadPayload,
    /// Creator signature was invalid.
    BadCreatorSignature,
    /// Transaction ID was already committed.
    DuplicateTxId,
    /// Endorsements did not satisfy the endorsement policy.
    EndorsementPolicyFailure,
    /// A read key changed between simulation and commit.
    MvccReadConflict,
    /// A range query result changed between simulation and commit.
    PhantomReadConflict,
    /// Chaincode definition changed between endorsement and commit.
    ChaincodeVersionConflict,
    /// Transaction was not validated.
    NotValidated,
    /// Invalid for a reason without its own code.
    InvalidOtherReason,
    /// Any other numeric code.
    Other(i32),
}

impl ValidationCode {
    /// Maps a numeric ledger code.
    #[must_use]
    pub const fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Valid,
            1 => Self::NilEnvelope,
            2 => Self::BadPayload,
            4 => Self::BadCreatorSignature,
            9 => Self::DuplicateTxId,
            10 => Self::EndorsementPolicyFailure,
            11 => Self::MvccReadConflict,
            12 => Self::PhantomReadConflict,
            18 => Self::ChaincodeVersionConflict,
            254 => Self::NotValidated,
            255 => Self::InvalidOtherReason,
            other => Self::Other(other),
        }
    }

    /// Returns the numeric ledger code.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::Valid => 0,
            Self::NilEnvelope => 1,
            Self::BadPayload => 2,
            Self::BadCreatorSignature => 4,
            Self::DuplicateTxId => 9,
            Self::EndorsementPolicyFailure => 10,
            Self::MvccReadConflict => 11,
            Self::PhantomReadConflict => 12,
            Self::ChaincodeVersionConflict => 18,
            Self::NotValidated => 254,
            Self::InvalidOtherReason => 255,
            Self::Other(code) => code,
        }
    }

    /// Returns true for [`Self::Valid`].
    #[must_use]
    pub const fn is_valid(self) -> bool {
        matches!(self, Self::Valid)
    }
}

impl fmt::Display for ValidationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Valid => "VALID",
            Self::NilEnvelope => "NIL_ENVELOPE",
            Self::BadPayload => "BAD_PAYLOAD",
            Self::BadCreatorSignature => "BAD_CREATOR_SIGNATURE",
            Self::DuplicateTxId => "DUPLICATE_TXID",
            Self::EndorsementPolicyFailure => "ENDORSEMENT_POLICY_FAILURE",
            Self::MvccReadConflict => "MVCC_READ_CONFLICT",
            Self::PhantomReadConflict => "PHANTOM_READ_CONFLICT",
            Self::ChaincodeVersionConflict => "CHAINCODE_VERSION_CONFLICT",
            Self::NotValidated => "NOT_VALIDATED",
            Self::InvalidOtherReason => "INVALID_OTHER_REASON",
            Self::Other(code) => return write!(f, "CODE_{code}"),
        };
        f.write_str(name)
    }
}

/// Status of one transaction as reported by the ledger.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TxStatusEvent {
    /// Transaction ID.
    pub tx_id: String,
    /// Validation outcome.
    pub validation_code: ValidationCode,
    /// Block that carries the transaction.
    pub block_number: u64,
    /// Event source address.
    pub source_url: String,
}

/// Item delivered on a transaction-status subscription.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TxStatusNotification {
    /// Terminal status for the registered transaction.
    Status(TxStatusEvent),
    /// The underlying event stream dropped; no status will follow.
    StreamLost {
        /// Disconnect description.
        reason: String,
    },
}

/// Event emitted by chaincode during a committed transaction.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ChaincodeEvent {
    /// Emitting chaincode.
    pub chaincode_id: String,
    /// Emitting transaction.
    pub tx_id: String,
    /// Event name.
    pub event_name: String,
    /// Event payload.
    pub payload: Vec<u8>,
    /// Block that carries the transaction.
    pub block_number: u64,
    /// Event source address.
    pub source_url: String,
}

/// Item delivered on a chaincode-event subscription.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ChaincodeEventNotification {
    /// Matching event.
    Event(ChaincodeEvent),
    /// The underlying event stream dropped; the subscription is closed.
    StreamLost {
        /// Disconnect description.
        reason: String,
    },
}

/// Opaque registration handle.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct SubscriptionHandle(u64);

impl SubscriptionHandle {
    /// Wraps a numeric handle issued by an [`EventService`] implementation.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the numeric handle.
    #[must_use]
    pub const fn id(self) -> u64 {
        self.0
    }
}

/// Event-layer failures.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum EventError {
    /// A status subscription already exists for the transaction.
    #[error("transaction `{tx_id}` already has a status registration")]
    DuplicateRegistration {
        /// Transaction ID.
        tx_id: String,
    },
    /// The event layer cannot accept registrations.
    #[error("event service unavailable: {message}")]
    Unavailable {
        /// Description.
        message: String,
    },
}

/// Receiver for one transaction-status registration.
pub type TxStatusReceiver = mpsc::UnboundedReceiver<TxStatusNotification>;

/// Receiver for one chaincode-event registration.
pub type ChaincodeEventReceiver = mpsc::UnboundedReceiver<ChaincodeEventNotification>;

/// Event subscription layer.
///
/// Implementations deliver at most one terminal notification per transaction registration
/// and report stream loss distinctly from silence.
pub trait EventService: Send + Sync {
    /// Registers interest in the status of `tx_id`.
    ///
    /// # Errors
    ///
    /// Returns [`EventError`] when the registration is rejected.
    fn register_tx_status(
        &self,
        tx_id: &str,
    ) -> Result<(SubscriptionHandle, TxStatusReceiver), EventError>;

    /// Registers interest in events of `chaincode_id` whose name matches `event_filter`.
    ///
    /// # Errors
    ///
    /// Returns [`EventError`] when the registration is rejected.
    fn register_chaincode_events(
        &self,
        chaincode_id: &str,
        event_filter: &Pattern,
    ) -> Result<(SubscriptionHandle, ChaincodeEventReceiver), EventError>;

    /// Releases a registration. Unknown or already-released handles are ignored.
    fn unregister(&self, handle: SubscriptionHandle);
}

/// One chaincode-event registration.
#[derive(Debug)]
struct ChaincodeRegistration {
    /// Chaincode filter.
    chaincode_id: String,
    /// Event-name filter.
    event_filter: Pattern,
    /// Delivery channel.
    sender: mpsc::UnboundedSender<ChaincodeEventNotification>,
}

/// Mutable registration tables.
#[derive(Debug, Default)]
struct HubState {
    /// Status registrations by transaction ID.
    tx_status: HashMap<String, (SubscriptionHandle, mpsc::UnboundedSender<TxStatusNotification>)>,
    /// Transaction ID by status handle.
    tx_handles: HashMap<SubscriptionHandle, String>,
    /// Chaincode registrations by handle.
    chaincode: HashMap<SubscriptionHandle, ChaincodeRegistration>,
}

/// In-process [`EventService`] fed by an external block-delivery client.
#[derive(Debug, Default)]
pub struct LocalEventHub {
    /// Registration tables.
    state: Mutex<HubState>,
    /// Next handle value.
    next_handle: AtomicU64,
}

impl LocalEventHub {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate_handle(&self) -> SubscriptionHandle {
        SubscriptionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed).saturating_add(1))
    }

    /// Delivers a status to its registration, if any, and closes that registration.
    ///
    /// Returns true when a subscriber received it.
    pub fn publish_tx_status(&self, event: TxStatusEvent) -> bool {
        let Ok(mut state) = self.state.lock() else {
            return false;
        };
        let Some((handle, sender)) = state.tx_status.remove(&event.tx_id) else {
            tracing::debug!(tx_id = %event.tx_id, "no status registration for transaction");
            return false;
        };
        let _ = state.tx_handles.remove(&handle);
        drop(state);
        tracing::debug!(
            tx_id = %event.tx_id,
            code = %event.validation_code,
            block = event.block_number,
            "delivering transaction status"
        );
        sender.send(TxStatusNotification::Status(event)).is_ok()
    }

    /// Delivers a chaincode event to every matching registration.
    ///
    /// Returns the number of subscribers that received it.
    pub fn publish_chaincode_event(&self, event: &ChaincodeEvent) -> usize {
        let Ok(state) = self.state.lock() else {
            return 0;
        };
        let mut delivered = 0_usize;
        for registration in state.chaincode.values() {
            if registration.chaincode_id != event.chaincode_id
                || !registration.event_filter.matches(&event.event_name)
            {
                continue;
            }
            if registration
                .sender
                .send(ChaincodeEventNotification::Event(event.clone()))
                .is_ok()
            {
                delivered = delivered.saturating_add(1);
            }
        }
        delivered
    }

    /// Signals stream loss to every registration and closes them all.
    pub fn notify_stream_lost(&self, reason: &str) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let tx_status = std::mem::take(&mut state.tx_status);
        state.tx_handles.clear();
        let chaincode = std::mem::take(&mut state.chaincode);
        drop(state);
        tracing::warn!(
            reason,
            tx_registrations = tx_status.len(),
            chaincode_registrations = chaincode.len(),
            "event stream lost"
        );
        for (_, (_, sender)) in tx_status {
            let _ = sender.send(TxStatusNotification::StreamLost {
                reason: reason.to_owned(),
            });
        }
        for (_, registration) in chaincode {
            let _ = registration
                .sender
                .send(ChaincodeEventNotification::StreamLost {
                    reason: reason.to_owned(),
                });
        }
    }

    /// Returns the number of live registrations of both kinds.
    #[must_use]
    pub fn active_registrations(&self) -> usize {
        self.state
            .lock()
            .map(|state| state.tx_status.len().saturating_add(state.chaincode.len()))
            .unwrap_or_default()
    }
}

impl EventService for LocalEventHub {
    fn register_tx_status(
        &self,
        tx_id: &str,
    ) -> Result<(SubscriptionHandle, TxStatusReceiver), EventError> {
        let mut state = self.state.lock().map_err(|_| EventError::Unavailable {
            message: "event hub state poisoned".to_owned(),
        })?;
        if state.tx_status.contains_key(tx_id) {
            return Err(EventError::DuplicateRegistration {
                tx_id: tx_id.to_owned(),
            });
        }
        let handle = self.allocate_handle();
        let (sender, receiver) = mpsc::unbounded_channel();
        let _ = state.tx_status.insert(tx_id.to_owned(), (handle, sender));
        let _ = state.tx_handles.insert(handle, tx_id.to_owned());
        Ok((handle, receiver))
    }

    fn register_chaincode_events(
        &self,
        chaincode_id: &str,
        event_filter: &Pattern,
    ) -> Result<(SubscriptionHandle, ChaincodeEventReceiver), EventError> {
        let mut state = self.state.lock().map_err(|_| EventError::Unavailable {
            message: "event hub state poisoned".to_owned(),
        })?;
        let handle = self.allocate_handle();
        let (sender, receiver) = mpsc::unbounded_channel();
        let _ = state.chaincode.insert(
            handle,
            ChaincodeRegistration {
                chaincode_id: chaincode_id.to_owned(),
                event_filter: event_filter.clone(),
                sender,
            },
        );
        Ok((handle, receiver))
    }

    fn unregister(&self, handle: SubscriptionHandle) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(tx_id) = state.tx_handles.remove(&handle) {
                let _ = state.tx_status.remove(&tx_id);
            }
            let _ = state.chaincode.remove(&handle);
        }
    }
}
