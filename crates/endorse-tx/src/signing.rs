//! Signing boundary: caller identity plus the crypto-suite capability used for proposals,
//! envelopes, and endorsement verification.

use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Public identity of a signer as carried inside proposals and endorsements.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct SerializedIdentity {
    /// Organization (MSP) that issued the identity.
    pub msp_id: String,
    /// Encoded certificate or public identity bytes.
    pub id_bytes: Vec<u8>,
}

impl SerializedIdentity {
    /// Creates an identity from MSP ID and certificate bytes.
    #[must_use]
    pub fn new(msp_id: impl Into<String>, id_bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            msp_id: msp_id.into(),
            id_bytes: id_bytes.into(),
        }
    }

    /// Canonical byte form: length-prefixed MSP ID followed by identity bytes.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let msp = self.msp_id.as_bytes();
        let msp_len = u32::try_from(msp.len()).unwrap_or(u32::MAX);
        let capacity = 4_usize
            .saturating_add(msp.len())
            .saturating_add(self.id_bytes.len());
        let mut out = Vec::with_capacity(capacity);
        out.extend_from_slice(&msp_len.to_be_bytes());
        out.extend_from_slice(msp);
        out.extend_from_slice(&self.id_bytes);
        out
    }
}

/// Caller identity able to sign through a [`CryptoSuite`].
#[derive(Clone, Eq, PartialEq)]
pub struct SigningIdentity {
    /// Public part shared with peers.
    identity: SerializedIdentity,
    /// Opaque key reference understood by the crypto suite.
    key_label: String,
}

impl SigningIdentity {
    /// Creates a signing identity.
    #[must_use]
    pub fn new(identity: SerializedIdentity, key_label: impl Into<String>) -> Self {
        Self {
            identity,
            key_label: key_label.into(),
        }
    }

    /// Returns the public identity.
    #[must_use]
    pub const fn identity(&self) -> &SerializedIdentity {
        &self.identity
    }

    /// Returns the organization ID.
    #[must_use]
    pub fn msp_id(&self) -> &str {
        &self.identity.msp_id
    }

    /// Returns the key reference passed to the crypto suite.
    #[must_use]
    pub fn key_label(&self) -> &str {
        &self.key_label
    }
}

impl fmt::Debug for SigningIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningIdentity")
            .field("msp_id", &self.identity.msp_id)
            .field("key_label", &self.key_label)
            .finish_non_exhaustive()
    }
}

/// Crypto-provider failures.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum CryptoError {
    /// The provider could not produce a signature.
    #[error("signing failed: {message}")]
    Sign {
        /// Provider-specific description.
        message: String,
    },
    /// A structure could not be encoded for signing.
    #[error("failed to encode {what} for signing: {message}")]
    Encode {
        /// Structure being encoded.
        what: &'static str,
        /// Encoder description.
        message: String,
    },
}

/// Signing and verification capability supplied by the embedding application.
pub trait CryptoSuite: Send + Sync {
    /// Signs `payload` with the key behind `identity`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Sign`] when the key is unavailable or signing fails.
    fn sign(&self, identity: &SigningIdentity, payload: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Verifies `signature` over `payload` by `identity`.
    fn verify(&self, identity: &SerializedIdentity, payload: &[u8], signature: &[u8]) -> bool;

    /// Digest used for proposal hashes, payload fingerprints, and transaction IDs.
    fn hash(&self, payload: &[u8]) -> [u8; 32] {
        Sha256::digest(payload).into()
    }
}

/// Signing identity bound to the crypto suite that holds its key.
#[derive(Clone)]
pub struct Signer {
    /// Caller identity.
    identity: SigningIdentity,
    /// Provider performing signatures.
    suite: Arc<dyn CryptoSuite>,
}

impl Signer {
    /// Creates a signer.
    #[must_use]
    pub fn new(identity: SigningIdentity, suite: Arc<dyn CryptoSuite>) -> Self {
        Self { identity, suite }
    }

    /// Returns the signing identity.
    #[must_use]
    pub const fn identity(&self) -> &SigningIdentity {
        &self.identity
    }

    /// Returns the crypto suite.
    #[must_use]
    pub fn suite(&self) -> &dyn CryptoSuite {
        self.suite.as_ref()
    }

    /// Signs bytes with the bound identity.
    ///
    /// # Errors
    ///
    /// Propagates [`CryptoError`] from the suite.
    pub fn sign(&self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.suite.sign(&self.identity, payload)
    }

    /// Hashes bytes with the suite digest.
    #[must_use]
    pub fn hash(&self, payload: &[u8]) -> [u8; 32] {
        self.suite.hash(payload)
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

/// Keyed-digest suite for unit tests: a signature is `sha256(id_bytes || payload)`.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct DigestSuite;

#[cfg(test)]
impl DigestSuite {
    /// Computes the signature `identity` would produce over `payload`.
    pub(crate) fn signature_for(identity: &SerializedIdentity, payload: &[u8]) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(&identity.id_bytes);
        hasher.update(payload);
        hasher.finalize().to_vec()
    }
}

#[cfg(test)]
impl CryptoSuite for DigestSuite {
    fn sign(&self, identity: &SigningIdentity, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        Ok(Self::signature_for(identity.identity(), payload))
    }

    fn verify(&self, identity: &SerializedIdentity, payload: &[u8], signature: &[u8]) -> bool {
        Self::signature_for(identity, payload) == signature
    }
}
