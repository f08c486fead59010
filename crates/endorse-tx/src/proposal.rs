//! Request, proposal, endorsement-response, and envelope types.

use std::{
    collections::{BTreeMap, BTreeSet},
    time::{SystemTime, UNIX_EPOCH},
};

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::signing::{CryptoError, CryptoSuite, SerializedIdentity, Signer};

/// Nonce length used in proposal headers.
pub const NONCE_LEN: usize = 24;

/// Lowest chaincode status treated as success.
pub const STATUS_OK_MIN: i32 = 200;

/// First chaincode status no longer treated as success.
pub const STATUS_ERROR_MIN: i32 = 400;

/// One chaincode participating in a transaction, with the private collections it touches.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct ChaincodeCall {
    /// Chaincode name.
    pub chaincode_id: String,
    /// Private-data collection names.
    #[serde(default)]
    pub collections: BTreeSet<String>,
}

impl ChaincodeCall {
    /// Creates a call without collections.
    #[must_use]
    pub fn new(chaincode_id: impl Into<String>) -> Self {
        Self {
            chaincode_id: chaincode_id.into(),
            collections: BTreeSet::new(),
        }
    }

    /// Adds one collection.
    #[must_use]
    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        let _ = self.collections.insert(collection.into());
        self
    }
}

/// Caller request. Treated as immutable once handed to the client.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Request {
    /// Target chaincode.
    pub chaincode_id: String,
    /// Chaincode function name.
    pub function: String,
    /// Ordered arguments.
    pub args: Vec<Vec<u8>>,
    /// Private inputs carried in the proposal but never in the envelope.
    pub transient: BTreeMap<String, Vec<u8>>,
    /// Additional chaincodes/collections reached through chaincode-to-chaincode calls.
    pub invocation_chain: Vec<ChaincodeCall>,
}

impl Request {
    /// Creates a request with no arguments.
    #[must_use]
    pub fn new(chaincode_id: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            chaincode_id: chaincode_id.into(),
            function: function.into(),
            args: Vec::new(),
            transient: BTreeMap::new(),
            invocation_chain: Vec::new(),
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn with_arg(mut self, arg: impl Into<Vec<u8>>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends many arguments.
    #[must_use]
    pub fn with_args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Vec<u8>>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Adds one transient entry.
    #[must_use]
    pub fn with_transient(mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        let _ = self.transient.insert(key.into(), value.into());
        self
    }

    /// Adds one chaincode to the invocation chain.
    #[must_use]
    pub fn with_invocation(mut self, call: ChaincodeCall) -> Self {
        self.invocation_chain.push(call);
        self
    }

    /// Returns the selection unit: the primary chaincode first, then chained chaincodes.
    ///
    /// Repeated chaincode IDs are merged and their collections unioned.
    #[must_use]
    pub fn calls(&self) -> Vec<ChaincodeCall> {
        let mut calls = vec![ChaincodeCall::new(self.chaincode_id.clone())];
        for call in &self.invocation_chain {
            if let Some(existing) = calls
                .iter_mut()
                .find(|existing| existing.chaincode_id == call.chaincode_id)
            {
                existing.collections.extend(call.collections.iter().cloned());
            } else {
                calls.push(call.clone());
            }
        }
        calls
    }
}

/// Proposal header binding creator, nonce, time, and channel.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ProposalHeader {
    /// Channel the proposal is bound to.
    pub channel_id: String,
    /// Transaction ID derived from nonce and creator.
    pub tx_id: String,
    /// Submitting identity.
    pub creator: SerializedIdentity,
    /// Random per-attempt nonce.
    pub nonce: Vec<u8>,
    /// Creation time in unix milliseconds.
    pub timestamp_ms: u64,
}

/// Chaincode invocation descriptor.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChaincodeInvocation {
    /// Target chaincode.
    pub chaincode_id: String,
    /// Function name.
    pub function: String,
    /// Ordered arguments.
    pub args: Vec<Vec<u8>>,
}

/// Unsigned transaction proposal, created once per attempt.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct TransactionProposal {
    /// Header.
    pub header: ProposalHeader,
    /// Invocation descriptor.
    pub invocation: ChaincodeInvocation,
    /// Private inputs; signed, excluded from the proposal hash and the envelope.
    pub transient: BTreeMap<String, Vec<u8>>,
}

/// Portion of a proposal covered by the proposal hash.
#[derive(Serialize)]
struct HashedPart<'proposal> {
    /// Header.
    header: &'proposal ProposalHeader,
    /// Invocation descriptor.
    invocation: &'proposal ChaincodeInvocation,
}

/// Derives the transaction ID: hex digest of `nonce || creator`.
#[must_use]
pub fn compute_tx_id(
    suite: &dyn CryptoSuite,
    nonce: &[u8],
    creator: &SerializedIdentity,
) -> String {
    let mut material = nonce.to_vec();
    material.extend_from_slice(&creator.to_bytes());
    hex::encode(suite.hash(&material))
}

/// Appends `bytes` behind a big-endian `u32` length.
fn push_prefixed(out: &mut Vec<u8>, bytes: &[u8]) {
    let len = u32::try_from(bytes.len()).unwrap_or(u32::MAX);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(bytes);
}

/// Encodes a value with bincode, mapping failures onto [`CryptoError::Encode`].
fn encode<T: Serialize>(what: &'static str, value: &T) -> Result<Vec<u8>, CryptoError> {
    bincode::serialize(value).map_err(|error| CryptoError::Encode {
        what,
        message: error.to_string(),
    })
}

impl TransactionProposal {
    /// Creates a proposal with a fresh random nonce and the current time.
    #[must_use]
    pub fn new(channel_id: impl Into<String>, request: &Request, signer: &Signer) -> Self {
        let mut nonce = vec![0_u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or_default();
        Self::with_nonce(channel_id, request, signer, nonce, timestamp_ms)
    }

    /// Creates a proposal with an explicit nonce and timestamp.
    #[must_use]
    pub fn with_nonce(
        channel_id: impl Into<String>,
        request: &Request,
        signer: &Signer,
        nonce: Vec<u8>,
        timestamp_ms: u64,
    ) -> Self {
        let creator = signer.identity().identity().clone();
        let tx_id = compute_tx_id(signer.suite(), &nonce, &creator);
        Self {
            header: ProposalHeader {
                channel_id: channel_id.into(),
                tx_id,
                creator,
                nonce,
                timestamp_ms,
            },
            invocation: ChaincodeInvocation {
                chaincode_id: request.chaincode_id.clone(),
                function: request.function.clone(),
                args: request.args.clone(),
            },
            transient: request.transient.clone(),
        }
    }

    /// Returns the transaction ID.
    #[must_use]
    pub fn tx_id(&self) -> &str {
        &self.header.tx_id
    }

    /// Digest peers echo back to bind their response to this proposal.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Encode`] when the proposal cannot be encoded.
    pub fn proposal_hash(&self, suite: &dyn CryptoSuite) -> Result<[u8; 32], CryptoError> {
        let bytes = encode(
            "proposal",
            &HashedPart {
                header: &self.header,
                invocation: &self.invocation,
            },
        )?;
        Ok(suite.hash(&bytes))
    }

    /// Encodes and signs the full proposal, transient data included.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError`] when encoding or signing fails.
    pub fn sign(self, signer: &Signer) -> Result<SignedProposal, CryptoError> {
        let proposal_bytes = encode("proposal", &self)?;
        let signature = signer.sign(&proposal_bytes)?;
        let proposal_hash = self.proposal_hash(signer.suite())?;
        Ok(SignedProposal {
            proposal: self,
            proposal_bytes,
            signature,
            proposal_hash,
        })
    }
}

/// Signed proposal ready for dispatch.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SignedProposal {
    /// Decoded proposal.
    pub proposal: TransactionProposal,
    /// Signed bytes.
    pub proposal_bytes: Vec<u8>,
    /// Creator signature over `proposal_bytes`.
    pub signature: Vec<u8>,
    /// Cached proposal hash.
    pub proposal_hash: [u8; 32],
}

impl SignedProposal {
    /// Returns the transaction ID.
    #[must_use]
    pub fn tx_id(&self) -> &str {
        self.proposal.tx_id()
    }

    /// Returns the channel ID.
    #[must_use]
    pub fn channel_id(&self) -> &str {
        &self.proposal.header.channel_id
    }
}

/// Application-level chaincode response.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChaincodeResponse {
    /// Status code, `[200, 400)` is success.
    pub status: i32,
    /// Status message.
    pub message: String,
    /// Return value.
    pub payload: Vec<u8>,
}

impl ChaincodeResponse {
    /// Returns true for status in `[200, 400)`.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= STATUS_OK_MIN && self.status < STATUS_ERROR_MIN
    }
}

/// Endorser identity plus its signature.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Endorsement {
    /// Endorsing peer identity.
    pub endorser: SerializedIdentity,
    /// Signature over [`ProposalResponse::endorsement_message`].
    pub signature: Vec<u8>,
}

/// One peer's endorsement response.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ProposalResponse {
    /// Responding peer address.
    pub peer_url: String,
    /// Proposal hash the peer endorsed.
    pub proposal_hash: [u8; 32],
    /// Chaincode response.
    pub response: ChaincodeResponse,
    /// Endorsed simulation payload (results and response).
    pub payload: Vec<u8>,
    /// Endorsement.
    pub endorsement: Endorsement,
}

impl ProposalResponse {
    /// Endorsed result: simulation payload plus the chaincode status, message, and return value.
    ///
    /// Every field is length-prefixed so distinct results never encode to the same bytes.
    #[must_use]
    pub fn endorsed_bytes(&self) -> Vec<u8> {
        let message = self.response.message.as_bytes();
        let capacity = 16_usize
            .saturating_add(self.payload.len())
            .saturating_add(message.len())
            .saturating_add(self.response.payload.len());
        let mut out = Vec::with_capacity(capacity);
        push_prefixed(&mut out, &self.payload);
        out.extend_from_slice(&self.response.status.to_be_bytes());
        push_prefixed(&mut out, message);
        push_prefixed(&mut out, &self.response.payload);
        out
    }

    /// Digest compared across endorsers; covers both the simulation payload and the
    /// application response.
    #[must_use]
    pub fn payload_digest(&self, suite: &dyn CryptoSuite) -> [u8; 32] {
        suite.hash(&self.endorsed_bytes())
    }

    /// Bytes the endorsement signature covers: `endorsed_bytes || endorser`.
    #[must_use]
    pub fn endorsement_message(&self) -> Vec<u8> {
        let mut message = self.endorsed_bytes();
        message.extend_from_slice(&self.endorsement.endorser.to_bytes());
        message
    }

    /// Verifies the endorsement signature.
    #[must_use]
    pub fn verify_endorsement(&self, suite: &dyn CryptoSuite) -> bool {
        suite.verify(
            &self.endorsement.endorser,
            &self.endorsement_message(),
            &self.endorsement.signature,
        )
    }
}

/// Transaction body carried by an envelope.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct TransactionPayload {
    /// Proposal header.
    pub header: ProposalHeader,
    /// Invocation descriptor.
    pub invocation: ChaincodeInvocation,
    /// Proposal hash all endorsers signed.
    pub proposal_hash: [u8; 32],
    /// Agreed endorsed payload.
    pub response_payload: Vec<u8>,
    /// Agreed chaincode response.
    pub chaincode_response: ChaincodeResponse,
    /// Endorsements, one per responding peer.
    pub endorsements: Vec<Endorsement>,
}

/// Signed transaction submitted to an orderer.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Envelope {
    /// Transaction ID.
    pub tx_id: String,
    /// Channel ID.
    pub channel_id: String,
    /// Encoded [`TransactionPayload`].
    pub payload: Vec<u8>,
    /// Creator signature over `payload`.
    pub signature: Vec<u8>,
}

impl Envelope {
    /// Assembles and signs an envelope from a proposal and its agreeing responses.
    ///
    /// Transient data never enters the envelope.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError`] when encoding or signing fails.
    pub fn assemble(
        proposal: &SignedProposal,
        responses: &[ProposalResponse],
        signer: &Signer,
    ) -> Result<Self, CryptoError> {
        let (response_payload, chaincode_response) = responses
            .first()
            .map(|response| (response.payload.clone(), response.response.clone()))
            .unwrap_or_default();
        let body = TransactionPayload {
            header: proposal.proposal.header.clone(),
            invocation: proposal.proposal.invocation.clone(),
            proposal_hash: proposal.proposal_hash,
            response_payload,
            chaincode_response,
            endorsements: responses
                .iter()
                .map(|response| response.endorsement.clone())
                .collect(),
        };
        let payload = encode("envelope", &body)?;
        let signature = signer.sign(&payload)?;
        Ok(Self {
            tx_id: proposal.tx_id().to_owned(),
            channel_id: proposal.channel_id().to_owned(),
            payload,
            signature,
        })
    }

    /// Decodes the transaction body.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Encode`] when the payload is not a valid body.
    pub fn decode_payload(&self) -> Result<TransactionPayload, CryptoError> {
        bincode::deserialize(&self.payload).map_err(|error| CryptoError::Encode {
            what: "envelope",
            message: error.to_string(),
        })
    }
}

/// Orderer acknowledgement for one broadcast.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BroadcastAck {
    /// Status code; 200 means accepted.
    pub status: i32,
    /// Orderer-provided detail.
    pub info: String,
}

impl BroadcastAck {
    /// Accepted acknowledgement.
    #[must_use]
    pub fn success() -> Self {
        Self {
            status: 200,
            info: String::new(),
        }
    }

    /// Returns true when the orderer accepted the envelope.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status == 200
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::signing::{DigestSuite, SigningIdentity};

    fn signer() -> Signer {
        Signer::new(
            SigningIdentity::new(SerializedIdentity::new("Org1MSP", b"user1".to_vec()), "user1"),
            Arc::new(DigestSuite),
        )
    }

    fn request() -> Request {
        Request::new("exampleCC", "invoke")
            .with_args(["move", "a", "b", "1"])
            .with_transient("secret", b"hidden-value".to_vec())
    }

    #[test]
    fn calls_put_primary_first_and_merge_collections() {
        let request = Request::new("cc1", "f")
            .with_invocation(ChaincodeCall::new("cc2"))
            .with_invocation(ChaincodeCall::new("cc1").with_collection("coll1"))
            .with_invocation(ChaincodeCall::new("cc2").with_collection("coll2"));
        let calls = request.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(
            calls.first(),
            Some(&ChaincodeCall::new("cc1").with_collection("coll1"))
        );
        assert_eq!(
            calls.get(1),
            Some(&ChaincodeCall::new("cc2").with_collection("coll2"))
        );
    }

    #[test]
    fn tx_id_is_derived_from_nonce_and_creator() {
        let signer = signer();
        let first = TransactionProposal::with_nonce("ch", &request(), &signer, vec![7; 24], 1);
        let second = TransactionProposal::with_nonce("ch", &request(), &signer, vec![7; 24], 2);
        let third = TransactionProposal::with_nonce("ch", &request(), &signer, vec![8; 24], 1);
        assert_eq!(first.tx_id(), second.tx_id());
        assert_ne!(first.tx_id(), third.tx_id());
        assert_eq!(first.tx_id().len(), 64);

        let random = TransactionProposal::new("ch", &request(), &signer);
        assert_eq!(random.header.nonce.len(), NONCE_LEN);
    }

    #[test]
    fn proposal_hash_ignores_transient_but_signature_covers_it() {
        let signer = signer();
        let with_transient =
            TransactionProposal::with_nonce("ch", &request(), &signer, vec![1; 24], 5);
        let mut without_transient = with_transient.clone();
        without_transient.transient.clear();

        let first = with_transient.sign(&signer);
        let second = without_transient.sign(&signer);
        assert!(first.is_ok() && second.is_ok());
        if let (Ok(first), Ok(second)) = (first, second) {
            assert_eq!(first.proposal_hash, second.proposal_hash);
            assert_ne!(first.proposal_bytes, second.proposal_bytes);
            assert!(signer.suite().verify(
                signer.identity().identity(),
                &first.proposal_bytes,
                &first.signature
            ));
        }
    }

    #[test]
    fn envelope_carries_endorsements_without_transient_data() {
        let signer = signer();
        let signed = TransactionProposal::with_nonce("ch", &request(), &signer, vec![3; 24], 9)
            .sign(&signer);
        assert!(signed.is_ok());
        let Ok(signed) = signed else {
            return;
        };
        let endorser = SerializedIdentity::new("Org2MSP", b"peer0".to_vec());
        let response = ProposalResponse {
            peer_url: "peer0.org2:7051".to_owned(),
            proposal_hash: signed.proposal_hash,
            response: ChaincodeResponse {
                status: 200,
                message: String::new(),
                payload: b"ok".to_vec(),
            },
            payload: b"rwset".to_vec(),
            endorsement: Endorsement {
                endorser: endorser.clone(),
                signature: Vec::new(),
            },
        };

        let envelope = Envelope::assemble(&signed, std::slice::from_ref(&response), &signer);
        assert!(envelope.is_ok());
        if let Ok(envelope) = envelope {
            assert_eq!(envelope.tx_id, signed.tx_id());
            let needle = b"hidden-value";
            assert!(!envelope.payload.windows(needle.len()).any(|window| window == needle));
            let body = envelope.decode_payload();
            assert!(body.is_ok());
            if let Ok(body) = body {
                assert_eq!(body.endorsements.len(), 1);
                assert_eq!(body.response_payload, b"rwset".to_vec());
                assert_eq!(body.chaincode_response.payload, b"ok".to_vec());
                assert_eq!(
                    body.endorsements.first().map(|e| &e.endorser),
                    Some(&endorser)
                );
            }
        }
    }

    #[test]
    fn digest_and_signature_cover_the_application_response() {
        let endorser = SerializedIdentity::new("Org1MSP", b"peer0".to_vec());
        let mut response = ProposalResponse {
            peer_url: "peer0.org1:7051".to_owned(),
            proposal_hash: [1; 32],
            response: ChaincodeResponse {
                status: 200,
                message: String::new(),
                payload: b"balance=10".to_vec(),
            },
            payload: b"rwset:same".to_vec(),
            endorsement: Endorsement {
                endorser: endorser.clone(),
                signature: Vec::new(),
            },
        };
        response.endorsement.signature =
            DigestSuite::signature_for(&endorser, &response.endorsement_message());
        assert!(response.verify_endorsement(&DigestSuite));

        let mut other = response.clone();
        other.response.payload = b"balance=999".to_vec();
        assert_ne!(
            response.payload_digest(&DigestSuite),
            other.payload_digest(&DigestSuite)
        );
        assert!(!other.verify_endorsement(&DigestSuite));

        let mut restatused = response.clone();
        restatused.response.status = 201;
        assert_ne!(
            response.payload_digest(&DigestSuite),
            restatused.payload_digest(&DigestSuite)
        );
    }

    #[test]
    fn chaincode_status_success_range() {
        let mut response = ChaincodeResponse {
            status: 200,
            message: String::new(),
            payload: Vec::new(),
        };
        assert!(response.is_success());
        response.status = 399;
        assert!(response.is_success());
        response.status = 400;
        assert!(!response.is_success());
        response.status = 500;
        assert!(!response.is_success());
        assert!(BroadcastAck::success().is_success());
    }
}
