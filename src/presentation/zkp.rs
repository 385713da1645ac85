//! Pluggable zero-knowledge proof verification.
//!
//! The wire format carries an opaque proof and a proof-system identifier;
//! interpreting them is delegated to registered backends. Verification fails
//! closed: a proof whose system is not registered is rejected, never skipped.
use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::definitions::session::SessionTranscriptBytes;
use crate::definitions::zk::ZkDocument;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("no verifier is registered for proof system '{0}'")]
    ProofSystemNotFound(String),
    #[error("the proof did not verify")]
    InvalidProof,
    #[error("the statement is malformed: {0}")]
    MalformedStatement(String),
}

/// What a backend attests to after verifying a proof: the elements it
/// establishes and whether issuer authentication is covered by the proof.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ZkVerification {
    pub issuer_signed_authenticated: bool,
    pub elements: BTreeMap<String, BTreeMap<String, ciborium::Value>>,
}

/// One proof system implementation.
pub trait ZkProofVerifier: Send + Sync {
    /// The identifier this backend answers to, matched against
    /// `zkSystemId` on the wire.
    fn system_id(&self) -> &str;

    /// Verify the proof against the statement, bound to this session's
    /// transcript.
    fn verify(
        &self,
        document: &ZkDocument,
        session_transcript: &SessionTranscriptBytes,
    ) -> Result<ZkVerification, Error>;
}

#[derive(Clone, Default)]
pub struct ZkVerifierRegistry {
    backends: BTreeMap<String, Arc<dyn ZkProofVerifier>>,
}

impl ZkVerifierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, backend: Arc<dyn ZkProofVerifier>) {
        self.backends.insert(backend.system_id().to_string(), backend);
    }

    pub fn get(&self, system_id: &str) -> Option<&Arc<dyn ZkProofVerifier>> {
        self.backends.get(system_id)
    }

    /// Dispatch a document to the backend for its proof system. Unknown
    /// systems are an error for that document.
    pub fn verify_document(
        &self,
        document: &ZkDocument,
        session_transcript: &SessionTranscriptBytes,
    ) -> Result<ZkVerification, Error> {
        let backend = self
            .get(&document.zk_system_id)
            .ok_or_else(|| Error::ProofSystemNotFound(document.zk_system_id.clone()))?;
        backend.verify(document, session_transcript)
    }
}
