//! Serde-compatible wrappers around [coset] COSE structures, with signing and
//! verification helpers for the algorithms used in mdoc presentment.
pub mod mac0;
pub mod sign1;

pub use mac0::CoseMac0;
pub use sign1::CoseSign1;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("COSE structure could not be parsed: {0}")]
    Cbor(#[from] crate::cbor::CborError),
    #[error("signature is malformed: {0}")]
    MalformedSignature(signature::Error),
    #[error("signature verification failed: {0}")]
    VerificationFailed(signature::Error),
    #[error("tag verification failed")]
    TagMismatch,
    #[error("payload is detached and was not supplied")]
    NoPayload,
    #[error("payload is attached but an external payload was also supplied")]
    DoublePayload,
    #[error("protected headers do not carry an algorithm")]
    NoAlgorithm,
    #[error("unsupported algorithm in protected headers")]
    UnsupportedAlgorithm,
}

/// Resolve the payload to be covered by a signature or tag, enforcing that
/// exactly one of the attached and detached payloads is present.
fn resolve_payload<'a>(
    attached: Option<&'a [u8]>,
    detached: Option<&'a [u8]>,
) -> Result<&'a [u8], Error> {
    match (attached, detached) {
        (Some(_), Some(_)) => Err(Error::DoublePayload),
        (None, None) => Err(Error::NoPayload),
        (Some(p), None) | (None, Some(p)) => Ok(p),
    }
}
