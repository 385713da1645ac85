use crate::definitions::device_key::cose_key;
use crate::definitions::helpers::tag24;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("expected a map")]
    InvalidDeviceEngagement,
    #[error("malformed version")]
    Version,
    #[error("malformed Security structure: {0}")]
    Malformed(&'static str),
    #[error("ephemeral key is missing or invalid")]
    EphemeralKey,
    #[error(transparent)]
    CoseKey(#[from] cose_key::Error),
    #[error(transparent)]
    Tag24(#[from] tag24::Error),
    #[error("connection method list must not be empty")]
    EmptyRetrievalMethods,
    #[error("unrecognized connection method type: {0}")]
    UnsupportedRetrievalMethod(u64),
    #[error("malformed retrieval method options: {0}")]
    InvalidOptions(&'static str),
    #[error("NFC data length out of bounds: {0}")]
    NfcDataLength(u64),
    #[error("not a valid engagement URI")]
    InvalidUri,
    #[error("could not decode base64url payload")]
    Base64(#[from] base64::DecodeError),
    #[error("could not decode engagement CBOR: {0}")]
    Cbor(String),
}

impl From<crate::cbor::CborError> for Error {
    fn from(e: crate::cbor::CborError) -> Self {
        Error::Cbor(e.to_string())
    }
}
