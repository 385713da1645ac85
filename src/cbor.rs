//! CBOR encoding and decoding helpers over [ciborium].
use std::io::Cursor;
use std::ops::Deref;

use coset::{CoseError, EndOfFile};
use serde::{de, Deserialize, Serialize};
use thiserror::Error;

/// A transparent wrapper around [ciborium::Value] carrying equality, so
/// that structures holding opaque data elements can derive [PartialEq].
#[derive(Debug, Clone)]
pub struct Value(pub ciborium::Value);

#[derive(Debug, Error)]
pub enum CborError {
    /// CBOR decoding failure.
    #[error("CBOR decoding failure: {0}")]
    DecodeFailed(ciborium::de::Error<EndOfFile>),
    /// Duplicate map key detected.
    #[error("duplicate map key")]
    DuplicateMapKey,
    /// CBOR encoding failure.
    #[error("CBOR encoding failure")]
    EncodeFailed,
    /// CBOR input had extra data.
    #[error("extraneous data")]
    ExtraneousData,
    /// Integer value on the wire is outside the range representable in this crate.
    #[error("integer value out of range")]
    OutOfRangeIntegerValue,
    /// Unexpected CBOR item encountered (got, want).
    #[error("unexpected item: {0}, want {1}")]
    UnexpectedItem(&'static str, &'static str),
    /// Unrecognized value in IANA-controlled range (with no private range).
    #[error("unregistered IANA value")]
    UnregisteredIanaValue,
    /// Unrecognized value in neither IANA-controlled range nor private range.
    #[error("unregistered non-private IANA value")]
    UnregisteredIanaNonPrivateValue,
}

impl From<CoseError> for CborError {
    fn from(e: CoseError) -> Self {
        match e {
            CoseError::DecodeFailed(e) => CborError::DecodeFailed(e),
            CoseError::DuplicateMapKey => CborError::DuplicateMapKey,
            CoseError::EncodeFailed => CborError::EncodeFailed,
            CoseError::ExtraneousData => CborError::ExtraneousData,
            CoseError::OutOfRangeIntegerValue => CborError::OutOfRangeIntegerValue,
            CoseError::UnexpectedItem(s, s2) => CborError::UnexpectedItem(s, s2),
            CoseError::UnregisteredIanaValue => CborError::UnregisteredIanaValue,
            CoseError::UnregisteredIanaNonPrivateValue => CborError::UnregisteredIanaNonPrivateValue,
        }
    }
}

pub fn to_vec<T>(value: &T) -> Result<Vec<u8>, CborError>
where
    T: Serialize,
{
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf).map_err(|_| CborError::EncodeFailed)?;
    Ok(buf)
}

pub fn from_slice<T>(slice: &[u8]) -> Result<T, CborError>
where
    T: de::DeserializeOwned,
{
    ciborium::de::from_reader(Cursor::new(&slice)).map_err(|e| match e {
        ciborium::de::Error::Io(_) => {
            CborError::DecodeFailed(ciborium::de::Error::Io(EndOfFile))
        }
        ciborium::de::Error::Syntax(o) => CborError::DecodeFailed(ciborium::de::Error::Syntax(o)),
        ciborium::de::Error::Semantic(o, s) => {
            CborError::DecodeFailed(ciborium::de::Error::Semantic(o, s))
        }
        ciborium::de::Error::RecursionLimitExceeded => {
            CborError::DecodeFailed(ciborium::de::Error::RecursionLimitExceeded)
        }
    })
}

/// Convert a [ciborium::Value] into a type `T`.
pub fn from_value<T>(value: ciborium::Value) -> Result<T, CborError>
where
    T: de::DeserializeOwned,
{
    // Roundtrip through a buffer, as ciborium does not expose a
    // deserializer over `Value` directly.
    let buf = to_vec(&value)?;
    from_slice(buf.as_slice())
}

pub fn into_value<S>(v: S) -> Result<ciborium::Value, CborError>
where
    S: Serialize,
{
    let bytes = to_vec(&v)?;
    from_slice(&bytes)
}

impl Deref for Value {
    type Target = ciborium::Value;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl From<ciborium::Value> for Value {
    fn from(value: ciborium::Value) -> Self {
        Self(value)
    }
}

impl From<Value> for ciborium::Value {
    fn from(value: Value) -> Self {
        value.0
    }
}

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        ciborium::Value::deserialize(deserializer).map(Value)
    }
}
