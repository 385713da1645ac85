use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::cbor::{self, CborError};

/// An embedded CBOR data item: the encoding of `T` wrapped in a byte string
/// under tag 24. The bytes produced at construction or seen on the wire are
/// held alongside the decoded value, so re-encoding is byte-exact.
#[derive(Clone, Debug)]
pub struct Tag24<T> {
    pub inner: T,
    pub inner_bytes: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("expected a tag 24 data item")]
    NotATag24,
    #[error("expected tag 24 to wrap a byte string")]
    InvalidTag24Contents,
    #[error("unable to encode value as CBOR: {0}")]
    UnableToEncode(CborError),
    #[error("unable to decode tagged bytes: {0}")]
    UnableToDecode(CborError),
}

impl<T> Tag24<T> {
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: Serialize> Tag24<T> {
    pub fn new(inner: T) -> Result<Tag24<T>, Error> {
        let inner_bytes = cbor::to_vec(&inner).map_err(Error::UnableToEncode)?;
        Ok(Tag24 { inner, inner_bytes })
    }
}

impl<T: DeserializeOwned> Tag24<T> {
    pub fn from_bytes(inner_bytes: Vec<u8>) -> Result<Tag24<T>, Error> {
        let inner: T = cbor::from_slice(&inner_bytes).map_err(Error::UnableToDecode)?;
        Ok(Tag24 { inner, inner_bytes })
    }
}

impl<T> AsRef<T> for Tag24<T> {
    fn as_ref(&self) -> &T {
        &self.inner
    }
}

impl<T: PartialEq> PartialEq for Tag24<T> {
    fn eq(&self, other: &Self) -> bool {
        self.inner_bytes == other.inner_bytes && self.inner == other.inner
    }
}

impl<T: Eq> Eq for Tag24<T> {}

impl<T> Serialize for Tag24<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        ciborium::Value::Tag(
            24,
            Box::new(ciborium::Value::Bytes(self.inner_bytes.clone())),
        )
        .serialize(serializer)
    }
}

impl<'de, T: DeserializeOwned> Deserialize<'de> for Tag24<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error as _;
        match ciborium::Value::deserialize(deserializer)? {
            ciborium::Value::Tag(24, inner) => match *inner {
                ciborium::Value::Bytes(inner_bytes) => Tag24::from_bytes(inner_bytes)
                    .map_err(|e| D::Error::custom(format!("invalid tag 24 item: {e}"))),
                _ => Err(D::Error::custom("expected tag 24 to wrap a byte string")),
            },
            _ => Err(D::Error::custom("expected a tag 24 data item")),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cbor;

    #[test]
    fn wire_format() {
        // 24(<<"hello">>) => d818 46 65 68656c6c6f
        let tagged = Tag24::new(String::from("hello")).unwrap();
        let bytes = cbor::to_vec(&tagged).unwrap();
        assert_eq!(hex::encode(&bytes), "d818466568656c6c6f");
        let back: Tag24<String> = cbor::from_slice(&bytes).unwrap();
        assert_eq!(back.inner, "hello");
    }

    #[test]
    fn untagged_bytes_rejected() {
        // A bare bstr is not an embedded CBOR data item.
        let bytes = cbor::to_vec(&serde_bytes::ByteBuf::from(vec![0x61, 0x61])).unwrap();
        assert!(cbor::from_slice::<Tag24<String>>(&bytes).is_err());
    }
}
