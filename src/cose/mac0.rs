use coset::{iana, AsCborValue, CborSerializable, Header};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use super::Error;

type HmacSha256 = Hmac<Sha256>;

/// A COSE_Mac0, bridging [coset] into serde-driven CBOR structures.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CoseMac0(pub coset::CoseMac0);

impl CoseMac0 {
    /// The MAC_structure bytes that the tag covers.
    pub fn tag_payload(&self, detached_payload: Option<&[u8]>) -> Result<Vec<u8>, Error> {
        let payload = super::resolve_payload(self.0.payload.as_deref(), detached_payload)?;
        Ok(coset::mac_structure_data(
            coset::MacContext::CoseMac0,
            self.0.protected.clone(),
            &[],
            payload,
        ))
    }

    /// Verify an HMAC-SHA256 tag with the given key.
    pub fn verify_hmac_sha256(
        &self,
        key: &[u8],
        detached_payload: Option<&[u8]>,
    ) -> Result<(), Error> {
        let to_verify = self.tag_payload(detached_payload)?;
        let mut mac =
            HmacSha256::new_from_slice(key).map_err(|_| Error::UnsupportedAlgorithm)?;
        mac.update(&to_verify);
        mac.verify_slice(&self.0.tag).map_err(|_| Error::TagMismatch)
    }
}

/// Build a COSE_Mac0 tagged with HMAC-SHA256. The payload is attached when
/// `attach_payload` is set and detached (nil on the wire) otherwise.
pub fn tag_hmac_sha256(
    key: &[u8],
    payload: &[u8],
    attach_payload: bool,
) -> Result<CoseMac0, Error> {
    let protected = coset::ProtectedHeader {
        original_data: None,
        header: coset::HeaderBuilder::new()
            .algorithm(iana::Algorithm::HMAC_256_256)
            .build(),
    };
    let tag_payload = coset::mac_structure_data(
        coset::MacContext::CoseMac0,
        protected.clone(),
        &[],
        payload,
    );
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| Error::UnsupportedAlgorithm)?;
    mac.update(&tag_payload);
    Ok(CoseMac0(coset::CoseMac0 {
        protected,
        unprotected: Header::default(),
        payload: attach_payload.then(|| payload.to_vec()),
        tag: mac.finalize().into_bytes().to_vec(),
    }))
}

impl Serialize for CoseMac0 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::Error as _;
        self.0
            .clone()
            .to_cbor_value()
            .map_err(S::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CoseMac0 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error as _;
        let value = ciborium::Value::deserialize(deserializer)?;
        // COSE_Mac0 is sometimes seen with its CBOR tag 17; strip it.
        let value = match value {
            ciborium::Value::Tag(17, inner) => *inner,
            other => other,
        };
        coset::CoseMac0::from_cbor_value(value)
            .map(CoseMac0)
            .map_err(D::Error::custom)
    }
}

impl CborSerializable for CoseMac0 {}

impl AsCborValue for CoseMac0 {
    fn from_cbor_value(value: ciborium::Value) -> coset::Result<Self> {
        coset::CoseMac0::from_cbor_value(value).map(CoseMac0)
    }

    fn to_cbor_value(self) -> coset::Result<ciborium::Value> {
        self.0.to_cbor_value()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cbor;

    #[test]
    fn tag_and_verify_detached() {
        let key = [7u8; 32];
        let mac0 = tag_hmac_sha256(&key, b"payload", false).unwrap();
        mac0.verify_hmac_sha256(&key, Some(b"payload")).unwrap();
        assert!(mac0.verify_hmac_sha256(&key, Some(b"tampered")).is_err());
        assert!(mac0
            .verify_hmac_sha256(&[8u8; 32], Some(b"payload"))
            .is_err());
    }

    #[test]
    fn serde_roundtrip() {
        let key = [7u8; 32];
        let mac0 = tag_hmac_sha256(&key, b"payload", true).unwrap();
        let bytes = cbor::to_vec(&mac0).unwrap();
        let back: CoseMac0 = cbor::from_slice(&bytes).unwrap();
        back.verify_hmac_sha256(&key, None).unwrap();
    }
}
