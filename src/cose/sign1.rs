use coset::{iana, AsCborValue, CborSerializable, Header, ProtectedHeader};
use p256::ecdsa::signature::{Signer, Verifier};
use serde::{Deserialize, Serialize};

use super::Error;

/// A COSE_Sign1, bridging [coset] into serde-driven CBOR structures.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CoseSign1(pub coset::CoseSign1);

impl CoseSign1 {
    /// The Sig_structure bytes that a signature over this structure covers.
    ///
    /// `detached_payload` must be given iff the payload is detached.
    pub fn signature_payload(&self, detached_payload: Option<&[u8]>) -> Result<Vec<u8>, Error> {
        let payload = super::resolve_payload(self.0.payload.as_deref(), detached_payload)?;
        Ok(coset::sig_structure_data(
            coset::SignatureContext::CoseSign1,
            self.0.protected.clone(),
            None,
            &[],
            payload,
        ))
    }

    /// Verify an ES256 signature with the given key.
    pub fn verify_p256(
        &self,
        key: &p256::ecdsa::VerifyingKey,
        detached_payload: Option<&[u8]>,
    ) -> Result<(), Error> {
        let to_verify = self.signature_payload(detached_payload)?;
        let signature = p256::ecdsa::Signature::from_slice(&self.0.signature)
            .map_err(Error::MalformedSignature)?;
        key.verify(&to_verify, &signature)
            .map_err(Error::VerificationFailed)
    }

    pub fn payload(&self) -> Option<&[u8]> {
        self.0.payload.as_deref()
    }

    pub fn unprotected_header(&self, label: i64) -> Option<&ciborium::Value> {
        self.0
            .unprotected
            .rest
            .iter()
            .find(|(l, _)| l == &coset::Label::Int(label))
            .map(|(_, v)| v)
    }
}

/// Build a COSE_Sign1 signed with an ES256 key. The payload is attached when
/// `attach_payload` is set and detached (nil on the wire) otherwise.
pub fn sign_p256(
    key: &p256::ecdsa::SigningKey,
    payload: &[u8],
    attach_payload: bool,
    unprotected: Header,
) -> CoseSign1 {
    let protected = coset::HeaderBuilder::new()
        .algorithm(iana::Algorithm::ES256)
        .build();
    let builder = coset::CoseSign1Builder::new()
        .protected(protected)
        .unprotected(unprotected);
    let builder = if attach_payload {
        builder
            .payload(payload.to_vec())
            .create_signature(&[], |pt| {
                let signature: p256::ecdsa::Signature = key.sign(pt);
                signature.to_vec()
            })
    } else {
        builder.create_detached_signature(payload, &[], |pt| {
            let signature: p256::ecdsa::Signature = key.sign(pt);
            signature.to_vec()
        })
    };
    CoseSign1(builder.build())
}

/// The protected header of a prepared COSE_Sign1 awaiting an external
/// signature, plus the exact bytes to be signed.
#[derive(Clone, Debug)]
pub struct PreparedCoseSign1 {
    cose_sign1: coset::CoseSign1,
    signature_payload: Vec<u8>,
}

impl PreparedCoseSign1 {
    pub fn new(
        algorithm: iana::Algorithm,
        payload: &[u8],
        attach_payload: bool,
        unprotected: Header,
    ) -> Self {
        let protected = ProtectedHeader {
            original_data: None,
            header: coset::HeaderBuilder::new().algorithm(algorithm).build(),
        };
        let signature_payload = coset::sig_structure_data(
            coset::SignatureContext::CoseSign1,
            protected.clone(),
            None,
            &[],
            payload,
        );
        let cose_sign1 = coset::CoseSign1 {
            protected,
            unprotected,
            payload: attach_payload.then(|| payload.to_vec()),
            signature: Vec::new(),
        };
        Self {
            cose_sign1,
            signature_payload,
        }
    }

    /// The bytes that the holder of the private key must sign.
    pub fn signature_payload(&self) -> &[u8] {
        &self.signature_payload
    }

    pub fn into_cose_sign1(self, signature: Vec<u8>) -> CoseSign1 {
        let mut inner = self.cose_sign1;
        inner.signature = signature;
        CoseSign1(inner)
    }
}

impl Serialize for CoseSign1 {
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

impl<'de> Deserialize<'de> for CoseSign1 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error as _;
        let value = ciborium::Value::deserialize(deserializer)?;
        // COSE_Sign1 is sometimes seen with its CBOR tag 18; strip it.
        let value = match value {
            ciborium::Value::Tag(18, inner) => *inner,
            other => other,
        };
        coset::CoseSign1::from_cbor_value(value)
            .map(CoseSign1)
            .map_err(D::Error::custom)
    }
}

impl CborSerializable for CoseSign1 {}

impl AsCborValue for CoseSign1 {
    fn from_cbor_value(value: ciborium::Value) -> coset::Result<Self> {
        coset::CoseSign1::from_cbor_value(value).map(CoseSign1)
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
    fn sign_and_verify_attached() {
        let key = p256::ecdsa::SigningKey::random(&mut rand::thread_rng());
        let sign1 = sign_p256(&key, b"payload", true, Header::default());
        sign1.verify_p256(key.verifying_key(), None).unwrap();
    }

    #[test]
    fn sign_and_verify_detached() {
        let key = p256::ecdsa::SigningKey::random(&mut rand::thread_rng());
        let sign1 = sign_p256(&key, b"payload", false, Header::default());
        sign1
            .verify_p256(key.verifying_key(), Some(b"payload"))
            .unwrap();
        assert!(sign1
            .verify_p256(key.verifying_key(), Some(b"tampered"))
            .is_err());
    }

    #[test]
    fn serde_roundtrip() {
        let key = p256::ecdsa::SigningKey::random(&mut rand::thread_rng());
        let sign1 = sign_p256(&key, b"payload", true, Header::default());
        let bytes = cbor::to_vec(&sign1).unwrap();
        let back: CoseSign1 = cbor::from_slice(&bytes).unwrap();
        back.verify_p256(key.verifying_key(), None).unwrap();
    }

    #[test]
    fn external_signer_loop() {
        let key = p256::ecdsa::SigningKey::random(&mut rand::thread_rng());
        let prepared =
            PreparedCoseSign1::new(iana::Algorithm::ES256, b"payload", true, Header::default());
        let signature: p256::ecdsa::Signature = key.sign(prepared.signature_payload());
        let sign1 = prepared.into_cose_sign1(signature.to_vec());
        sign1.verify_p256(key.verifying_key(), None).unwrap();
    }
}
