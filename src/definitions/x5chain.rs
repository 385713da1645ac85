use ciborium::Value;
use serde::{Deserialize, Serialize};
use x509_cert::der::referenced::OwnedToRef;
use x509_cert::der::Decode;
use x509_cert::Certificate;

use crate::definitions::helpers::{ByteStr, NonEmptyVec};

/// Unprotected header label carrying the signer's certificate chain.
pub const X5CHAIN_HEADER_LABEL: i64 = 33;

/// An ordered certificate chain, leaf first, as DER byte strings.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "Value", into = "Value")]
pub struct X5Chain(NonEmptyVec<ByteStr>);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("an x5chain is a certificate byte string or an array of them")]
    Malformed,
    #[error("could not parse PEM: {0}")]
    Pem(String),
    #[error("could not parse certificate DER: {0}")]
    Der(String),
    #[error("the end-entity key is not a supported EC public key")]
    UnsupportedKey,
}

impl X5Chain {
    pub fn from_der_chain(certs: Vec<Vec<u8>>) -> Result<Self, Error> {
        for der in &certs {
            Certificate::from_der(der).map_err(|e| Error::Der(e.to_string()))?;
        }
        NonEmptyVec::maybe_new(certs.into_iter().map(ByteStr::from).collect())
            .map(X5Chain)
            .ok_or(Error::Malformed)
    }

    /// Parse one or more concatenated PEM `CERTIFICATE` blocks, leaf first.
    pub fn from_pem_chain(pem: &str) -> Result<Self, Error> {
        let mut certs = Vec::new();
        for block in pem.split_inclusive("-----END CERTIFICATE-----") {
            let block = block.trim();
            if block.is_empty() {
                continue;
            }
            let (label, der) =
                pem_rfc7468::decode_vec(block.as_bytes()).map_err(|e| Error::Pem(e.to_string()))?;
            if label != "CERTIFICATE" {
                return Err(Error::Pem(format!("unexpected PEM label: {label}")));
            }
            certs.push(der);
        }
        Self::from_der_chain(certs)
    }

    pub fn end_entity(&self) -> Result<Certificate, Error> {
        Certificate::from_der(self.0[0].as_ref()).map_err(|e| Error::Der(e.to_string()))
    }

    /// The public key of the leaf certificate, for signature verification.
    pub fn end_entity_public_key(&self) -> Result<p256::ecdsa::VerifyingKey, Error> {
        let certificate = self.end_entity()?;
        let key: p256::PublicKey = certificate
            .tbs_certificate
            .subject_public_key_info
            .owned_to_ref()
            .try_into()
            .map_err(|_| Error::UnsupportedKey)?;
        Ok(key.into())
    }

    /// The header value: a single byte string for a chain of one, an array
    /// otherwise.
    pub fn into_header_value(self) -> Value {
        let mut certs: Vec<ByteStr> = self.0.into_inner();
        if certs.len() == 1 {
            Value::Bytes(certs.remove(0).into())
        } else {
            certs
                .into_iter()
                .map(|c| Value::Bytes(c.into()))
                .collect::<Vec<Value>>()
                .into()
        }
    }
}

impl From<X5Chain> for Value {
    fn from(chain: X5Chain) -> Value {
        chain.into_header_value()
    }
}

impl TryFrom<Value> for X5Chain {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self, Error> {
        match v {
            Value::Bytes(b) => Ok(X5Chain(NonEmptyVec::new(b.into()))),
            Value::Array(certs) => {
                let certs = certs
                    .into_iter()
                    .map(|c| match c {
                        Value::Bytes(b) => Ok(ByteStr::from(b)),
                        _ => Err(Error::Malformed),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                NonEmptyVec::maybe_new(certs)
                    .map(X5Chain)
                    .ok_or(Error::Malformed)
            }
            _ => Err(Error::Malformed),
        }
    }
}
