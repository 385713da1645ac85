//! Construction of issuer-signed credentials. The holder side of presentment
//! needs fully formed documents; this module builds and signs them.
use std::collections::BTreeMap;

use chrono::{Duration, SubsecRound, Utc};
use coset::Header;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::cbor;
use crate::cose::{self, CoseSign1};
use crate::definitions::device_key::{CoseKey, DeviceKeyInfo};
use crate::definitions::helpers::{NonEmptyMap, NonEmptyVec, Tag24};
use crate::definitions::issuer_signed::{IssuerNamespaces, IssuerSignedItem};
use crate::definitions::mso::{DigestAlgorithm, DigestIds, Mso};
use crate::definitions::validity_info::ValidityInfo;
use crate::definitions::x5chain::{X5Chain, X5CHAIN_HEADER_LABEL};

pub type Namespaces = BTreeMap<String, BTreeMap<String, ciborium::Value>>;

/// An issued credential: everything the holder needs to answer requests for
/// one document type.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Mdoc {
    pub doc_type: String,
    pub mso: Mso,
    pub namespaces: IssuerNamespaces,
    pub issuer_auth: CoseSign1,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("at least one namespace with at least one element is required")]
    EmptyNamespaces,
    #[error("could not encode CBOR: {0}")]
    Cbor(#[from] cbor::CborError),
    #[error(transparent)]
    Tag24(#[from] crate::definitions::helpers::tag24::Error),
    #[error(transparent)]
    KeyAuthorization(#[from] crate::definitions::device_key::Error),
}

#[derive(Debug, Clone, Default)]
pub struct Builder {
    doc_type: Option<String>,
    namespaces: Option<Namespaces>,
    validity_info: Option<ValidityInfo>,
    digest_algorithm: Option<DigestAlgorithm>,
    device_key_info: Option<DeviceKeyInfo>,
}

impl Mdoc {
    pub fn builder() -> Builder {
        Builder::default()
    }
}

impl Builder {
    pub fn doc_type(mut self, doc_type: impl Into<String>) -> Self {
        self.doc_type = Some(doc_type.into());
        self
    }

    pub fn namespaces(mut self, namespaces: Namespaces) -> Self {
        self.namespaces = Some(namespaces);
        self
    }

    pub fn validity_info(mut self, validity_info: ValidityInfo) -> Self {
        self.validity_info = Some(validity_info);
        self
    }

    pub fn digest_algorithm(mut self, algorithm: DigestAlgorithm) -> Self {
        self.digest_algorithm = Some(algorithm);
        self
    }

    pub fn device_key(mut self, device_key: CoseKey) -> Self {
        self.device_key_info = Some(DeviceKeyInfo {
            device_key,
            key_authorizations: None,
            key_info: None,
        });
        self
    }

    pub fn device_key_info(mut self, device_key_info: DeviceKeyInfo) -> Self {
        self.device_key_info = Some(device_key_info);
        self
    }

    /// Digest the namespaces, assemble the MSO and sign it with the issuer
    /// key, attaching the certificate chain in the unprotected header.
    pub fn issue(
        self,
        x5chain: X5Chain,
        signer: &p256::ecdsa::SigningKey,
    ) -> Result<Mdoc, Error> {
        let doc_type = self.doc_type.ok_or(Error::EmptyNamespaces)?;
        let namespaces = self.namespaces.ok_or(Error::EmptyNamespaces)?;
        let digest_algorithm = self.digest_algorithm.unwrap_or(DigestAlgorithm::SHA256);
        let device_key_info = self.device_key_info.ok_or(Error::EmptyNamespaces)?;
        if let Some(authorizations) = &device_key_info.key_authorizations {
            authorizations.validate()?;
        }
        let validity_info = self.validity_info.unwrap_or_else(|| {
            let signed = Utc::now().trunc_subsecs(0);
            ValidityInfo {
                signed,
                valid_from: signed,
                valid_until: signed + Duration::days(365),
                expected_update: None,
            }
        });

        let issuer_namespaces = to_issuer_namespaces(namespaces)?;
        let value_digests = digest_namespaces(&issuer_namespaces, digest_algorithm)?;

        let mso = Mso {
            version: "1.0".to_string(),
            digest_algorithm,
            value_digests,
            device_key_info,
            doc_type: doc_type.clone(),
            validity_info,
        };

        let mso_bytes = cbor::to_vec(&Tag24::new(mso.clone())?)?;
        let unprotected = Header {
            rest: vec![(
                coset::Label::Int(X5CHAIN_HEADER_LABEL),
                x5chain.into_header_value(),
            )],
            ..Default::default()
        };
        let issuer_auth = cose::sign1::sign_p256(signer, &mso_bytes, true, unprotected);

        Ok(Mdoc {
            doc_type,
            mso,
            namespaces: issuer_namespaces,
            issuer_auth,
        })
    }
}

fn to_issuer_namespaces(namespaces: Namespaces) -> Result<IssuerNamespaces, Error> {
    let mut out = BTreeMap::new();
    let mut digest_id: u64 = 0;
    let mut rng = rand::thread_rng();
    for (namespace, elements) in namespaces {
        let mut items = Vec::new();
        for (element_identifier, element_value) in elements {
            let random: [u8; 16] = rng.gen();
            let item = IssuerSignedItem {
                digest_id,
                random: random.to_vec().into(),
                element_identifier,
                element_value: element_value.into(),
            };
            digest_id += 1;
            items.push(Tag24::new(item)?);
        }
        let items = NonEmptyVec::maybe_new(items).ok_or(Error::EmptyNamespaces)?;
        out.insert(namespace, items);
    }
    NonEmptyMap::maybe_new(out).ok_or(Error::EmptyNamespaces)
}

fn digest_namespaces(
    namespaces: &IssuerNamespaces,
    algorithm: DigestAlgorithm,
) -> Result<BTreeMap<String, DigestIds>, Error> {
    namespaces
        .iter()
        .map(|(namespace, items)| {
            let digests = items
                .iter()
                .map(|item| {
                    // The digest covers the full tag 24 encoding of the item.
                    let bytes = cbor::to_vec(item)?;
                    Ok((item.inner.digest_id, algorithm.digest(&bytes).into()))
                })
                .collect::<Result<DigestIds, Error>>()?;
            Ok((namespace.clone(), digests))
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::definitions::session::create_p256_ephemeral_keys;

    pub const DOC_TYPE: &str = "org.iso.18013.5.1.mDL";
    pub const NAMESPACE: &str = "org.iso.18013.5.1";

    #[test]
    fn digests_cover_every_item() {
        let issuer_key = p256::ecdsa::SigningKey::random(&mut rand::thread_rng());
        let x5chain = test_x5chain();
        let (_, device_key) = create_p256_ephemeral_keys().unwrap();
        let mut elements = BTreeMap::new();
        elements.insert(
            "family_name".to_string(),
            ciborium::Value::Text("Smith".to_string()),
        );
        elements.insert("age_over_21".to_string(), ciborium::Value::Bool(true));
        let mut namespaces = BTreeMap::new();
        namespaces.insert(NAMESPACE.to_string(), elements);

        let mdoc = Mdoc::builder()
            .doc_type(DOC_TYPE)
            .namespaces(namespaces)
            .device_key(device_key)
            .issue(x5chain, &issuer_key)
            .unwrap();

        let digests = mdoc.mso.value_digests.get(NAMESPACE).unwrap();
        assert_eq!(digests.len(), 2);
        for item in mdoc.namespaces.get(NAMESPACE).unwrap().iter() {
            let bytes = cbor::to_vec(item).unwrap();
            let expected = DigestAlgorithm::SHA256.digest(&bytes);
            assert_eq!(
                digests.get(&item.inner.digest_id).unwrap().as_ref(),
                expected.as_slice()
            );
        }
        mdoc.issuer_auth
            .verify_p256(issuer_key.verifying_key(), None)
            .unwrap();
    }

    fn test_x5chain() -> X5Chain {
        X5Chain::from_pem_chain(include_str!("../test/issuer_cert.pem")).unwrap()
    }
}
