//! Shared fixtures: a demo credential and the request a reader makes of it.
#![allow(dead_code)]
use std::collections::BTreeMap;

use mdoc_proximity::definitions::device_key::CoseKey;
use mdoc_proximity::definitions::device_request::ItemsRequest;
use mdoc_proximity::definitions::helpers::NonEmptyMap;
use mdoc_proximity::definitions::x5chain::X5Chain;
use mdoc_proximity::issuance::Mdoc;

pub const DOC_TYPE: &str = "org.iso.18013.5.1.mDL";
pub const NAMESPACE: &str = "org.iso.18013.5.1";

pub const ISSUER_KEY: &str = include_str!("../../test/issuer_key.pem");
pub const ISSUER_CERT: &str = include_str!("../../test/issuer_cert.pem");
pub const READER_KEY: &str = include_str!("../../test/reader_key.pem");
pub const READER_CERT: &str = include_str!("../../test/reader_cert.pem");

pub fn issue_mdoc(device_key: CoseKey) -> Mdoc {
    let issuer_key = p256::SecretKey::from_sec1_pem(ISSUER_KEY).unwrap();
    let signer = p256::ecdsa::SigningKey::from(issuer_key);
    let elements: BTreeMap<String, ciborium::Value> = [
        ("family_name", ciborium::Value::Text("Mustermann".into())),
        ("given_name", ciborium::Value::Text("Erika".into())),
        ("document_number", ciborium::Value::Text("0123456789".into())),
        ("age_over_21", ciborium::Value::Bool(true)),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect();
    let namespaces = [(NAMESPACE.to_string(), elements)].into_iter().collect();
    Mdoc::builder()
        .doc_type(DOC_TYPE)
        .namespaces(namespaces)
        .device_key(device_key)
        .issue(X5Chain::from_pem_chain(ISSUER_CERT).unwrap(), &signer)
        .unwrap()
}

pub fn demo_request() -> ItemsRequest {
    let mut elements = NonEmptyMap::new("family_name".to_string(), false);
    elements.insert("given_name".to_string(), false);
    elements.insert("age_over_21".to_string(), true);
    ItemsRequest {
        doc_type: DOC_TYPE.to_string(),
        namespaces: NonEmptyMap::new(NAMESPACE.to_string(), elements),
        request_info: None,
    }
}
