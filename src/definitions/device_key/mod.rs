pub mod cose_key;

use std::collections::BTreeMap;

pub use cose_key::{CoseKey, EC2Curve, EC2Y};
use serde::{Deserialize, Serialize};

use crate::definitions::helpers::NonEmptyVec;

pub type KeyInfo = BTreeMap<i64, crate::cbor::Value>;

/// Metadata about the key authorised to sign or MAC the device namespaces.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeviceKeyInfo {
    pub device_key: CoseKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_authorizations: Option<KeyAuthorizations>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_info: Option<KeyInfo>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KeyAuthorizations {
    #[serde(skip_serializing_if = "Option::is_none", rename = "nameSpaces")]
    pub namespaces: Option<NonEmptyVec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_elements: Option<BTreeMap<String, NonEmptyVec<String>>>,
}

impl KeyAuthorizations {
    /// A key authorised for a full namespace must not also carry element-level
    /// grants for that namespace.
    pub fn validate(&self) -> Result<(), Error> {
        let Some(namespaces) = &self.namespaces else {
            return Ok(());
        };
        if let Some(elements) = &self.data_elements {
            for namespace in namespaces.iter() {
                if elements.contains_key(namespace) {
                    return Err(Error::DoubleAuthorized(namespace.clone()));
                }
            }
        }
        Ok(())
    }

    pub fn permits(&self, namespace: &str, element: &str) -> bool {
        if let Some(namespaces) = &self.namespaces {
            if namespaces.iter().any(|ns| ns == namespace) {
                return true;
            }
        }
        if let Some(elements) = &self.data_elements {
            if let Some(granted) = elements.get(namespace) {
                return granted.iter().any(|el| el == element);
            }
        }
        false
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("namespace '{0}' is authorized at both the namespace and element level")]
    DoubleAuthorized(String),
}
