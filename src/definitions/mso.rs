use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::definitions::device_key::DeviceKeyInfo;
use crate::definitions::helpers::ByteStr;
use crate::definitions::validity_info::ValidityInfo;

pub type DigestId = u64;
pub type DigestIds = BTreeMap<DigestId, ByteStr>;

/// The signed summary of an issued credential: a digest per issuer-signed
/// item, the key authorised to perform device authentication, and the
/// validity window.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Mso {
    pub version: String,
    pub digest_algorithm: DigestAlgorithm,
    pub value_digests: BTreeMap<String, DigestIds>,
    pub device_key_info: DeviceKeyInfo,
    pub doc_type: String,
    pub validity_info: ValidityInfo,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum DigestAlgorithm {
    #[serde(rename = "SHA-256")]
    SHA256,
    #[serde(rename = "SHA-384")]
    SHA384,
    #[serde(rename = "SHA-512")]
    SHA512,
}

impl DigestAlgorithm {
    pub fn digest(&self, bytes: &[u8]) -> Vec<u8> {
        use sha2::Digest;
        match self {
            DigestAlgorithm::SHA256 => sha2::Sha256::digest(bytes).to_vec(),
            DigestAlgorithm::SHA384 => sha2::Sha384::digest(bytes).to_vec(),
            DigestAlgorithm::SHA512 => sha2::Sha512::digest(bytes).to_vec(),
        }
    }
}
