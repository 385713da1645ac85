use serde::{Deserialize, Serialize};

use crate::cbor::Value;
use crate::cose::CoseSign1;
use crate::definitions::helpers::{ByteStr, NonEmptyMap, NonEmptyVec, Tag24};
use crate::definitions::mso::DigestId;

pub type IssuerSignedItemBytes = Tag24<IssuerSignedItem>;
pub type IssuerNamespaces = NonEmptyMap<String, NonEmptyVec<IssuerSignedItemBytes>>;
pub type IssuerAuth = CoseSign1;

/// The issuer-signed portion of a document: the items disclosed to the
/// reader plus the COSE_Sign1 over the mobile security object.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuerSigned {
    #[serde(skip_serializing_if = "Option::is_none", rename = "nameSpaces")]
    pub namespaces: Option<IssuerNamespaces>,
    pub issuer_auth: IssuerAuth,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IssuerSignedItem {
    #[serde(rename = "digestID")]
    pub digest_id: DigestId,
    pub random: ByteStr,
    pub element_identifier: String,
    pub element_value: Value,
}
