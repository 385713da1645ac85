use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cose::CoseSign1;
use crate::definitions::helpers::{NonEmptyMap, NonEmptyVec, Tag24};
use crate::definitions::session::SessionTranscript180135;

pub type ItemsRequestBytes = Tag24<ItemsRequest>;
pub type DocType = String;
pub type NameSpace = String;
pub type IntentToRetain = bool;
pub type DataElementIdentifier = String;
pub type DataElements = NonEmptyMap<DataElementIdentifier, IntentToRetain>;
pub type Namespaces = NonEmptyMap<NameSpace, DataElements>;
pub type ReaderAuth = CoseSign1;

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRequest {
    pub version: String,
    pub doc_requests: NonEmptyVec<DocRequest>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocRequest {
    pub items_request: ItemsRequestBytes,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reader_auth: Option<ReaderAuth>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ItemsRequest {
    pub doc_type: DocType,
    #[serde(rename = "nameSpaces")]
    pub namespaces: Namespaces,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_info: Option<BTreeMap<String, ciborium::Value>>,
}

/// The structure a reader signature covers: a context string, the session
/// transcript, and the request being signed. Never sent on the wire; both
/// sides reconstruct it.
#[derive(Clone, Debug, Serialize)]
pub struct ReaderAuthentication(
    &'static str,
    pub SessionTranscript180135,
    pub ItemsRequestBytes,
);

impl ReaderAuthentication {
    pub fn new(transcript: SessionTranscript180135, items_request: ItemsRequestBytes) -> Self {
        Self("ReaderAuthentication", transcript, items_request)
    }
}

impl DeviceRequest {
    pub const VERSION: &'static str = "1.0";
}
