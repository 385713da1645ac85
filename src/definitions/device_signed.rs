use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cose::{CoseMac0, CoseSign1};
use crate::definitions::helpers::Tag24;
use crate::definitions::session::SessionTranscript180135;

pub type DeviceNamespaces = BTreeMap<String, DeviceSignedItems>;
pub type DeviceNamespacesBytes = Tag24<DeviceNamespaces>;
pub type DeviceSignedItems = BTreeMap<String, ciborium::Value>;

/// The holder-authenticated portion of a document.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSigned {
    #[serde(rename = "nameSpaces")]
    pub namespaces: DeviceNamespacesBytes,
    pub device_auth: DeviceAuth,
}

/// Either style of device authentication over [DeviceAuthentication].
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceAuth {
    DeviceSignature(CoseSign1),
    DeviceMac(CoseMac0),
}

/// The structure a device signature or MAC covers. Never sent on the wire;
/// both sides reconstruct it.
#[derive(Clone, Debug, Serialize)]
pub struct DeviceAuthentication(
    &'static str,
    pub SessionTranscript180135,
    pub String,
    pub DeviceNamespacesBytes,
);

impl DeviceAuthentication {
    pub fn new(
        transcript: SessionTranscript180135,
        doc_type: String,
        namespaces_bytes: DeviceNamespacesBytes,
    ) -> Self {
        Self("DeviceAuthentication", transcript, doc_type, namespaces_bytes)
    }
}
