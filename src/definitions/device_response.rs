use std::collections::BTreeMap;

use ciborium::Value;
use serde::{Deserialize, Serialize};

use crate::definitions::device_signed::DeviceSigned;
use crate::definitions::helpers::{NonEmptyMap, NonEmptyVec};
use crate::definitions::issuer_signed::IssuerSigned;
use crate::definitions::zk::ZkDocument;

pub type Documents = NonEmptyVec<Document>;
pub type ZkDocuments = NonEmptyVec<ZkDocument>;
pub type DocumentErrors = NonEmptyVec<DocumentError>;
pub type DocumentError = BTreeMap<String, DocumentErrorCode>;
pub type Errors = NonEmptyMap<String, NonEmptyMap<String, DocumentErrorCode>>;

/// The holder's answer to a device request. Documents may be conventionally
/// signed, zero-knowledge, or both in a single response.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceResponse {
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub documents: Option<Documents>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zk_documents: Option<ZkDocuments>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_errors: Option<DocumentErrors>,
    pub status: Status,
}

impl DeviceResponse {
    pub const VERSION: &'static str = "1.0";
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub doc_type: String,
    pub issuer_signed: IssuerSigned,
    pub device_signed: DeviceSigned,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors: Option<Errors>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(try_from = "Value", into = "Value")]
pub enum Status {
    OK,
    GeneralError,
    CborDecodingError,
    CborValidationError,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(try_from = "Value", into = "Value")]
pub enum DocumentErrorCode {
    DataNotReturned,
    ApplicationSpecific(i128),
}

impl From<Status> for Value {
    fn from(s: Status) -> Value {
        let i: u64 = match s {
            Status::OK => 0,
            Status::GeneralError => 10,
            Status::CborDecodingError => 11,
            Status::CborValidationError => 12,
        };
        Value::Integer(i.into())
    }
}

impl TryFrom<Value> for Status {
    type Error = String;

    fn try_from(v: Value) -> Result<Self, String> {
        match v {
            Value::Integer(i) => match i128::from(i) {
                0 => Ok(Status::OK),
                10 => Ok(Status::GeneralError),
                11 => Ok(Status::CborDecodingError),
                12 => Ok(Status::CborValidationError),
                i => Err(format!("unrecognised response status: {i}")),
            },
            _ => Err("response status must be an integer".to_string()),
        }
    }
}

impl From<DocumentErrorCode> for Value {
    fn from(c: DocumentErrorCode) -> Value {
        match c {
            DocumentErrorCode::DataNotReturned => Value::Integer(0.into()),
            DocumentErrorCode::ApplicationSpecific(i) => {
                Value::Integer(i.try_into().unwrap_or_else(|_| 0.into()))
            }
        }
    }
}

impl TryFrom<Value> for DocumentErrorCode {
    type Error = String;

    fn try_from(v: Value) -> Result<Self, String> {
        match v {
            Value::Integer(i) => match i128::from(i) {
                0 => Ok(DocumentErrorCode::DataNotReturned),
                i => Ok(DocumentErrorCode::ApplicationSpecific(i)),
            },
            _ => Err("document error code must be an integer".to_string()),
        }
    }
}
