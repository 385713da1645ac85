//! Engagement structures: how one party advertises its ephemeral key and the
//! connection methods the other party may use to reach it.
pub mod error;
pub mod nfc_options;

use ciborium::Value;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use error::Error;
pub use nfc_options::NfcOptions;

use crate::definitions::device_key::CoseKey;
use crate::definitions::helpers::{NonEmptyVec, Tag24};

pub type EDeviceKeyBytes = Tag24<CoseKey>;
pub type EReaderKeyBytes = Tag24<CoseKey>;
pub type DeviceRetrievalMethods = NonEmptyVec<DeviceRetrievalMethod>;
pub type ProtocolInfo = Value;

/// The holder-generated engagement: protocol version, ephemeral key and the
/// connection methods on offer. Conveyed by QR code or NFC handover.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "Value", into = "Value")]
pub struct DeviceEngagement {
    pub version: String,
    pub security: Security,
    pub device_retrieval_methods: DeviceRetrievalMethods,
}

/// The reader-generated counterpart for reader-initiated flows such as NFC
/// negotiated handover. Connection methods are optional here: the reader may
/// rely on the carrier records of the handover instead.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "Value", into = "Value")]
pub struct ReaderEngagement {
    pub version: String,
    pub security: Security,
    pub reader_retrieval_methods: Option<DeviceRetrievalMethods>,
}

/// Cipher suite identifier (always 1) and the ephemeral public key as an
/// embedded data item, preserving the exact bytes for key derivation.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "Value", into = "Value")]
pub struct Security(pub u64, pub EDeviceKeyBytes);

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "Value", into = "Value")]
pub enum DeviceRetrievalMethod {
    NFC(NfcOptions),
    BLE(BleOptions),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(try_from = "Value", into = "Value")]
pub struct BleOptions {
    pub peripheral_server_mode: Option<PeripheralServerMode>,
    pub central_client_mode: Option<CentralClientMode>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeripheralServerMode {
    pub uuid: Uuid,
    pub ble_device_address: Option<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CentralClientMode {
    pub uuid: Uuid,
}

impl DeviceEngagement {
    pub const VERSION: &'static str = "1.0";

    pub fn new(e_device_key: EDeviceKeyBytes, methods: DeviceRetrievalMethods) -> Self {
        Self {
            version: Self::VERSION.to_string(),
            security: Security(1, e_device_key),
            device_retrieval_methods: methods,
        }
    }
}

impl ReaderEngagement {
    pub fn new(e_reader_key: EReaderKeyBytes, methods: Option<DeviceRetrievalMethods>) -> Self {
        Self {
            version: DeviceEngagement::VERSION.to_string(),
            security: Security(1, e_reader_key),
            reader_retrieval_methods: methods,
        }
    }
}

impl Tag24<DeviceEngagement> {
    const BASE64_CONFIG: base64::Config = base64::URL_SAFE_NO_PAD;

    pub fn to_qr_code_uri(&self) -> String {
        let mut qr_code_uri = String::from("mdoc:");
        base64::encode_config_buf(&self.inner_bytes, Self::BASE64_CONFIG, &mut qr_code_uri);
        qr_code_uri
    }

    pub fn from_qr_code_uri(qr_code_uri: &str) -> Result<Self, Error> {
        let encoded = qr_code_uri.strip_prefix("mdoc:").ok_or(Error::InvalidUri)?;
        let decoded = base64::decode_config(encoded, Self::BASE64_CONFIG)?;
        Tag24::<DeviceEngagement>::from_bytes(decoded).map_err(Into::into)
    }
}

impl DeviceRetrievalMethod {
    pub fn version(&self) -> u64 {
        1
    }

    pub fn transport_type(&self) -> u64 {
        match self {
            Self::NFC(_) => 1,
            Self::BLE(_) => 2,
        }
    }
}

impl From<DeviceEngagement> for Value {
    fn from(e: DeviceEngagement) -> Value {
        Value::Map(vec![
            (Value::Integer(0.into()), Value::Text(e.version)),
            (Value::Integer(1.into()), e.security.into()),
            (
                Value::Integer(2.into()),
                Value::Array(
                    e.device_retrieval_methods
                        .into_inner()
                        .into_iter()
                        .map(Into::into)
                        .collect(),
                ),
            ),
        ])
    }
}

impl TryFrom<Value> for DeviceEngagement {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self, Error> {
        let Value::Map(map) = v else {
            return Err(Error::InvalidDeviceEngagement);
        };
        let mut version = None;
        let mut security = None;
        let mut methods = None;
        for (k, v) in map {
            let Value::Integer(label) = k else { continue };
            match i128::from(label) {
                0 => version = Some(v),
                1 => security = Some(v),
                2 => methods = Some(v),
                // Server retrieval methods and protocol info are tolerated
                // but not supported.
                _ => {}
            }
        }
        let version = match version {
            Some(Value::Text(s)) if s == DeviceEngagement::VERSION => s,
            _ => return Err(Error::Version),
        };
        let security = security
            .ok_or(Error::Malformed("missing security"))?
            .try_into()?;
        let methods = match methods.ok_or(Error::EmptyRetrievalMethods)? {
            Value::Array(methods) => methods
                .into_iter()
                .map(DeviceRetrievalMethod::try_from)
                .collect::<Result<Vec<_>, _>>()?,
            _ => return Err(Error::Malformed("retrieval methods must be an array")),
        };
        let device_retrieval_methods =
            NonEmptyVec::maybe_new(methods).ok_or(Error::EmptyRetrievalMethods)?;
        Ok(DeviceEngagement {
            version,
            security,
            device_retrieval_methods,
        })
    }
}

impl From<ReaderEngagement> for Value {
    fn from(e: ReaderEngagement) -> Value {
        let mut map = vec![
            (Value::Integer(0.into()), Value::Text(e.version)),
            (Value::Integer(1.into()), e.security.into()),
        ];
        if let Some(methods) = e.reader_retrieval_methods {
            map.push((
                Value::Integer(2.into()),
                Value::Array(methods.into_inner().into_iter().map(Into::into).collect()),
            ));
        }
        Value::Map(map)
    }
}

impl TryFrom<Value> for ReaderEngagement {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self, Error> {
        let Value::Map(map) = v else {
            return Err(Error::InvalidDeviceEngagement);
        };
        let mut version = None;
        let mut security = None;
        let mut methods = None;
        for (k, v) in map {
            let Value::Integer(label) = k else { continue };
            match i128::from(label) {
                0 => version = Some(v),
                1 => security = Some(v),
                2 => methods = Some(v),
                _ => {}
            }
        }
        let version = match version {
            Some(Value::Text(s)) if s == DeviceEngagement::VERSION => s,
            _ => return Err(Error::Version),
        };
        let security = security
            .ok_or(Error::Malformed("missing security"))?
            .try_into()?;
        let reader_retrieval_methods = match methods {
            None => None,
            Some(Value::Array(methods)) => {
                let methods = methods
                    .into_iter()
                    .map(DeviceRetrievalMethod::try_from)
                    .collect::<Result<Vec<_>, _>>()?;
                Some(NonEmptyVec::maybe_new(methods).ok_or(Error::EmptyRetrievalMethods)?)
            }
            Some(_) => return Err(Error::Malformed("retrieval methods must be an array")),
        };
        Ok(ReaderEngagement {
            version,
            security,
            reader_retrieval_methods,
        })
    }
}

impl From<Security> for Value {
    fn from(s: Security) -> Value {
        let key: Value = crate::cbor::into_value(s.1).unwrap_or(Value::Null);
        Value::Array(vec![Value::Integer(s.0.into()), key])
    }
}

impl TryFrom<Value> for Security {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self, Error> {
        let Value::Array(arr) = v else {
            return Err(Error::Malformed("security must be an array"));
        };
        let mut iter = arr.into_iter();
        let cipher_suite = match iter.next() {
            Some(Value::Integer(i)) if i128::from(i) == 1 => 1,
            _ => return Err(Error::Malformed("unsupported cipher suite")),
        };
        let key = iter.next().ok_or(Error::EphemeralKey)?;
        let key: EDeviceKeyBytes =
            crate::cbor::from_value(key).map_err(|_| Error::EphemeralKey)?;
        Ok(Security(cipher_suite, key))
    }
}

impl From<DeviceRetrievalMethod> for Value {
    fn from(m: DeviceRetrievalMethod) -> Value {
        let transport_type = Value::Integer(m.transport_type().into());
        let version = Value::Integer(m.version().into());
        let options = match m {
            DeviceRetrievalMethod::NFC(options) => options.into(),
            DeviceRetrievalMethod::BLE(options) => options.into(),
        };
        Value::Array(vec![transport_type, version, options])
    }
}

impl TryFrom<Value> for DeviceRetrievalMethod {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self, Error> {
        let Value::Array(arr) = v else {
            return Err(Error::Malformed("retrieval method must be an array"));
        };
        let [transport_type, version, options]: [Value; 3] = arr
            .try_into()
            .map_err(|_| Error::Malformed("retrieval method must have three elements"))?;
        match version {
            Value::Integer(i) if i128::from(i) == 1 => {}
            _ => return Err(Error::Malformed("unsupported retrieval method version")),
        }
        match transport_type {
            Value::Integer(i) if i128::from(i) == 1 => {
                Ok(DeviceRetrievalMethod::NFC(options.try_into()?))
            }
            Value::Integer(i) if i128::from(i) == 2 => {
                Ok(DeviceRetrievalMethod::BLE(options.try_into()?))
            }
            Value::Integer(i) => Err(Error::UnsupportedRetrievalMethod(
                u64::try_from(i128::from(i)).unwrap_or(u64::MAX),
            )),
            _ => Err(Error::Malformed("transport type must be an integer")),
        }
    }
}

impl From<BleOptions> for Value {
    fn from(o: BleOptions) -> Value {
        let mut map = vec![
            (
                Value::Integer(0.into()),
                Value::Bool(o.peripheral_server_mode.is_some()),
            ),
            (
                Value::Integer(1.into()),
                Value::Bool(o.central_client_mode.is_some()),
            ),
        ];
        if let Some(peripheral) = o.peripheral_server_mode {
            map.push((
                Value::Integer(10.into()),
                Value::Bytes(peripheral.uuid.as_bytes().to_vec()),
            ));
            if let Some(address) = peripheral.ble_device_address {
                map.push((Value::Integer(20.into()), Value::Bytes(address)));
            }
        }
        if let Some(central) = o.central_client_mode {
            map.push((
                Value::Integer(11.into()),
                Value::Bytes(central.uuid.as_bytes().to_vec()),
            ));
        }
        Value::Map(map)
    }
}

impl TryFrom<Value> for BleOptions {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self, Error> {
        let Value::Map(map) = v else {
            return Err(Error::InvalidOptions("BLE options must be a map"));
        };
        let mut peripheral_supported = false;
        let mut central_supported = false;
        let mut peripheral_uuid = None;
        let mut central_uuid = None;
        let mut address = None;
        for (k, v) in map {
            let Value::Integer(label) = k else { continue };
            match (i128::from(label), v) {
                (0, Value::Bool(b)) => peripheral_supported = b,
                (1, Value::Bool(b)) => central_supported = b,
                (10, Value::Bytes(b)) => peripheral_uuid = Some(decode_uuid(&b)?),
                (11, Value::Bytes(b)) => central_uuid = Some(decode_uuid(&b)?),
                (20, Value::Bytes(b)) => address = Some(b),
                _ => {}
            }
        }
        let peripheral_server_mode = match (peripheral_supported, peripheral_uuid) {
            (true, Some(uuid)) => Some(PeripheralServerMode {
                uuid,
                ble_device_address: address,
            }),
            (true, None) => return Err(Error::InvalidOptions("peripheral server mode lacks a UUID")),
            (false, _) => None,
        };
        let central_client_mode = match (central_supported, central_uuid) {
            (true, Some(uuid)) => Some(CentralClientMode { uuid }),
            (true, None) => return Err(Error::InvalidOptions("central client mode lacks a UUID")),
            (false, _) => None,
        };
        if peripheral_server_mode.is_none() && central_client_mode.is_none() {
            return Err(Error::InvalidOptions("BLE options support neither mode"));
        }
        Ok(BleOptions {
            peripheral_server_mode,
            central_client_mode,
        })
    }
}

fn decode_uuid(bytes: &[u8]) -> Result<Uuid, Error> {
    let array: [u8; 16] = bytes
        .try_into()
        .map_err(|_| Error::InvalidOptions("UUID must be 16 bytes"))?;
    Ok(Uuid::from_bytes(array))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cbor;
    use crate::definitions::session::create_p256_ephemeral_keys;

    fn engagement() -> DeviceEngagement {
        let (_, e_device_key) = create_p256_ephemeral_keys().unwrap();
        let key_bytes = Tag24::new(e_device_key).unwrap();
        let method = DeviceRetrievalMethod::BLE(BleOptions {
            peripheral_server_mode: None,
            central_client_mode: Some(CentralClientMode {
                uuid: Uuid::new_v4(),
            }),
        });
        DeviceEngagement::new(key_bytes, NonEmptyVec::new(method))
    }

    #[test]
    fn roundtrip() {
        let e = engagement();
        let bytes = cbor::to_vec(&e).unwrap();
        let back: DeviceEngagement = cbor::from_slice(&bytes).unwrap();
        assert_eq!(e, back);
    }

    #[test]
    fn qr_code_uri_roundtrip() {
        let tagged = Tag24::new(engagement()).unwrap();
        let uri = tagged.to_qr_code_uri();
        assert!(uri.starts_with("mdoc:"));
        assert!(!uri.contains('='));
        let back = Tag24::<DeviceEngagement>::from_qr_code_uri(&uri).unwrap();
        assert_eq!(tagged.inner_bytes, back.inner_bytes);
    }

    #[test]
    fn missing_ephemeral_key_rejected() {
        let value = Value::Map(vec![
            (Value::Integer(0.into()), Value::Text("1.0".into())),
            (
                Value::Integer(1.into()),
                Value::Array(vec![Value::Integer(1.into())]),
            ),
            (Value::Integer(2.into()), Value::Array(vec![])),
        ]);
        assert!(DeviceEngagement::try_from(value).is_err());
    }

    #[test]
    fn empty_retrieval_methods_rejected() {
        let mut e: Value = engagement().into();
        if let Value::Map(map) = &mut e {
            map[2].1 = Value::Array(vec![]);
        }
        assert!(matches!(
            DeviceEngagement::try_from(e),
            Err(Error::EmptyRetrievalMethods)
        ));
    }

    #[test]
    fn unknown_top_level_keys_tolerated() {
        let mut e: Value = engagement().into();
        if let Value::Map(map) = &mut e {
            map.push((Value::Integer(4.into()), Value::Text("opaque".into())));
        }
        assert!(DeviceEngagement::try_from(e).is_ok());
    }
}
