//! The presentment state machines for both parties: the holder (device) and
//! the reader.
pub mod device;
pub mod reader;
pub mod zkp;

use base64::{decode_config, encode_config, URL_SAFE_NO_PAD};
use hkdf::Hkdf;
use serde::{de::DeserializeOwned, Serialize};
use sha2::Sha256;

use crate::cbor;
use crate::definitions::device_engagement::EDeviceKeyBytes;

#[derive(Debug, thiserror::Error)]
pub enum StringifyError {
    #[error("could not encode CBOR: {0}")]
    Cbor(#[from] cbor::CborError),
    #[error("could not decode base64: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Compact serialization of presentment states, so a holder or reader can be
/// persisted between protocol steps.
pub trait Stringify: Serialize + DeserializeOwned {
    fn stringify(&self) -> Result<String, StringifyError> {
        Ok(encode_config(cbor::to_vec(self)?, URL_SAFE_NO_PAD))
    }

    fn parse(encoded: &str) -> Result<Self, StringifyError> {
        Ok(cbor::from_slice(&decode_config(encoded, URL_SAFE_NO_PAD)?)?)
    }
}

/// The BLE identifier both parties derive from the holder's ephemeral key,
/// letting the reader confirm it reached the advertised device before any
/// application data flows.
pub fn calculate_ble_ident(e_device_key: &EDeviceKeyBytes) -> anyhow::Result<[u8; 16]> {
    let ikm = cbor::to_vec(e_device_key)?;
    let okm = Hkdf::<Sha256>::new(None, &ikm);
    let mut output = [0u8; 16];
    okm.expand(b"BLEIdent", &mut output)
        .map_err(|e| anyhow::anyhow!("cannot derive BLE ident: {e}"))?;
    Ok(output)
}
