use ciborium::Value;
use serde::{Deserialize, Serialize};

use super::error::Error;

/// Maximum lengths the NFC data-exchange tunnel may use, as negotiated
/// through the engagement.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "Value", into = "Value")]
pub struct NfcOptions {
    max_len_command_data_field: CommandDataLength,
    max_len_response_data_field: ResponseDataLength,
}

/// Maximum length of an NFC command data field; valid range 255 to 65535.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct CommandDataLength(u16);

/// Maximum length of an NFC response data field; valid range 256 to 65536.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ResponseDataLength(u32);

impl NfcOptions {
    pub fn new(
        max_len_command_data_field: CommandDataLength,
        max_len_response_data_field: ResponseDataLength,
    ) -> Self {
        Self {
            max_len_command_data_field,
            max_len_response_data_field,
        }
    }

    pub fn max_command_len(&self) -> usize {
        self.max_len_command_data_field.0 as usize
    }

    pub fn max_response_len(&self) -> usize {
        self.max_len_response_data_field.0 as usize
    }
}

impl Default for NfcOptions {
    fn default() -> Self {
        Self {
            max_len_command_data_field: CommandDataLength::MAX,
            max_len_response_data_field: ResponseDataLength::MAX,
        }
    }
}

impl CommandDataLength {
    pub const MIN: CommandDataLength = CommandDataLength(255);
    pub const MAX: CommandDataLength = CommandDataLength(65535);

    pub fn new(v: u16) -> Option<Self> {
        (v >= Self::MIN.0).then_some(Self(v))
    }
}

impl ResponseDataLength {
    pub const MIN: ResponseDataLength = ResponseDataLength(256);
    pub const MAX: ResponseDataLength = ResponseDataLength(65536);

    pub fn new(v: u32) -> Option<Self> {
        (v >= Self::MIN.0 && v <= Self::MAX.0).then_some(Self(v))
    }
}

impl From<NfcOptions> for Value {
    fn from(o: NfcOptions) -> Value {
        Value::Map(vec![
            (
                Value::Integer(0.into()),
                Value::Integer(u64::from(o.max_len_command_data_field.0).into()),
            ),
            (
                Value::Integer(1.into()),
                Value::Integer(u64::from(o.max_len_response_data_field.0).into()),
            ),
        ])
    }
}

impl TryFrom<Value> for NfcOptions {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self, Error> {
        let Value::Map(map) = v else {
            return Err(Error::InvalidOptions("NFC options must be a map"));
        };
        let mut command = None;
        let mut response = None;
        for (k, v) in map {
            let (Value::Integer(k), Value::Integer(v)) = (k, v) else {
                continue;
            };
            let v: u64 = v
                .try_into()
                .map_err(|_| Error::InvalidOptions("length must be a positive integer"))?;
            match i128::from(k) {
                0 => {
                    command = Some(
                        u16::try_from(v)
                            .ok()
                            .and_then(CommandDataLength::new)
                            .ok_or(Error::NfcDataLength(v))?,
                    )
                }
                1 => {
                    response = Some(
                        u32::try_from(v)
                            .ok()
                            .and_then(ResponseDataLength::new)
                            .ok_or(Error::NfcDataLength(v))?,
                    )
                }
                _ => {}
            }
        }
        Ok(NfcOptions {
            max_len_command_data_field: command
                .ok_or(Error::InvalidOptions("missing max command data length"))?,
            max_len_response_data_field: response
                .ok_or(Error::InvalidOptions("missing max response data length"))?,
        })
    }
}
