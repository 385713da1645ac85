use std::ops::Deref;

use serde::{Deserialize, Serialize};

/// An opaque byte string that encodes to and from a CBOR `bstr`.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ByteStr(#[serde(with = "serde_bytes")] Vec<u8>);

impl From<Vec<u8>> for ByteStr {
    fn from(bytes: Vec<u8>) -> ByteStr {
        ByteStr(bytes)
    }
}

impl From<ByteStr> for Vec<u8> {
    fn from(bytes: ByteStr) -> Vec<u8> {
        bytes.0
    }
}

impl AsRef<[u8]> for ByteStr {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Deref for ByteStr {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cbor;
    use hex::FromHex;

    #[test]
    fn encodes_as_bstr() {
        let bytes = ByteStr::from(vec![0xB5, 0x27, 0x02]);
        let encoded = cbor::to_vec(&bytes).unwrap();
        assert_eq!(encoded, Vec::<u8>::from_hex("43b52702").unwrap());
        let decoded: ByteStr = cbor::from_slice(&encoded).unwrap();
        assert_eq!(decoded, bytes);
    }
}
