use ciborium::Value;
use p256::EncodedPoint as P256EncodedPoint;
use p384::EncodedPoint as P384EncodedPoint;
use serde::{Deserialize, Serialize};

/// An EC2 COSE_Key as used for ephemeral session keys and mdoc
/// authentication keys.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(try_from = "Value", into = "Value")]
pub enum CoseKey {
    EC2 { crv: EC2Curve, x: Vec<u8>, y: EC2Y },
}

#[derive(Clone, Debug, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EC2Curve {
    P256,
    P384,
}

/// The y-coordinate of an EC2 key, either a full coordinate or a sign bit
/// (point compression).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum EC2Y {
    Value(Vec<u8>),
    SignBit(bool),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("COSE_Key of kty 'EC2' missing required parameter: {0}")]
    EC2MissingParameter(&'static str),
    #[error("unable to discern the elliptic curve")]
    UnknownCurve,
    #[error("could not reconstruct a point from the provided coordinates")]
    InvalidCoordinates,
    #[error("this implementation only supports uncompressed points")]
    UnsupportedFormat,
    #[error("could not parse CBOR as a COSE_Key: {0}")]
    NotAKey(&'static str),
}

impl CoseKey {
    pub fn curve(&self) -> EC2Curve {
        match self {
            CoseKey::EC2 { crv, .. } => *crv,
        }
    }

    pub fn signature_algorithm(&self) -> coset::iana::Algorithm {
        match self.curve() {
            EC2Curve::P256 => coset::iana::Algorithm::ES256,
            EC2Curve::P384 => coset::iana::Algorithm::ES384,
        }
    }
}

impl From<CoseKey> for Value {
    fn from(key: CoseKey) -> Value {
        let CoseKey::EC2 { crv, x, y } = key;
        Value::Map(vec![
            // kty: EC2
            (Value::Integer(1.into()), Value::Integer(2.into())),
            (Value::Integer((-1).into()), crv.into()),
            (Value::Integer((-2).into()), Value::Bytes(x)),
            (Value::Integer((-3).into()), y.into()),
        ])
    }
}

impl TryFrom<Value> for CoseKey {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self, Error> {
        let Value::Map(map) = v else {
            return Err(Error::NotAKey("expected a map"));
        };
        let mut kty = None;
        let mut crv = None;
        let mut x = None;
        let mut y = None;
        for (k, v) in map {
            let Value::Integer(label) = k else { continue };
            match i128::from(label) {
                1 => kty = Some(v),
                -1 => crv = Some(v),
                -2 => x = Some(v),
                -3 => y = Some(v),
                _ => {}
            }
        }
        match kty {
            Some(Value::Integer(i)) if i128::from(i) == 2 => {}
            Some(_) => return Err(Error::NotAKey("unsupported kty")),
            None => return Err(Error::NotAKey("missing kty")),
        }
        let crv = crv
            .ok_or(Error::EC2MissingParameter("crv"))?
            .try_into()?;
        let x = match x.ok_or(Error::EC2MissingParameter("x"))? {
            Value::Bytes(b) => b,
            _ => return Err(Error::NotAKey("x must be a byte string")),
        };
        let y = y.ok_or(Error::EC2MissingParameter("y"))?.try_into()?;
        Ok(CoseKey::EC2 { crv, x, y })
    }
}

impl From<EC2Curve> for Value {
    fn from(crv: EC2Curve) -> Value {
        match crv {
            EC2Curve::P256 => Value::Integer(1.into()),
            EC2Curve::P384 => Value::Integer(2.into()),
        }
    }
}

impl TryFrom<Value> for EC2Curve {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self, Error> {
        match v {
            Value::Integer(i) if i128::from(i) == 1 => Ok(EC2Curve::P256),
            Value::Integer(i) if i128::from(i) == 2 => Ok(EC2Curve::P384),
            _ => Err(Error::UnknownCurve),
        }
    }
}

impl From<EC2Y> for Value {
    fn from(y: EC2Y) -> Value {
        match y {
            EC2Y::Value(bytes) => Value::Bytes(bytes),
            EC2Y::SignBit(b) => Value::Bool(b),
        }
    }
}

impl TryFrom<Value> for EC2Y {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self, Error> {
        match v {
            Value::Bytes(b) => Ok(EC2Y::Value(b)),
            Value::Bool(b) => Ok(EC2Y::SignBit(b)),
            _ => Err(Error::NotAKey("y must be a byte string or bool")),
        }
    }
}

impl From<p256::PublicKey> for CoseKey {
    fn from(pk: p256::PublicKey) -> CoseKey {
        let point = P256EncodedPoint::from(pk);
        CoseKey::EC2 {
            crv: EC2Curve::P256,
            x: point.x().map(|x| x.to_vec()).unwrap_or_default(),
            y: EC2Y::Value(point.y().map(|y| y.to_vec()).unwrap_or_default()),
        }
    }
}

impl From<p384::PublicKey> for CoseKey {
    fn from(pk: p384::PublicKey) -> CoseKey {
        let point = P384EncodedPoint::from(pk);
        CoseKey::EC2 {
            crv: EC2Curve::P384,
            x: point.x().map(|x| x.to_vec()).unwrap_or_default(),
            y: EC2Y::Value(point.y().map(|y| y.to_vec()).unwrap_or_default()),
        }
    }
}

impl TryFrom<CoseKey> for p256::PublicKey {
    type Error = Error;

    fn try_from(key: CoseKey) -> Result<p256::PublicKey, Error> {
        let CoseKey::EC2 { crv, x, y } = key;
        if crv != EC2Curve::P256 {
            return Err(Error::UnknownCurve);
        }
        let y = match y {
            EC2Y::Value(y) => y,
            EC2Y::SignBit(_) => return Err(Error::UnsupportedFormat),
        };
        let point = P256EncodedPoint::from_affine_coordinates(
            x.as_slice().into(),
            y.as_slice().into(),
            false,
        );
        p256::PublicKey::from_sec1_bytes(point.as_bytes()).map_err(|_| Error::InvalidCoordinates)
    }
}

impl TryFrom<CoseKey> for p256::ecdsa::VerifyingKey {
    type Error = Error;

    fn try_from(key: CoseKey) -> Result<p256::ecdsa::VerifyingKey, Error> {
        p256::PublicKey::try_from(key).map(p256::ecdsa::VerifyingKey::from)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::cbor;

    #[test]
    fn p256_roundtrip() {
        let secret = p256::SecretKey::random(&mut rand::thread_rng());
        let key: CoseKey = secret.public_key().into();
        let bytes = cbor::to_vec(&key).unwrap();
        let back: CoseKey = cbor::from_slice(&bytes).unwrap();
        assert_eq!(key, back);
        let pk: p256::PublicKey = back.try_into().unwrap();
        assert_eq!(pk, secret.public_key());
    }

    #[test]
    fn sign_bit_points_rejected_for_agreement() {
        let key = CoseKey::EC2 {
            crv: EC2Curve::P256,
            x: vec![0u8; 32],
            y: EC2Y::SignBit(true),
        };
        assert!(matches!(
            p256::PublicKey::try_from(key),
            Err(Error::UnsupportedFormat)
        ));
    }
}
