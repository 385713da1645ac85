//! Abstraction over wherever device keys actually live: a hardware-backed
//! keystore in production, an in-memory software store in tests and the
//! harness. Key handles are aliases; private material never crosses the
//! trait boundary.
use std::collections::BTreeMap;
use std::sync::Mutex;

use p256::ecdsa::signature::Signer;

use crate::definitions::device_key::CoseKey;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no key exists under alias '{0}'")]
    UnknownAlias(String),
    #[error("the peer key is not usable for agreement")]
    PeerKey,
    #[error("the backing store cannot create a key with these settings")]
    UnsupportedSettings,
    #[error("the backing store is unavailable")]
    StoreUnavailable,
}

/// Curve requested for a new key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum KeyCurve {
    #[default]
    P256,
    P384,
}

/// Parameters for key creation. Backends reject settings they cannot honour.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KeySettings {
    pub curve: KeyCurve,
}

#[derive(Clone, Debug)]
pub struct KeyInfo {
    pub alias: String,
    pub public_key: CoseKey,
}

/// Operations the presentment layer needs from a key store. All methods take
/// `&self`: implementations are expected to be shared across tasks.
pub trait SecureArea: Send + Sync {
    /// Create a key under the alias, or return the existing key if one is
    /// already there. Creation is atomic: concurrent first use yields one key.
    fn create_key(&self, alias: &str, settings: KeySettings) -> Result<KeyInfo, Error>;

    fn get_key(&self, alias: &str) -> Result<KeyInfo, Error>;

    /// ECDSA-sign a message with the aliased key, returning the raw
    /// fixed-width signature.
    fn sign(&self, alias: &str, message: &[u8]) -> Result<Vec<u8>, Error>;

    /// ECDH between the aliased key and a peer public key, returning the raw
    /// shared secret.
    fn key_agreement(&self, alias: &str, peer: &CoseKey) -> Result<Vec<u8>, Error>;
}

/// Software keys held in process memory. Suitable for tests and the
/// conformance harness only.
#[derive(Default)]
pub struct SoftwareSecureArea {
    keys: Mutex<BTreeMap<String, p256::SecretKey>>,
}

impl SoftwareSecureArea {
    pub fn new() -> Self {
        Self::default()
    }

    /// Import an existing secret under an alias, for fixtures whose public
    /// half is already baked into issued documents.
    pub fn import_key(&self, alias: &str, secret: p256::SecretKey) -> Result<KeyInfo, Error> {
        let mut keys = self.keys.lock().map_err(|_| Error::StoreUnavailable)?;
        let public_key = secret.public_key().into();
        keys.insert(alias.to_string(), secret);
        Ok(KeyInfo {
            alias: alias.to_string(),
            public_key,
        })
    }
}

impl SecureArea for SoftwareSecureArea {
    fn create_key(&self, alias: &str, settings: KeySettings) -> Result<KeyInfo, Error> {
        if settings.curve != KeyCurve::P256 {
            return Err(Error::UnsupportedSettings);
        }
        let mut keys = self.keys.lock().map_err(|_| Error::StoreUnavailable)?;
        let secret = keys
            .entry(alias.to_string())
            .or_insert_with(|| p256::SecretKey::random(&mut rand::rngs::OsRng));
        Ok(KeyInfo {
            alias: alias.to_string(),
            public_key: secret.public_key().into(),
        })
    }

    fn get_key(&self, alias: &str) -> Result<KeyInfo, Error> {
        let keys = self.keys.lock().map_err(|_| Error::StoreUnavailable)?;
        let secret = keys
            .get(alias)
            .ok_or_else(|| Error::UnknownAlias(alias.to_string()))?;
        Ok(KeyInfo {
            alias: alias.to_string(),
            public_key: secret.public_key().into(),
        })
    }

    fn sign(&self, alias: &str, message: &[u8]) -> Result<Vec<u8>, Error> {
        let keys = self.keys.lock().map_err(|_| Error::StoreUnavailable)?;
        let secret = keys
            .get(alias)
            .ok_or_else(|| Error::UnknownAlias(alias.to_string()))?;
        let signing_key = p256::ecdsa::SigningKey::from(secret);
        let signature: p256::ecdsa::Signature = signing_key.sign(message);
        Ok(signature.to_vec())
    }

    fn key_agreement(&self, alias: &str, peer: &CoseKey) -> Result<Vec<u8>, Error> {
        let keys = self.keys.lock().map_err(|_| Error::StoreUnavailable)?;
        let secret = keys
            .get(alias)
            .ok_or_else(|| Error::UnknownAlias(alias.to_string()))?;
        let peer: p256::PublicKey = peer.clone().try_into().map_err(|_| Error::PeerKey)?;
        let shared =
            p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), peer.as_affine());
        Ok(shared.raw_secret_bytes().to_vec())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn create_is_idempotent() {
        let area = SoftwareSecureArea::new();
        let first = area.create_key("auth", KeySettings::default()).unwrap();
        let second = area.create_key("auth", KeySettings::default()).unwrap();
        assert_eq!(first.public_key, second.public_key);
    }

    #[test]
    fn unsupported_settings_are_rejected() {
        let area = SoftwareSecureArea::new();
        let settings = KeySettings {
            curve: KeyCurve::P384,
        };
        assert!(matches!(
            area.create_key("auth", settings),
            Err(Error::UnsupportedSettings)
        ));
        let created = area.create_key("auth", KeySettings::default()).unwrap();
        assert_eq!(
            created.public_key.curve(),
            crate::definitions::device_key::cose_key::EC2Curve::P256
        );
    }

    #[test]
    fn concurrent_first_use_creates_one_key() {
        let area = Arc::new(SoftwareSecureArea::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let area = area.clone();
                std::thread::spawn(move || area.create_key("auth", KeySettings::default()).unwrap().public_key)
            })
            .collect();
        let keys: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(keys.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn agreement_is_symmetric() {
        let area = SoftwareSecureArea::new();
        let device = area.create_key("device", KeySettings::default()).unwrap();
        let reader_secret = p256::SecretKey::random(&mut rand::rngs::OsRng);
        let from_device = area
            .key_agreement("device", &reader_secret.public_key().into())
            .unwrap();
        let device_public: p256::PublicKey = device.public_key.try_into().unwrap();
        let from_reader = p256::ecdh::diffie_hellman(
            reader_secret.to_nonzero_scalar(),
            device_public.as_affine(),
        );
        assert_eq!(from_device, from_reader.raw_secret_bytes().to_vec());
    }
}
