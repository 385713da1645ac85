//! Session establishment and encryption for the proximity channel.
//!
//! Both parties derive session keys from an ECDH agreement between their
//! ephemeral P-256 keys, salted with a digest of the session transcript. All
//! application messages then travel in AES-256-GCM envelopes with
//! role-separated IVs and monotonic message counters.
use aes_gcm::{
    aead::{generic_array::GenericArray, Aead},
    Aes256Gcm, KeyInit, Nonce,
};
use ciborium::Value;
use elliptic_curve::ecdh::SharedSecret;
use p256::NistP256;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::cbor;
use crate::definitions::device_engagement::{DeviceEngagement, EDeviceKeyBytes, EReaderKeyBytes};
use crate::definitions::device_key::cose_key;
use crate::definitions::device_key::CoseKey;
use crate::definitions::helpers::{ByteStr, Tag24};

pub type EReaderKey = CoseKey;
pub type EDeviceKey = CoseKey;
pub type DeviceEngagementBytes = Tag24<DeviceEngagement>;
pub type SessionTranscriptBytes = Tag24<SessionTranscript180135>;
pub type NfcHandover = (ByteStr, Option<ByteStr>);

/// Which side of the session a party plays. Key derivation, IV identifiers
/// and counters are all separated by role.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Device,
    Reader,
}

impl Role {
    fn opposite(self) -> Role {
        match self {
            Role::Device => Role::Reader,
            Role::Reader => Role::Device,
        }
    }
}

/// The first message of a session, sent by the reader: its ephemeral key in
/// the clear alongside the first encrypted request.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEstablishment {
    pub e_reader_key: EReaderKeyBytes,
    pub data: ByteStr,
}

/// Every subsequent message: optional encrypted data, optional status. The
/// envelope with neither is the transport-agnostic closing message.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct SessionData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ByteStr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
}

impl SessionData {
    /// Status-only envelope announcing orderly session termination.
    pub fn termination() -> Self {
        SessionData {
            data: None,
            status: Some(Status::SessionTermination),
        }
    }

    /// Data-less, status-less closing envelope.
    pub fn close() -> Self {
        SessionData::default()
    }

    /// True for any envelope that ends the session rather than carrying a
    /// request or response.
    pub fn is_terminal(&self) -> bool {
        self.data.is_none()
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(try_from = "Value", into = "Value")]
pub enum Status {
    SessionEncryptionError,
    CborDecodingError,
    SessionTermination,
}

impl From<Status> for Value {
    fn from(s: Status) -> Value {
        let i: u64 = match s {
            Status::SessionEncryptionError => 10,
            Status::CborDecodingError => 11,
            Status::SessionTermination => 20,
        };
        Value::Integer(i.into())
    }
}

impl TryFrom<Value> for Status {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self, Error> {
        match v {
            Value::Integer(i) => match i128::from(i) {
                10 => Ok(Status::SessionEncryptionError),
                11 => Ok(Status::CborDecodingError),
                20 => Ok(Status::SessionTermination),
                i => Err(Error::UnrecognisedStatus(i)),
            },
            _ => Err(Error::UnrecognisedStatus(-1)),
        }
    }
}

/// The transcript binding both engagement structures and the handover that
/// carried them. Serializes as a three element array.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct SessionTranscript180135(
    pub DeviceEngagementBytes,
    pub EReaderKeyBytes,
    pub Handover,
);

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum Handover {
    QR,
    NFC(ByteStr, Option<ByteStr>),
}

impl From<Handover> for Value {
    fn from(h: Handover) -> Value {
        match h {
            Handover::QR => Value::Null,
            Handover::NFC(select, request) => Value::Array(vec![
                Value::Bytes(select.into()),
                match request {
                    Some(r) => Value::Bytes(r.into()),
                    None => Value::Null,
                },
            ]),
        }
    }
}

impl TryFrom<Value> for Handover {
    type Error = Error;

    fn try_from(v: Value) -> Result<Self, Error> {
        match v {
            Value::Null => Ok(Handover::QR),
            Value::Array(arr) => {
                let [select, request]: [Value; 2] = arr
                    .try_into()
                    .map_err(|_| Error::MalformedHandover)?;
                let select = match select {
                    Value::Bytes(b) => ByteStr::from(b),
                    _ => return Err(Error::MalformedHandover),
                };
                let request = match request {
                    Value::Bytes(b) => Some(ByteStr::from(b)),
                    Value::Null => None,
                    _ => return Err(Error::MalformedHandover),
                };
                Ok(Handover::NFC(select, request))
            }
            _ => Err(Error::MalformedHandover),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Key agreement failures collapse curve mismatch, unsupported curve and
    /// point errors.
    #[error("the ephemeral keys do not agree on a usable curve")]
    KeyAgreement,
    #[error("unable to derive a session key")]
    SessionKeyDerivation,
    /// Any failure to authenticate and decrypt an envelope. Deliberately
    /// carries no detail.
    #[error("unable to decrypt the session message")]
    Decryption,
    #[error("unable to encrypt the session message")]
    Encryption,
    #[error("message counter exhausted")]
    CounterExhausted,
    #[error("unrecognised session status: {0}")]
    UnrecognisedStatus(i128),
    #[error("malformed handover structure")]
    MalformedHandover,
    #[error("malformed session envelope: {0}")]
    Envelope(String),
}

impl From<cbor::CborError> for Error {
    fn from(e: cbor::CborError) -> Self {
        Error::Envelope(e.to_string())
    }
}

impl From<cose_key::Error> for Error {
    fn from(_: cose_key::Error) -> Self {
        Error::KeyAgreement
    }
}

/// Generate an ephemeral P-256 key pair for session establishment.
pub fn create_p256_ephemeral_keys() -> Result<(p256::SecretKey, CoseKey), Error> {
    let secret = p256::SecretKey::random(&mut OsRng);
    let public = secret.public_key().into();
    Ok((secret, public))
}

/// ECDH between our ephemeral secret and the other party's ephemeral key.
pub fn get_shared_secret(
    their_key: CoseKey,
    our_secret: &p256::SecretKey,
) -> Result<SharedSecret<NistP256>, Error> {
    let public_key = p256::PublicKey::try_from(their_key)?;
    Ok(p256::ecdh::diffie_hellman(
        our_secret.to_nonzero_scalar(),
        public_key.as_affine(),
    ))
}

/// Derive a directional session key. The salt is a digest of the transcript
/// bytes; the info string selects the direction.
pub fn derive_session_key(
    shared_secret: &SharedSecret<NistP256>,
    session_transcript: &SessionTranscriptBytes,
    sender: Role,
) -> Result<[u8; 32], Error> {
    let salt = Sha256::digest(cbor::to_vec(session_transcript)?);
    let hkdf = shared_secret.extract::<Sha256>(Some(salt.as_ref()));
    let mut okm = [0u8; 32];
    let info = match sender {
        Role::Device => "SKDevice",
        Role::Reader => "SKReader",
    };
    hkdf.expand(info.as_bytes(), &mut okm)
        .map_err(|_| Error::SessionKeyDerivation)?;
    Ok(okm)
}

/// IV for a message: an 8-byte role identifier followed by the 4-byte
/// big-endian message counter. Counters start at 1.
fn initialization_vector(sender: Role, counter: u32) -> [u8; 12] {
    let identifier: [u8; 8] = match sender {
        Role::Reader => [0, 0, 0, 0, 0, 0, 0, 0],
        Role::Device => [0, 0, 0, 0, 0, 0, 0, 1],
    };
    let mut iv = [0u8; 12];
    iv[..8].copy_from_slice(&identifier);
    iv[8..].copy_from_slice(&counter.to_be_bytes());
    iv
}

fn encrypt(
    session_key: &[u8; 32],
    plaintext: &[u8],
    message_count: &mut u32,
    sender: Role,
) -> Result<Vec<u8>, Error> {
    let counter = message_count
        .checked_add(1)
        .ok_or(Error::CounterExhausted)?;
    let iv = initialization_vector(sender, counter);
    let ciphertext = Aes256Gcm::new(GenericArray::from_slice(session_key))
        .encrypt(Nonce::from_slice(&iv), plaintext)
        .map_err(|_| Error::Encryption)?;
    *message_count = counter;
    Ok(ciphertext)
}

fn decrypt(
    session_key: &[u8; 32],
    ciphertext: &[u8],
    message_count: &mut u32,
    sender: Role,
) -> Result<Vec<u8>, Error> {
    let counter = message_count
        .checked_add(1)
        .ok_or(Error::CounterExhausted)?;
    let iv = initialization_vector(sender, counter);
    let plaintext = Aes256Gcm::new(GenericArray::from_slice(session_key))
        .decrypt(Nonce::from_slice(&iv), ciphertext)
        .map_err(|_| Error::Decryption)?;
    // The counter only advances on successful decryption, so a garbled
    // message does not desynchronise the session.
    *message_count = counter;
    Ok(plaintext)
}

pub fn encrypt_reader_data(
    sk_reader: &[u8; 32],
    plaintext: &[u8],
    message_count: &mut u32,
) -> Result<Vec<u8>, Error> {
    encrypt(sk_reader, plaintext, message_count, Role::Reader)
}

pub fn decrypt_reader_data(
    sk_reader: &[u8; 32],
    ciphertext: &[u8],
    message_count: &mut u32,
) -> Result<Vec<u8>, Error> {
    decrypt(sk_reader, ciphertext, message_count, Role::Reader)
}

pub fn encrypt_device_data(
    sk_device: &[u8; 32],
    plaintext: &[u8],
    message_count: &mut u32,
) -> Result<Vec<u8>, Error> {
    encrypt(sk_device, plaintext, message_count, Role::Device)
}

pub fn decrypt_device_data(
    sk_device: &[u8; 32],
    ciphertext: &[u8],
    message_count: &mut u32,
) -> Result<Vec<u8>, Error> {
    decrypt(sk_device, ciphertext, message_count, Role::Device)
}

/// Both directional keys and counters for one established session.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SessionCipher {
    #[zeroize(skip)]
    role: Role,
    sk_device: [u8; 32],
    sk_reader: [u8; 32],
    #[zeroize(skip)]
    device_message_count: u32,
    #[zeroize(skip)]
    reader_message_count: u32,
}

impl SessionCipher {
    pub fn establish(
        role: Role,
        our_secret: &p256::SecretKey,
        their_key: CoseKey,
        session_transcript: &SessionTranscriptBytes,
    ) -> Result<Self, Error> {
        let shared_secret = get_shared_secret(their_key, our_secret)?;
        let sk_device = derive_session_key(&shared_secret, session_transcript, Role::Device)?;
        let sk_reader = derive_session_key(&shared_secret, session_transcript, Role::Reader)?;
        Ok(SessionCipher {
            role,
            sk_device,
            sk_reader,
            device_message_count: 0,
            reader_message_count: 0,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Encrypt a payload into a [SessionData] envelope ready for the wire.
    pub fn encrypt_message(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        let ciphertext = match self.role {
            Role::Device => encrypt_device_data(
                &self.sk_device,
                plaintext,
                &mut self.device_message_count,
            )?,
            Role::Reader => encrypt_reader_data(
                &self.sk_reader,
                plaintext,
                &mut self.reader_message_count,
            )?,
        };
        Ok(cbor::to_vec(&SessionData {
            data: Some(ciphertext.into()),
            status: None,
        })?)
    }

    /// Encrypt a payload without the envelope, for session establishment.
    pub fn encrypt_data(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        match self.role {
            Role::Device => {
                encrypt_device_data(&self.sk_device, plaintext, &mut self.device_message_count)
            }
            Role::Reader => {
                encrypt_reader_data(&self.sk_reader, plaintext, &mut self.reader_message_count)
            }
        }
    }

    /// Decrypt a [SessionData] envelope. Returns the plaintext, if any, and
    /// the peer's status, if any. Decryption failures all collapse into
    /// [Error::Decryption].
    pub fn decrypt_message(
        &mut self,
        envelope: &[u8],
    ) -> Result<(Option<Vec<u8>>, Option<Status>), Error> {
        let session_data: SessionData = cbor::from_slice(envelope)?;
        let plaintext = match session_data.data {
            None => None,
            Some(ciphertext) => Some(self.decrypt_data(ciphertext.as_ref())?),
        };
        Ok((plaintext, session_data.status))
    }

    /// Decrypt raw ciphertext from the peer, advancing their counter only on
    /// success.
    pub fn decrypt_data(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
        match self.role.opposite() {
            Role::Device => {
                decrypt_device_data(&self.sk_device, ciphertext, &mut self.device_message_count)
            }
            Role::Reader => {
                decrypt_reader_data(&self.sk_reader, ciphertext, &mut self.reader_message_count)
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::definitions::device_engagement::{
        BleOptions, CentralClientMode, DeviceEngagement, DeviceRetrievalMethod,
    };
    use crate::definitions::helpers::NonEmptyVec;

    fn transcript(
        e_device_key: CoseKey,
        e_reader_key: CoseKey,
    ) -> SessionTranscriptBytes {
        let key_bytes = Tag24::new(e_device_key).unwrap();
        let engagement = DeviceEngagement::new(
            key_bytes,
            NonEmptyVec::new(DeviceRetrievalMethod::BLE(BleOptions {
                peripheral_server_mode: None,
                central_client_mode: Some(CentralClientMode {
                    uuid: uuid::Uuid::new_v4(),
                }),
            })),
        );
        Tag24::new(SessionTranscript180135(
            Tag24::new(engagement).unwrap(),
            Tag24::new(e_reader_key).unwrap(),
            Handover::QR,
        ))
        .unwrap()
    }

    fn cipher_pair() -> (SessionCipher, SessionCipher) {
        let (device_secret, device_public) = create_p256_ephemeral_keys().unwrap();
        let (reader_secret, reader_public) = create_p256_ephemeral_keys().unwrap();
        let transcript = transcript(device_public.clone(), reader_public.clone());
        let device = SessionCipher::establish(
            Role::Device,
            &device_secret,
            reader_public,
            &transcript,
        )
        .unwrap();
        let reader = SessionCipher::establish(
            Role::Reader,
            &reader_secret,
            device_public,
            &transcript,
        )
        .unwrap();
        (device, reader)
    }

    #[test]
    fn transcripts_computed_independently_are_byte_identical() {
        let (_, device_public) = create_p256_ephemeral_keys().unwrap();
        let (_, reader_public) = create_p256_ephemeral_keys().unwrap();
        let transcript = transcript(device_public, reader_public.clone());

        // Re-decode the engagement from its wire bytes, as the reader would
        // after scanning, and rebuild the transcript from the decoded copy.
        let engagement_bytes = cbor::to_vec(&transcript.inner.0).unwrap();
        let rebuilt = Tag24::new(SessionTranscript180135(
            cbor::from_slice(&engagement_bytes).unwrap(),
            Tag24::new(reader_public).unwrap(),
            Handover::QR,
        ))
        .unwrap();
        assert_eq!(transcript.inner_bytes, rebuilt.inner_bytes);
    }

    #[test]
    fn roundtrip_both_directions() {
        let (mut device, mut reader) = cipher_pair();
        let envelope = reader.encrypt_message(b"request").unwrap();
        let (plaintext, status) = device.decrypt_message(&envelope).unwrap();
        assert_eq!(plaintext.as_deref(), Some(&b"request"[..]));
        assert_eq!(status, None);

        let envelope = device.encrypt_message(b"response").unwrap();
        let (plaintext, status) = reader.decrypt_message(&envelope).unwrap();
        assert_eq!(plaintext.as_deref(), Some(&b"response"[..]));
        assert_eq!(status, None);
    }

    #[test]
    fn directional_ivs_never_collide() {
        // The same key material in each direction still yields distinct IVs.
        assert_ne!(
            initialization_vector(Role::Device, 1),
            initialization_vector(Role::Reader, 1)
        );
        let ivs: Vec<[u8; 12]> = (1..=100)
            .map(|c| initialization_vector(Role::Reader, c))
            .collect();
        let mut deduped = ivs.clone();
        deduped.dedup();
        assert_eq!(ivs, deduped);
    }

    #[test]
    fn tampered_ciphertext_rejected_without_counter_advance() {
        let (mut device, mut reader) = cipher_pair();
        let envelope = reader.encrypt_message(b"one").unwrap();
        let mut session_data: SessionData = cbor::from_slice(&envelope).unwrap();
        let mut tampered: Vec<u8> = session_data.data.take().unwrap().into();
        tampered[0] ^= 0xFF;
        session_data.data = Some(tampered.into());
        let tampered_envelope = cbor::to_vec(&session_data).unwrap();

        assert!(matches!(
            device.decrypt_message(&tampered_envelope),
            Err(Error::Decryption)
        ));
        // The untampered envelope still decrypts: the receive counter did
        // not advance on failure.
        let (plaintext, _) = device.decrypt_message(&envelope).unwrap();
        assert_eq!(plaintext.as_deref(), Some(&b"one"[..]));
    }

    #[test]
    fn replayed_message_rejected() {
        let (mut device, mut reader) = cipher_pair();
        let first = reader.encrypt_message(b"one").unwrap();
        device.decrypt_message(&first).unwrap();
        // Counter has moved on; the same envelope no longer authenticates.
        assert!(matches!(
            device.decrypt_message(&first),
            Err(Error::Decryption)
        ));
    }

    #[test]
    fn status_only_envelope_needs_no_key() {
        let bytes = cbor::to_vec(&SessionData::termination()).unwrap();
        let (mut device, _) = cipher_pair();
        let (plaintext, status) = device.decrypt_message(&bytes).unwrap();
        assert_eq!(plaintext, None);
        assert_eq!(status, Some(Status::SessionTermination));
    }

    #[test]
    fn reserved_status_values() {
        for (status, wire) in [
            (Status::SessionEncryptionError, 10u64),
            (Status::CborDecodingError, 11),
            (Status::SessionTermination, 20),
        ] {
            let bytes = cbor::to_vec(&status).unwrap();
            let expected = cbor::to_vec(&wire).unwrap();
            assert_eq!(bytes, expected);
        }
        assert!(cbor::from_slice::<Status>(&cbor::to_vec(&12u64).unwrap()).is_err());
    }
}
