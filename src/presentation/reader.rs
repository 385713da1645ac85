//! The reader side of presentment: establish a session from a scanned
//! engagement, issue requests, and validate responses.
use std::collections::BTreeMap;

use coset::Header;
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::cbor;
use crate::cose::{self, CoseSign1};
use crate::definitions::device_engagement::DeviceEngagement;
use crate::definitions::device_request::{
    DeviceRequest, DocRequest, ItemsRequest, ReaderAuthentication,
};
use crate::definitions::device_response::{DeviceResponse, Document, Status as ResponseStatus};
use crate::definitions::device_signed::{DeviceAuth, DeviceAuthentication};
use crate::definitions::helpers::{NonEmptyVec, Tag24};
use crate::definitions::issuer_signed::IssuerSignedItemBytes;
use crate::definitions::mso::Mso;
use crate::definitions::retrieval_methods;
use crate::definitions::session::{
    self, Handover, Role, SessionCipher, SessionEstablishment, SessionTranscript180135,
    SessionTranscriptBytes, Status as SessionStatus,
};
use crate::definitions::x5chain::{X5Chain, X5CHAIN_HEADER_LABEL};
use crate::definitions::zk::ZkDocument;
use crate::secure_area::SecureArea;

use super::zkp::{self, ZkVerifierRegistry};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Session(#[from] session::Error),
    #[error(transparent)]
    Engagement(#[from] crate::definitions::device_engagement::Error),
    #[error(transparent)]
    RetrievalMethods(#[from] retrieval_methods::Error),
    #[error(transparent)]
    Cbor(#[from] cbor::CborError),
    #[error(transparent)]
    Tag24(#[from] crate::definitions::helpers::tag24::Error),
    #[error(transparent)]
    SecureArea(#[from] crate::secure_area::Error),
    #[error("the holder terminated the session")]
    SessionTerminated,
    #[error("the holder reported status {0:?} without data")]
    HolderError(SessionStatus),
    #[error("the response carried no data and no status")]
    EmptyResponse,
    #[error("a request must name at least one document")]
    EmptyRequest,
}

/// Verification verdict for one aspect of a document. `Unchecked` marks
/// aspects that could not be evaluated, such as issuer authentication with
/// an unparseable certificate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Valid,
    Invalid,
    Unchecked,
}

/// Per-document verification flags and disclosed elements. Flags are
/// reported, not enforced: policy belongs to the caller.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidatedDocument {
    pub doc_type: String,
    pub issuer_signed_authenticated: Outcome,
    pub device_signed_authenticated: Outcome,
    /// Count of issuer-signed items whose digest did not match the MSO, or
    /// whose digest was absent from it.
    pub digest_mismatches: usize,
    pub validity: Outcome,
    pub elements: BTreeMap<String, BTreeMap<String, ciborium::Value>>,
}

#[derive(Clone, Debug)]
pub struct ZkOutcome {
    pub doc_type: String,
    pub result: Result<zkp::ZkVerification, zkp::Error>,
}

#[derive(Clone, Debug, Default)]
pub struct ValidatedResponse {
    pub status: Option<ResponseStatus>,
    pub documents: Vec<ValidatedDocument>,
    pub zk_documents: Vec<ZkOutcome>,
    /// Doc types the holder declined or could not return.
    pub document_errors: Vec<String>,
}

/// Reader signing identity: the aliased key lives in a secure area, the
/// certificate chain travels in the request headers.
pub struct ReaderAuthority<'a> {
    pub secure_area: &'a dyn SecureArea,
    pub key_alias: &'a str,
    pub x5chain: X5Chain,
}

/// An established reader session.
pub struct SessionManager {
    session_transcript: SessionTranscriptBytes,
    cipher: SessionCipher,
    /// Retained to derive the MAC key when the holder authenticates with a
    /// COSE_Mac0.
    e_reader_key_secret: p256::SecretKey,
}

impl SessionManager {
    /// Establish a session from a scanned QR engagement. Returns the
    /// manager, the session establishment bytes to send, and the BLE ident
    /// for transport verification.
    pub fn establish_session(
        qr_code_uri: &str,
        requests: Vec<ItemsRequest>,
        reader_authority: Option<ReaderAuthority<'_>>,
    ) -> Result<(Self, Vec<u8>, [u8; 16]), Error> {
        let device_engagement = Tag24::<DeviceEngagement>::from_qr_code_uri(qr_code_uri)?;
        Self::establish_session_with_handover(
            device_engagement,
            Handover::QR,
            requests,
            reader_authority,
        )
    }

    /// Establish a session from an engagement conveyed by NFC handover.
    pub fn establish_session_with_handover(
        device_engagement: Tag24<DeviceEngagement>,
        handover: Handover,
        requests: Vec<ItemsRequest>,
        reader_authority: Option<ReaderAuthority<'_>>,
    ) -> Result<(Self, Vec<u8>, [u8; 16]), Error> {
        // Both parties disambiguate; a holder advertising no usable method
        // fails here before any connection is attempted.
        retrieval_methods::disambiguate(
            &device_engagement.inner.device_retrieval_methods,
            Role::Reader,
        )?;
        let e_device_key = device_engagement.inner.security.1.clone();
        let ble_ident = super::calculate_ble_ident(&e_device_key)
            .map_err(|_| session::Error::SessionKeyDerivation)?;

        let (e_reader_key_secret, e_reader_pub) = session::create_p256_ephemeral_keys()?;
        let e_reader_key_bytes = Tag24::new(e_reader_pub)?;
        let session_transcript = Tag24::new(SessionTranscript180135(
            device_engagement,
            e_reader_key_bytes.clone(),
            handover,
        ))?;

        let cipher = SessionCipher::establish(
            Role::Reader,
            &e_reader_key_secret,
            e_device_key.into_inner(),
            &session_transcript,
        )?;
        let mut manager = SessionManager {
            session_transcript,
            cipher,
            e_reader_key_secret,
        };

        let request = manager.build_request(requests, reader_authority)?;
        let data = manager.cipher.encrypt_data(&request)?;
        let establishment = SessionEstablishment {
            e_reader_key: e_reader_key_bytes,
            data: data.into(),
        };
        let establishment_bytes = cbor::to_vec(&establishment)?;
        Ok((manager, establishment_bytes, ble_ident))
    }

    pub fn session_transcript(&self) -> &SessionTranscriptBytes {
        &self.session_transcript
    }

    /// Build and encrypt a follow-up request over the established session.
    pub fn new_request(
        &mut self,
        requests: Vec<ItemsRequest>,
        reader_authority: Option<ReaderAuthority<'_>>,
    ) -> Result<Vec<u8>, Error> {
        let request = self.build_request(requests, reader_authority)?;
        Ok(self.cipher.encrypt_message(&request)?)
    }

    fn build_request(
        &self,
        requests: Vec<ItemsRequest>,
        reader_authority: Option<ReaderAuthority<'_>>,
    ) -> Result<Vec<u8>, Error> {
        let doc_requests = requests
            .into_iter()
            .map(|items_request| {
                let items_request = Tag24::new(items_request)?;
                let reader_auth = match &reader_authority {
                    None => None,
                    Some(authority) => Some(self.sign_request(&items_request, authority)?),
                };
                Ok(DocRequest {
                    items_request,
                    reader_auth,
                })
            })
            .collect::<Result<Vec<_>, Error>>()?;
        let request = DeviceRequest {
            version: DeviceRequest::VERSION.to_string(),
            doc_requests: NonEmptyVec::maybe_new(doc_requests).ok_or(Error::EmptyRequest)?,
        };
        Ok(cbor::to_vec(&request)?)
    }

    fn sign_request(
        &self,
        items_request: &Tag24<ItemsRequest>,
        authority: &ReaderAuthority<'_>,
    ) -> Result<CoseSign1, Error> {
        let detached = cbor::to_vec(&Tag24::new(ReaderAuthentication::new(
            self.session_transcript.inner.clone(),
            items_request.clone(),
        ))?)?;
        let unprotected = Header {
            rest: vec![(
                coset::Label::Int(X5CHAIN_HEADER_LABEL),
                authority.x5chain.clone().into_header_value(),
            )],
            ..Default::default()
        };
        let prepared = cose::sign1::PreparedCoseSign1::new(
            coset::iana::Algorithm::ES256,
            &detached,
            false,
            unprotected,
        );
        let signature = authority
            .secure_area
            .sign(authority.key_alias, prepared.signature_payload())?;
        Ok(prepared.into_cose_sign1(signature))
    }

    /// Decrypt a response envelope and verify every document in it. Session
    /// terminations and holder error statuses surface as errors.
    pub fn handle_response(
        &mut self,
        envelope: &[u8],
        zk_registry: Option<&ZkVerifierRegistry>,
    ) -> Result<ValidatedResponse, Error> {
        let (plaintext, status) = self.cipher.decrypt_message(envelope)?;
        let plaintext = match (plaintext, status) {
            (Some(plaintext), _) => plaintext,
            (None, Some(SessionStatus::SessionTermination)) => {
                return Err(Error::SessionTerminated)
            }
            (None, Some(status)) => return Err(Error::HolderError(status)),
            (None, None) => return Err(Error::EmptyResponse),
        };
        let response: DeviceResponse = cbor::from_slice(&plaintext)?;
        let mut validated = ValidatedResponse {
            status: Some(response.status),
            ..Default::default()
        };
        if let Some(documents) = response.documents {
            for document in documents {
                validated.documents.push(self.validate_document(&document));
            }
        }
        if let Some(zk_documents) = response.zk_documents {
            for zk_document in zk_documents {
                validated.zk_documents.push(self.validate_zk_document(
                    &zk_document,
                    zk_registry,
                ));
            }
        }
        if let Some(errors) = response.document_errors {
            for error in errors {
                validated.document_errors.extend(error.into_keys());
            }
        }
        Ok(validated)
    }

    fn validate_document(&self, document: &Document) -> ValidatedDocument {
        let mut validated = ValidatedDocument {
            doc_type: document.doc_type.clone(),
            issuer_signed_authenticated: Outcome::Unchecked,
            device_signed_authenticated: Outcome::Unchecked,
            digest_mismatches: 0,
            validity: Outcome::Unchecked,
            elements: BTreeMap::new(),
        };

        // The MSO travels as the issuer_auth payload.
        let mso: Option<Mso> = document
            .issuer_signed
            .issuer_auth
            .payload()
            .and_then(|bytes| cbor::from_slice::<Tag24<Mso>>(bytes).ok())
            .map(Tag24::into_inner);

        validated.issuer_signed_authenticated =
            self.authenticate_issuer(&document.issuer_signed.issuer_auth);

        if let Some(mso) = &mso {
            validated.validity = if mso.validity_info.contains(&chrono::Utc::now()) {
                Outcome::Valid
            } else {
                Outcome::Invalid
            };
            validated.device_signed_authenticated = self.authenticate_device(document, mso);
        }

        if let Some(namespaces) = &document.issuer_signed.namespaces {
            for (namespace, items) in namespaces.iter() {
                for item in items.iter() {
                    let digest_ok = mso
                        .as_ref()
                        .map(|mso| digest_matches(mso, namespace, item))
                        .unwrap_or(false);
                    if digest_ok {
                        validated
                            .elements
                            .entry(namespace.clone())
                            .or_default()
                            .insert(
                                item.inner.element_identifier.clone(),
                                item.inner.element_value.0.clone(),
                            );
                    } else {
                        validated.digest_mismatches += 1;
                    }
                }
            }
        }
        validated
    }

    fn authenticate_issuer(&self, issuer_auth: &CoseSign1) -> Outcome {
        let x5chain = issuer_auth
            .unprotected_header(X5CHAIN_HEADER_LABEL)
            .cloned()
            .and_then(|v| X5Chain::try_from(v).ok());
        let Some(key) = x5chain.and_then(|chain| chain.end_entity_public_key().ok()) else {
            return Outcome::Unchecked;
        };
        match issuer_auth.verify_p256(&key, None) {
            Ok(()) => Outcome::Valid,
            Err(_) => Outcome::Invalid,
        }
    }

    fn authenticate_device(&self, document: &Document, mso: &Mso) -> Outcome {
        let auth = DeviceAuthentication::new(
            self.session_transcript.inner.clone(),
            document.doc_type.clone(),
            document.device_signed.namespaces.clone(),
        );
        let Ok(payload) = Tag24::new(auth).and_then(|t| {
            cbor::to_vec(&t).map_err(crate::definitions::helpers::tag24::Error::UnableToEncode)
        }) else {
            return Outcome::Unchecked;
        };
        match &document.device_signed.device_auth {
            DeviceAuth::DeviceSignature(sign1) => {
                let key: Result<p256::ecdsa::VerifyingKey, _> =
                    mso.device_key_info.device_key.clone().try_into();
                let Ok(key) = key else {
                    return Outcome::Unchecked;
                };
                match sign1.verify_p256(&key, Some(&payload)) {
                    Ok(()) => Outcome::Valid,
                    Err(_) => Outcome::Invalid,
                }
            }
            DeviceAuth::DeviceMac(mac0) => {
                let Ok(e_mac_key) = self.derive_e_mac_key(&mso.device_key_info.device_key) else {
                    return Outcome::Unchecked;
                };
                match mac0.verify_hmac_sha256(&e_mac_key, Some(&payload)) {
                    Ok(()) => Outcome::Valid,
                    Err(_) => Outcome::Invalid,
                }
            }
        }
    }

    fn derive_e_mac_key(
        &self,
        device_key: &crate::definitions::device_key::CoseKey,
    ) -> Result<[u8; 32], Error> {
        let shared = session::get_shared_secret(device_key.clone(), &self.e_reader_key_secret)?;
        let transcript_bytes = cbor::to_vec(&self.session_transcript)?;
        let salt = Sha256::digest(transcript_bytes);
        let hkdf = Hkdf::<Sha256>::new(Some(salt.as_ref()), shared.raw_secret_bytes());
        let mut okm = [0u8; 32];
        hkdf.expand(b"EMacKey", &mut okm)
            .map_err(|_| session::Error::SessionKeyDerivation)?;
        Ok(okm)
    }

    fn validate_zk_document(
        &self,
        document: &ZkDocument,
        registry: Option<&ZkVerifierRegistry>,
    ) -> ZkOutcome {
        let result = match registry {
            None => Err(zkp::Error::ProofSystemNotFound(
                document.zk_system_id.clone(),
            )),
            Some(registry) => registry.verify_document(document, &self.session_transcript),
        };
        ZkOutcome {
            doc_type: document.doc_type.clone(),
            result,
        }
    }

    /// A status-only envelope announcing orderly termination.
    pub fn termination_message(&self) -> Result<Vec<u8>, Error> {
        Ok(cbor::to_vec(&session::SessionData::termination())?)
    }
}

fn digest_matches(mso: &Mso, namespace: &str, item: &IssuerSignedItemBytes) -> bool {
    let Some(expected) = mso
        .value_digests
        .get(namespace)
        .and_then(|digests| digests.get(&item.inner.digest_id))
    else {
        return false;
    };
    let Ok(bytes) = cbor::to_vec(item) else {
        return false;
    };
    mso.digest_algorithm.digest(&bytes).as_slice() == expected.as_ref()
}
