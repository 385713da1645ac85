//! The holder side of presentment.
//!
//! States advance from [SessionManagerInit] (engagement built, nothing sent)
//! through [SessionManagerEngaged] (engagement handed over, awaiting session
//! establishment) to [SessionManager] (session keys agreed, requests and
//! responses flowing).
//!
//! Device signatures are produced through an external loop so the private
//! key can live in a secure area: drain [SessionManager::get_next_signature_payload]
//! and feed each signature to [SessionManager::submit_next_signature].
use std::collections::BTreeMap;

use coset::Header;
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::cbor;
use crate::cose::{self, sign1::PreparedCoseSign1, CoseSign1};
use crate::definitions::device_engagement::{DeviceEngagement, DeviceRetrievalMethods};
use crate::definitions::device_request::{
    DeviceRequest, DocRequest, ItemsRequest, ReaderAuthentication,
};
use crate::definitions::device_response::{
    DeviceResponse, Document as ResponseDocument, DocumentError, DocumentErrorCode, Status,
};
use crate::definitions::device_signed::{
    DeviceAuth, DeviceAuthentication, DeviceNamespaces, DeviceSigned,
};
use crate::definitions::helpers::{NonEmptyMap, NonEmptyVec, Tag24};
use crate::definitions::issuer_signed::{IssuerSigned, IssuerSignedItemBytes};
use crate::definitions::mso::Mso;
use crate::definitions::retrieval_methods;
use crate::definitions::session::{
    self, Handover, Role, SessionCipher, SessionData, SessionEstablishment,
    SessionTranscript180135, SessionTranscriptBytes,
};
use crate::definitions::x5chain::{X5Chain, X5CHAIN_HEADER_LABEL};
use crate::issuance::Mdoc;
use crate::secure_area::SecureArea;

use super::Stringify;

pub type RequestedItems = Vec<ItemsRequest>;
pub type PermittedItems = BTreeMap<String, BTreeMap<String, Vec<String>>>;
pub type Documents = NonEmptyMap<String, Document>;

/// A holder-side credential, indexed for responding to requests.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub issuer_auth: CoseSign1,
    pub mso: Mso,
    pub namespaces: NonEmptyMap<String, NonEmptyMap<String, IssuerSignedItemBytes>>,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Session(#[from] session::Error),
    #[error(transparent)]
    Cbor(#[from] cbor::CborError),
    #[error(transparent)]
    Tag24(#[from] crate::definitions::helpers::tag24::Error),
    #[error(transparent)]
    Engagement(#[from] crate::definitions::device_engagement::Error),
    #[error(transparent)]
    RetrievalMethods(#[from] retrieval_methods::Error),
    #[error("unsupported request version: {0}")]
    UnsupportedVersion(String),
    #[error("no prepared document awaits a signature")]
    NoOutstandingSignature,
    #[error(transparent)]
    SecureArea(#[from] crate::secure_area::Error),
    #[error(transparent)]
    Cose(#[from] crate::cose::Error),
}

/// Holder state before engagement: documents loaded, ephemeral key chosen,
/// engagement ready to present.
#[derive(Serialize, Deserialize)]
pub struct SessionManagerInit {
    documents: Documents,
    e_device_key: Vec<u8>,
    device_engagement: EngagementBytes,
}

type EngagementBytes = Tag24<DeviceEngagement>;

/// Holder state after handing over the engagement, awaiting the reader's
/// session establishment message.
#[derive(Serialize, Deserialize)]
pub struct SessionManagerEngaged {
    documents: Documents,
    e_device_key: Vec<u8>,
    device_engagement: EngagementBytes,
    handover: Handover,
}

/// Holder state with an established session.
pub struct SessionManager {
    documents: Documents,
    session_transcript: SessionTranscriptBytes,
    e_reader_key: crate::definitions::device_key::CoseKey,
    cipher: SessionCipher,
    reader_auth: Vec<ReaderAuthOutcome>,
    state: State,
}

#[derive(Default)]
enum State {
    #[default]
    AwaitingRequest,
    Signing(PreparedDeviceResponse),
    ReadyToRespond(Vec<u8>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReaderAuthStatus {
    /// The request carried no reader signature.
    Anonymous,
    Verified,
    Failed,
}

#[derive(Clone, Debug)]
pub struct ReaderAuthOutcome {
    pub doc_type: String,
    pub status: ReaderAuthStatus,
    pub x5chain: Option<X5Chain>,
}

impl SessionManagerInit {
    /// Choose an ephemeral key and build the engagement.
    pub fn initialise(
        documents: Documents,
        device_retrieval_methods: DeviceRetrievalMethods,
    ) -> Result<Self, Error> {
        let methods = retrieval_methods::disambiguate(&device_retrieval_methods, Role::Device)?;
        let (e_device_key, e_device_pub) = session::create_p256_ephemeral_keys()?;
        let key_bytes = Tag24::new(e_device_pub)?;
        let device_engagement = Tag24::new(DeviceEngagement::new(key_bytes, methods))?;
        Ok(Self {
            documents,
            e_device_key: e_device_key.to_bytes().to_vec(),
            device_engagement,
        })
    }

    pub fn ble_ident(&self) -> anyhow::Result<[u8; 16]> {
        super::calculate_ble_ident(&self.device_engagement.inner.security.1)
    }

    /// Hand the engagement over by QR code: returns the next state and the
    /// URI to display.
    pub fn qr_engagement(self) -> (SessionManagerEngaged, String) {
        let uri = self.device_engagement.to_qr_code_uri();
        let state = SessionManagerEngaged {
            documents: self.documents,
            e_device_key: self.e_device_key,
            device_engagement: self.device_engagement,
            handover: Handover::QR,
        };
        (state, uri)
    }

    /// Hand the engagement over by NFC, recording the handover messages that
    /// the transcript must bind.
    pub fn nfc_engagement(self, handover: Handover) -> SessionManagerEngaged {
        SessionManagerEngaged {
            documents: self.documents,
            e_device_key: self.e_device_key,
            device_engagement: self.device_engagement,
            handover,
        }
    }
}

impl Stringify for SessionManagerInit {}
impl Stringify for SessionManagerEngaged {}

impl SessionManagerEngaged {
    pub fn device_engagement(&self) -> &EngagementBytes {
        &self.device_engagement
    }

    /// Derive session keys from the reader's establishment message, decrypt
    /// the first request, and advance to an established session.
    pub fn process_session_establishment(
        self,
        session_establishment: SessionEstablishment,
    ) -> Result<(SessionManager, RequestedItems), Error> {
        let e_reader_key = session_establishment.e_reader_key;
        let session_transcript = Tag24::new(SessionTranscript180135(
            self.device_engagement,
            e_reader_key.clone(),
            self.handover,
        ))?;
        let e_device_key = p256::SecretKey::from_slice(&self.e_device_key)
            .map_err(|_| session::Error::KeyAgreement)?;
        let cipher = SessionCipher::establish(
            Role::Device,
            &e_device_key,
            e_reader_key.inner.clone(),
            &session_transcript,
        )?;

        let mut sm = SessionManager {
            documents: self.documents,
            session_transcript,
            e_reader_key: e_reader_key.into_inner(),
            cipher,
            reader_auth: Vec::new(),
            state: State::AwaitingRequest,
        };
        let plaintext = sm.cipher.decrypt_data(session_establishment.data.as_ref())?;
        let requested = sm.handle_decoded_request(&plaintext)?;
        Ok((sm, requested))
    }
}

impl SessionManager {
    pub fn session_transcript(&self) -> &SessionTranscriptBytes {
        &self.session_transcript
    }

    /// Reader authentication results for the most recent request, one per
    /// document request.
    pub fn reader_authentication(&self) -> &[ReaderAuthOutcome] {
        &self.reader_auth
    }

    /// Decrypt and parse a request received over an established session.
    pub fn handle_request(&mut self, envelope: &[u8]) -> Result<RequestedItems, Error> {
        let (plaintext, _status) = self.cipher.decrypt_message(envelope)?;
        let plaintext = plaintext.ok_or(session::Error::Decryption)?;
        self.handle_decoded_request(&plaintext)
    }

    fn handle_decoded_request(&mut self, plaintext: &[u8]) -> Result<RequestedItems, Error> {
        let request: DeviceRequest = cbor::from_slice(plaintext)?;
        if request.version != DeviceRequest::VERSION {
            return Err(Error::UnsupportedVersion(request.version));
        }
        self.reader_auth = request
            .doc_requests
            .iter()
            .map(|doc_request| self.authenticate_reader(doc_request))
            .collect();
        Ok(request
            .doc_requests
            .into_iter()
            .map(|doc_request| doc_request.items_request.into_inner())
            .collect())
    }

    fn authenticate_reader(&self, doc_request: &DocRequest) -> ReaderAuthOutcome {
        let doc_type = doc_request.items_request.inner.doc_type.clone();
        let Some(reader_auth) = &doc_request.reader_auth else {
            return ReaderAuthOutcome {
                doc_type,
                status: ReaderAuthStatus::Anonymous,
                x5chain: None,
            };
        };
        let x5chain = reader_auth
            .unprotected_header(X5CHAIN_HEADER_LABEL)
            .cloned()
            .and_then(|v| X5Chain::try_from(v).ok());
        let status = match self.verify_reader_auth(reader_auth, &doc_request.items_request, &x5chain)
        {
            Ok(()) => ReaderAuthStatus::Verified,
            Err(e) => {
                tracing::debug!(doc_type, "reader authentication failed: {e}");
                ReaderAuthStatus::Failed
            }
        };
        ReaderAuthOutcome {
            doc_type,
            status,
            x5chain,
        }
    }

    fn verify_reader_auth(
        &self,
        reader_auth: &CoseSign1,
        items_request: &Tag24<ItemsRequest>,
        x5chain: &Option<X5Chain>,
    ) -> Result<(), Error> {
        let x5chain = x5chain
            .as_ref()
            .ok_or(crate::cose::Error::NoAlgorithm)?;
        let key = x5chain
            .end_entity_public_key()
            .map_err(|_| crate::cose::Error::UnsupportedAlgorithm)?;
        let detached = cbor::to_vec(&Tag24::new(ReaderAuthentication::new(
            self.session_transcript.inner.clone(),
            items_request.clone(),
        ))?)?;
        reader_auth.verify_p256(&key, Some(&detached))?;
        Ok(())
    }

    /// Select the items to disclose and prepare a signature-authenticated
    /// response. Items outside both the request and the permitted set are
    /// never included.
    pub fn prepare_response(&mut self, requests: &RequestedItems, permitted: PermittedItems) {
        let prepared = self.build_prepared_response(requests, permitted);
        if prepared.prepared_documents.is_empty() {
            // Nothing needs a signature; seal immediately.
            self.seal_response(prepared);
        } else {
            self.state = State::Signing(prepared);
        }
    }

    /// Select the items to disclose and respond with MAC device
    /// authentication, deriving the MAC key from the aliased device key and
    /// the reader's ephemeral key.
    pub fn prepare_response_mac(
        &mut self,
        requests: &RequestedItems,
        permitted: PermittedItems,
        secure_area: &dyn SecureArea,
        key_alias: &str,
    ) -> Result<(), Error> {
        let mut prepared = self.build_prepared_response(requests, permitted);
        let e_mac_key = self.derive_e_mac_key(secure_area, key_alias)?;
        let documents = std::mem::take(&mut prepared.prepared_documents);
        for document in documents {
            let mac0 = cose::mac0::tag_hmac_sha256(&e_mac_key, &document.auth_payload, false)?;
            prepared
                .signed_documents
                .push(document.finalize(DeviceAuth::DeviceMac(mac0)));
        }
        self.seal_response(prepared);
        Ok(())
    }

    fn derive_e_mac_key(
        &self,
        secure_area: &dyn SecureArea,
        key_alias: &str,
    ) -> Result<[u8; 32], Error> {
        let shared = secure_area.key_agreement(key_alias, &self.e_reader_key)?;
        let transcript_bytes = cbor::to_vec(&self.session_transcript)?;
        let salt = Sha256::digest(transcript_bytes);
        let hkdf = Hkdf::<Sha256>::new(Some(salt.as_ref()), &shared);
        let mut okm = [0u8; 32];
        hkdf.expand(b"EMacKey", &mut okm)
            .map_err(|_| session::Error::SessionKeyDerivation)?;
        Ok(okm)
    }

    fn build_prepared_response(
        &self,
        requests: &RequestedItems,
        permitted: PermittedItems,
    ) -> PreparedDeviceResponse {
        let mut prepared = PreparedDeviceResponse::default();
        for request in requests {
            match self.prepare_document(request, &permitted) {
                Ok(document) => prepared.prepared_documents.push(document),
                Err(doc_type) => {
                    let mut error = DocumentError::new();
                    error.insert(doc_type, DocumentErrorCode::DataNotReturned);
                    prepared.document_errors.push(error);
                }
            }
        }
        prepared
    }

    /// Assemble one document for the response, or return its doc type if the
    /// holder has nothing to disclose for it.
    fn prepare_document(
        &self,
        request: &ItemsRequest,
        permitted: &PermittedItems,
    ) -> Result<PreparedDocument, String> {
        let document = self
            .documents
            .get(&request.doc_type)
            .ok_or_else(|| request.doc_type.clone())?;
        let permitted_for_doc = permitted.get(&request.doc_type);

        let mut namespaces: BTreeMap<String, Vec<IssuerSignedItemBytes>> = BTreeMap::new();
        let mut errors: BTreeMap<String, BTreeMap<String, DocumentErrorCode>> = BTreeMap::new();
        for (namespace, elements) in request.namespaces.iter() {
            for element in elements.keys() {
                let allowed = permitted_for_doc
                    .and_then(|namespaces| namespaces.get(namespace))
                    .map(|elements| elements.iter().any(|e| e == element))
                    .unwrap_or(false);
                let item = document
                    .namespaces
                    .get(namespace)
                    .and_then(|items| items.get(element));
                match (allowed, item) {
                    (true, Some(item)) => {
                        namespaces
                            .entry(namespace.clone())
                            .or_default()
                            .push(item.clone());
                    }
                    _ => {
                        errors
                            .entry(namespace.clone())
                            .or_default()
                            .insert(element.clone(), DocumentErrorCode::DataNotReturned);
                    }
                }
            }
        }
        if namespaces.is_empty() {
            return Err(request.doc_type.clone());
        }

        let device_namespaces = Tag24::new(DeviceNamespaces::new())
            .map_err(|_| request.doc_type.clone())?;
        let auth = DeviceAuthentication::new(
            self.session_transcript.inner.clone(),
            request.doc_type.clone(),
            device_namespaces.clone(),
        );
        let auth_payload = Tag24::new(auth)
            .ok()
            .and_then(|t| cbor::to_vec(&t).ok())
            .ok_or_else(|| request.doc_type.clone())?;
        let prepared_cose_sign1 = PreparedCoseSign1::new(
            coset::iana::Algorithm::ES256,
            &auth_payload,
            false,
            Header::default(),
        );

        let issuer_namespaces = namespaces
            .into_iter()
            .filter_map(|(ns, items)| Some((ns, NonEmptyVec::maybe_new(items)?)))
            .collect::<BTreeMap<_, _>>();
        let errors = NonEmptyMap::maybe_new(
            errors
                .into_iter()
                .filter_map(|(ns, els)| Some((ns, NonEmptyMap::maybe_new(els)?)))
                .collect(),
        );

        Ok(PreparedDocument {
            id: document.id,
            doc_type: request.doc_type.clone(),
            issuer_signed: IssuerSigned {
                namespaces: NonEmptyMap::maybe_new(issuer_namespaces),
                issuer_auth: document.issuer_auth.clone(),
            },
            device_namespaces,
            auth_payload,
            prepared_cose_sign1,
            errors,
        })
    }

    /// The next payload awaiting an external device signature, if any.
    pub fn get_next_signature_payload(&self) -> Option<(Uuid, &[u8])> {
        match &self.state {
            State::Signing(prepared) => prepared
                .prepared_documents
                .last()
                .map(|doc| (doc.id, doc.prepared_cose_sign1.signature_payload())),
            _ => None,
        }
    }

    /// Accept a raw ES256 signature for the payload most recently returned
    /// by [Self::get_next_signature_payload]. When the last outstanding
    /// signature arrives, the response is sealed and ready to retrieve.
    pub fn submit_next_signature(&mut self, signature: Vec<u8>) -> Result<(), Error> {
        let State::Signing(prepared) = &mut self.state else {
            return Err(Error::NoOutstandingSignature);
        };
        let document = prepared
            .prepared_documents
            .pop()
            .ok_or(Error::NoOutstandingSignature)?;
        let sign1 = document.prepared_cose_sign1.clone().into_cose_sign1(signature);
        prepared
            .signed_documents
            .push(document.finalize(DeviceAuth::DeviceSignature(sign1)));
        if prepared.prepared_documents.is_empty() {
            let prepared = match std::mem::take(&mut self.state) {
                State::Signing(prepared) => prepared,
                _ => unreachable!(),
            };
            self.seal_response(prepared);
        }
        Ok(())
    }

    fn seal_response(&mut self, prepared: PreparedDeviceResponse) {
        match prepared.into_envelope(&mut self.cipher) {
            Ok(envelope) => self.state = State::ReadyToRespond(envelope),
            Err(e) => {
                tracing::error!("unable to seal response: {e}");
                let fallback = cbor::to_vec(&SessionData {
                    data: None,
                    status: Some(session::Status::SessionEncryptionError),
                })
                .unwrap_or_default();
                self.state = State::ReadyToRespond(fallback);
            }
        }
    }

    /// The encrypted response envelope, once all signatures are in.
    pub fn retrieve_response(&mut self) -> Option<Vec<u8>> {
        match std::mem::take(&mut self.state) {
            State::ReadyToRespond(envelope) => Some(envelope),
            other => {
                self.state = other;
                None
            }
        }
    }

    /// A status-only envelope announcing orderly termination.
    pub fn termination_message(&self) -> Result<Vec<u8>, Error> {
        Ok(cbor::to_vec(&SessionData::termination())?)
    }
}

/// Wire signature payloads must be signed in the order returned; documents
/// become part of the response as their signatures arrive.
#[derive(Default)]
struct PreparedDeviceResponse {
    prepared_documents: Vec<PreparedDocument>,
    signed_documents: Vec<ResponseDocument>,
    document_errors: Vec<DocumentError>,
}

struct PreparedDocument {
    id: Uuid,
    doc_type: String,
    issuer_signed: IssuerSigned,
    device_namespaces: Tag24<DeviceNamespaces>,
    auth_payload: Vec<u8>,
    prepared_cose_sign1: PreparedCoseSign1,
    errors: Option<crate::definitions::device_response::Errors>,
}

impl PreparedDocument {
    fn finalize(self, device_auth: DeviceAuth) -> ResponseDocument {
        ResponseDocument {
            doc_type: self.doc_type,
            issuer_signed: self.issuer_signed,
            device_signed: DeviceSigned {
                namespaces: self.device_namespaces,
                device_auth,
            },
            errors: self.errors,
        }
    }
}

impl PreparedDeviceResponse {
    fn into_envelope(self, cipher: &mut SessionCipher) -> Result<Vec<u8>, session::Error> {
        let status = if self.signed_documents.is_empty() && self.document_errors.is_empty() {
            Status::GeneralError
        } else {
            Status::OK
        };
        let response = DeviceResponse {
            version: DeviceResponse::VERSION.to_string(),
            documents: NonEmptyVec::maybe_new(self.signed_documents),
            zk_documents: None,
            document_errors: NonEmptyVec::maybe_new(self.document_errors),
            status,
        };
        let plaintext = cbor::to_vec(&response)?;
        cipher.encrypt_message(&plaintext)
    }
}

/// Grant everything that was requested; for flows without selective user
/// consent.
pub fn permit_all(requests: &RequestedItems) -> PermittedItems {
    let mut permitted = PermittedItems::new();
    for request in requests {
        let doc = permitted.entry(request.doc_type.clone()).or_default();
        for (namespace, elements) in request.namespaces.iter() {
            doc.entry(namespace.clone())
                .or_default()
                .extend(elements.keys().cloned());
        }
    }
    permitted
}

impl From<Mdoc> for Document {
    fn from(mdoc: Mdoc) -> Document {
        let namespaces = mdoc
            .namespaces
            .into_inner()
            .into_iter()
            .map(|(namespace, items)| {
                let items = items
                    .into_inner()
                    .into_iter()
                    .map(|item| (item.inner.element_identifier.clone(), item))
                    .collect::<BTreeMap<_, _>>();
                // Items came from a NonEmptyVec, so the map is non-empty.
                (namespace, NonEmptyMap::maybe_new(items).unwrap())
            })
            .collect::<BTreeMap<_, _>>();
        Document {
            id: Uuid::new_v4(),
            issuer_auth: mdoc.issuer_auth,
            mso: mdoc.mso,
            namespaces: NonEmptyMap::maybe_new(namespaces)
                .expect("issued credentials always carry at least one namespace"),
        }
    }
}
