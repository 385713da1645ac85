//! Full holder/reader exchanges over an in-memory session, from QR
//! engagement through response validation.
mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use mdoc_proximity::cbor;
use mdoc_proximity::definitions::device_engagement::{
    BleOptions, CentralClientMode, DeviceRetrievalMethod, DeviceRetrievalMethods,
};
use mdoc_proximity::definitions::helpers::Tag24;
use mdoc_proximity::definitions::session::SessionEstablishment;
use mdoc_proximity::definitions::x5chain::X5Chain;
use mdoc_proximity::presentation::device::{
    self, Document, Documents, ReaderAuthStatus, SessionManager, SessionManagerEngaged,
    SessionManagerInit,
};
use mdoc_proximity::presentation::reader::{self, Outcome, ReaderAuthority};
use mdoc_proximity::presentation::Stringify;
use mdoc_proximity::secure_area::{KeySettings, SecureArea, SoftwareSecureArea};

fn retrieval_methods() -> DeviceRetrievalMethods {
    DeviceRetrievalMethods::new(DeviceRetrievalMethod::BLE(BleOptions {
        peripheral_server_mode: None,
        central_client_mode: Some(CentralClientMode {
            uuid: uuid::Uuid::new_v4(),
        }),
    }))
}

struct Holder {
    secure_area: Arc<SoftwareSecureArea>,
    engaged: SessionManagerEngaged,
    qr_uri: String,
}

fn engage_holder() -> Holder {
    let secure_area = Arc::new(SoftwareSecureArea::default());
    let key_info = secure_area.create_key("device", KeySettings::default()).unwrap();
    let mdoc = common::issue_mdoc(key_info.public_key);
    let document: Document = mdoc.into();
    let documents = Documents::new(common::DOC_TYPE.to_string(), document);
    let init = SessionManagerInit::initialise(documents, retrieval_methods()).unwrap();
    let (engaged, qr_uri) = init.qr_engagement();
    Holder {
        secure_area,
        engaged,
        qr_uri,
    }
}

fn reader_authority(secure_area: &SoftwareSecureArea) -> ReaderAuthority<'_> {
    let reader_key = p256::SecretKey::from_sec1_pem(common::READER_KEY).unwrap();
    secure_area.import_key("reader", reader_key).unwrap();
    ReaderAuthority {
        secure_area,
        key_alias: "reader",
        x5chain: X5Chain::from_pem_chain(common::READER_CERT).unwrap(),
    }
}

fn respond(
    holder: Holder,
    establishment: &[u8],
    mac: bool,
) -> (SessionManager, Vec<u8>) {
    let establishment: SessionEstablishment = cbor::from_slice(establishment).unwrap();
    let (mut session, requested) = holder
        .engaged
        .process_session_establishment(establishment)
        .unwrap();
    let permitted = device::permit_all(&requested);
    if mac {
        session
            .prepare_response_mac(
                &requested,
                permitted,
                holder.secure_area.as_ref(),
                "device",
            )
            .unwrap();
    } else {
        session.prepare_response(&requested, permitted);
        while let Some((_, payload)) = session.get_next_signature_payload() {
            let signature = holder.secure_area.sign("device", payload).unwrap();
            session.submit_next_signature(signature).unwrap();
        }
    }
    let response = session.retrieve_response().unwrap();
    (session, response)
}

#[test]
fn qr_presentment_with_signature_auth() {
    let holder = engage_holder();
    let reader_area = SoftwareSecureArea::default();
    let (mut reader, establishment, _ble_ident) = reader::SessionManager::establish_session(
        &holder.qr_uri,
        vec![common::demo_request()],
        Some(reader_authority(&reader_area)),
    )
    .unwrap();

    let (holder_session, response) = respond(holder, &establishment, false);
    assert_eq!(
        holder_session.reader_authentication()[0].status,
        ReaderAuthStatus::Verified
    );

    let validated = reader.handle_response(&response, None).unwrap();
    assert_eq!(validated.documents.len(), 1);
    let doc = &validated.documents[0];
    assert_eq!(doc.doc_type, common::DOC_TYPE);
    assert_eq!(doc.issuer_signed_authenticated, Outcome::Valid);
    assert_eq!(doc.device_signed_authenticated, Outcome::Valid);
    assert_eq!(doc.validity, Outcome::Valid);
    assert_eq!(doc.digest_mismatches, 0);
    assert_eq!(
        doc.elements[common::NAMESPACE]["family_name"],
        ciborium::Value::Text("Mustermann".to_string())
    );
    assert!(validated.document_errors.is_empty());
}

#[test]
fn qr_presentment_with_mac_auth() {
    let holder = engage_holder();
    let (mut reader, establishment, _) = reader::SessionManager::establish_session(
        &holder.qr_uri,
        vec![common::demo_request()],
        None,
    )
    .unwrap();

    let (holder_session, response) = respond(holder, &establishment, true);
    assert_eq!(
        holder_session.reader_authentication()[0].status,
        ReaderAuthStatus::Anonymous
    );

    let validated = reader.handle_response(&response, None).unwrap();
    let doc = &validated.documents[0];
    assert_eq!(doc.issuer_signed_authenticated, Outcome::Valid);
    assert_eq!(doc.device_signed_authenticated, Outcome::Valid);
    assert_eq!(doc.digest_mismatches, 0);
}

#[test]
fn anonymous_request_with_signature_auth() {
    let holder = engage_holder();
    let (mut reader, establishment, _) = reader::SessionManager::establish_session(
        &holder.qr_uri,
        vec![common::demo_request()],
        None,
    )
    .unwrap();

    let (holder_session, response) = respond(holder, &establishment, false);
    assert_eq!(
        holder_session.reader_authentication()[0].status,
        ReaderAuthStatus::Anonymous
    );

    let validated = reader.handle_response(&response, None).unwrap();
    let doc = &validated.documents[0];
    assert_eq!(doc.issuer_signed_authenticated, Outcome::Valid);
    assert_eq!(doc.device_signed_authenticated, Outcome::Valid);
}

#[test]
fn tampered_element_is_a_digest_mismatch() {
    let secure_area = Arc::new(SoftwareSecureArea::default());
    let key_info = secure_area.create_key("device", KeySettings::default()).unwrap();
    let mdoc = common::issue_mdoc(key_info.public_key);
    let mut document: Document = mdoc.into();

    // Swap one issuer-signed value after issuance.
    let namespace = document.namespaces[common::NAMESPACE].clone();
    let original = namespace["family_name"].clone();
    let mut forged = original.inner;
    forged.element_value = ciborium::Value::Text("Impostor".to_string()).into();
    let mut namespace = namespace;
    namespace.insert("family_name".to_string(), Tag24::new(forged).unwrap());
    document
        .namespaces
        .insert(common::NAMESPACE.to_string(), namespace);

    let documents = Documents::new(common::DOC_TYPE.to_string(), document);
    let init = SessionManagerInit::initialise(documents, retrieval_methods()).unwrap();
    let (engaged, qr_uri) = init.qr_engagement();
    let holder = Holder {
        secure_area,
        engaged,
        qr_uri,
    };

    let (mut reader, establishment, _) = reader::SessionManager::establish_session(
        &holder.qr_uri,
        vec![common::demo_request()],
        None,
    )
    .unwrap();
    let (_, response) = respond(holder, &establishment, false);
    let validated = reader.handle_response(&response, None).unwrap();
    let doc = &validated.documents[0];
    // The issuer signature still verifies; only the digest check trips.
    assert_eq!(doc.issuer_signed_authenticated, Outcome::Valid);
    assert_eq!(doc.digest_mismatches, 1);
}

#[test]
fn withheld_document_is_reported_as_an_error() {
    let holder = engage_holder();
    let (mut reader, establishment, _) = reader::SessionManager::establish_session(
        &holder.qr_uri,
        vec![common::demo_request()],
        None,
    )
    .unwrap();

    let establishment: SessionEstablishment = cbor::from_slice(&establishment).unwrap();
    let (mut session, requested) = holder
        .engaged
        .process_session_establishment(establishment)
        .unwrap();
    // Decline everything.
    session.prepare_response(&requested, BTreeMap::new());
    let response = session.retrieve_response().unwrap();

    let validated = reader.handle_response(&response, None).unwrap();
    assert!(validated.documents.is_empty());
    assert_eq!(validated.document_errors, vec![common::DOC_TYPE.to_string()]);
}

#[test]
fn holder_termination_surfaces_to_the_reader() {
    let holder = engage_holder();
    let (mut reader, establishment, _) = reader::SessionManager::establish_session(
        &holder.qr_uri,
        vec![common::demo_request()],
        None,
    )
    .unwrap();
    let (holder_session, _) = respond(holder, &establishment, false);

    let termination = holder_session.termination_message().unwrap();
    let err = reader.handle_response(&termination, None).unwrap_err();
    assert!(matches!(err, reader::Error::SessionTerminated));
}

#[test]
fn engaged_state_survives_a_stringify_round_trip() {
    let holder = engage_holder();
    let stashed = holder.engaged.stringify().unwrap();
    let restored = SessionManagerEngaged::parse(&stashed).unwrap();

    let (mut reader, establishment, _) = reader::SessionManager::establish_session(
        &holder.qr_uri,
        vec![common::demo_request()],
        None,
    )
    .unwrap();
    let holder = Holder {
        secure_area: holder.secure_area,
        engaged: restored,
        qr_uri: holder.qr_uri,
    };
    let (_, response) = respond(holder, &establishment, false);
    let validated = reader.handle_response(&response, None).unwrap();
    assert_eq!(validated.documents.len(), 1);
}

#[test]
fn reusing_an_engagement_with_a_different_reader_key_fails_decryption() {
    let holder = engage_holder();
    let (_, establishment, _) = reader::SessionManager::establish_session(
        &holder.qr_uri,
        vec![common::demo_request()],
        None,
    )
    .unwrap();
    // A second reader derives different session keys from the same QR code.
    let (mut second_reader, _, _) = reader::SessionManager::establish_session(
        &holder.qr_uri,
        vec![common::demo_request()],
        None,
    )
    .unwrap();

    let (_, response) = respond(holder, &establishment, false);
    assert!(second_reader.handle_response(&response, None).is_err());
}
