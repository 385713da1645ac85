//! ISO/IEC 18013-5 proximity presentment of mobile documents.
//!
//! The crate covers the full exchange between a holder's device and a
//! reader:
//!
//! * [definitions]: the wire data structures — device engagement, session
//!   establishment and encryption, requests, responses and the issuer's
//!   mobile security object.
//! * [issuance]: construction of issuer-signed credentials for the holder
//!   to present.
//! * [presentation]: the holder ([presentation::device]) and reader
//!   ([presentation::reader]) state machines, including reader, issuer and
//!   device authentication and zero-knowledge document verification.
//! * [transport]: the connection lifecycle over BLE GATT, BLE L2CAP and
//!   NFC framings, with cancellation and three termination styles.
//! * [harness]: a two-process TCP harness that runs complete presentments
//!   and reports timings.
//!
//! Key material is kept behind the [secure_area::SecureArea] trait so that
//! hardware-backed stores can slot in; [secure_area::SoftwareSecureArea]
//! serves tests and the harness.
pub mod cbor;
pub mod cose;
pub mod definitions;
pub mod harness;
pub mod issuance;
pub mod presentation;
pub mod secure_area;
pub mod transport;

pub use issuance::Mdoc;
