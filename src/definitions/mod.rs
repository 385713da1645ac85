//! Data structures exchanged during proximity presentment, with CBOR
//! serialization faithful to their wire formats.
pub mod device_engagement;
pub mod device_key;
pub mod device_request;
pub mod device_response;
pub mod device_signed;
pub mod helpers;
pub mod issuer_signed;
pub mod mso;
pub mod retrieval_methods;
pub mod session;
pub mod validity_info;
pub mod x5chain;
pub mod zk;

pub use device_engagement::{DeviceEngagement, DeviceRetrievalMethods, ReaderEngagement};
pub use device_request::DeviceRequest;
pub use device_response::DeviceResponse;
pub use device_signed::{DeviceAuth, DeviceAuthentication, DeviceSigned};
pub use issuer_signed::{IssuerSigned, IssuerSignedItem};
pub use mso::Mso;
pub use session::{Role, SessionCipher, SessionData, SessionEstablishment, SessionTranscript180135};
pub use validity_info::ValidityInfo;
pub use x5chain::X5Chain;
