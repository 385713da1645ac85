use serde::{Deserialize, Serialize};

use crate::definitions::helpers::ByteStr;

pub type ZkSystemId = String;

/// A document presented as a zero-knowledge proof instead of issuer and
/// device signatures. The proof and statement are opaque here; a registered
/// proof-system backend interprets them.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ZkDocument {
    pub doc_type: String,
    pub zk_system_id: ZkSystemId,
    pub proof: ByteStr,
    pub statement: ciborium::Value,
}
