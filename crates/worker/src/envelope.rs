//! Result envelope: the JSON document uploaded per completed run.
//!
//! The cost block uses the fixed 4-decimal wire form; everything money-
//! related inside the platform stays integer micros. The envelope hash is
//! computed over the exact serialized bytes and stored both on the run
//! record and in the artifact metadata.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use packflow_core::{Money, Run};

/// Envelope schema version, bumped on breaking layout changes.
const ENVELOPE_SCHEMA_VERSION: &str = "1";

/// Build the result envelope for a finished execution.
pub fn build_envelope(
    run: &Run,
    data: &serde_json::Value,
    actual_cost: Money,
    generated_at: DateTime<Utc>,
) -> Vec<u8> {
    let envelope = serde_json::json!({
        "schema_version": ENVELOPE_SCHEMA_VERSION,
        "run_id": run.run_id,
        "pack_kind": run.pack.kind,
        "status": "COMPLETED",
        "generated_at": generated_at.to_rfc3339(),
        "cost": {
            "reserved": run.reservation_max_cost.to_string(),
            "used": actual_cost.to_string(),
            "minimum_fee": run.minimum_fee.to_string(),
        },
        "data": data,
    });

    serde_json::to_vec_pretty(&envelope).expect("envelope serialization cannot fail")
}

/// SHA-256 of the envelope bytes, hex-encoded.
pub fn envelope_sha256(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
