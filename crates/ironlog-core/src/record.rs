//! # Records
//!
//! Local rows and remote records, plus the payload helpers both sides share.
//!
//! ## Dual-Key Identity
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │   local_id  (UUID v4, generated on device, immutable, never reused)     │
//! │   remote_id (assigned by the backend, known only after first push)      │
//! │                                                                         │
//! │   The two keys are joined through the identity map, never by            │
//! │   rewriting a single id column in place.                                │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::table::EntityTable;

/// Opaque domain fields of a record.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// A row of the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRecord {
    /// Table the row belongs to.
    pub table: EntityTable,
    /// Primary key of the row.
    pub local_id: String,
    /// Backend id, present once the remote accepted the record.
    pub remote_id: Option<String>,
    /// Milliseconds; advanced on every local or remote-applied mutation.
    pub updated_at: i64,
    /// Domain fields. Foreign keys hold local ids.
    pub payload: Payload,
}

/// A record as listed by the remote backend.
///
/// Foreign keys in `payload` hold remote ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteRecord {
    pub remote_id: String,
    pub updated_at: i64,
    #[serde(default)]
    pub payload: Payload,
    /// Tombstone marker.
    #[serde(default)]
    pub deleted: bool,
}

/// Generates a fresh local identifier.
pub fn new_local_id() -> String {
    Uuid::new_v4().to_string()
}

/// Next `updated_at` for a row: the wall clock, but never behind the
/// previous value.
pub fn next_updated_at(previous: Option<i64>, now_ms: i64) -> i64 {
    match previous {
        Some(prev) if prev >= now_ms => prev + 1,
        _ => now_ms,
    }
}

/// Merges `patch` into `base`, last value per field wins.
pub fn merge_payload(base: &mut Payload, patch: &Payload) {
    for (field, value) in patch {
        base.insert(field.clone(), value.clone());
    }
}

/// Parses a stored JSON payload.
pub fn parse_payload(raw: &str) -> CoreResult<Payload> {
    match serde_json::from_str::<serde_json::Value>(raw)? {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(CoreError::InvalidPayload(format!(
            "expected a JSON object, got {}",
            other
        ))),
    }
}

/// Reads a foreign-key field as an id string.
///
/// Returns `None` for a missing or null field.
pub fn reference(payload: &Payload, field: &str) -> CoreResult<Option<String>> {
    match payload.get(field) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(id)) => Ok(Some(id.clone())),
        Some(other) => Err(CoreError::InvalidPayload(format!(
            "{} must be a string id, got {}",
            field, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(value: serde_json::Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_next_updated_at_is_monotonic() {
        assert_eq!(next_updated_at(None, 1_000), 1_000);
        assert_eq!(next_updated_at(Some(900), 1_000), 1_000);
        assert_eq!(next_updated_at(Some(1_000), 1_000), 1_001);
        assert_eq!(next_updated_at(Some(5_000), 1_000), 5_001);
    }

    #[test]
    fn test_merge_last_value_wins() {
        let mut base = payload(json!({ "name": "Push A", "reps": 8 }));
        merge_payload(&mut base, &payload(json!({ "reps": 10, "rpe": 8 })));
        assert_eq!(base, payload(json!({ "name": "Push A", "reps": 10, "rpe": 8 })));
    }

    #[test]
    fn test_parse_payload_rejects_non_objects() {
        assert!(parse_payload("{\"a\":1}").is_ok());
        assert!(matches!(parse_payload("[1,2]"), Err(CoreError::InvalidPayload(_))));
    }

    #[test]
    fn test_reference_reads_string_ids() {
        let p = payload(json!({ "dayId": "d-1", "schemaId": null, "bad": 3 }));
        assert_eq!(reference(&p, "dayId").unwrap(), Some("d-1".to_string()));
        assert_eq!(reference(&p, "schemaId").unwrap(), None);
        assert_eq!(reference(&p, "missing").unwrap(), None);
        assert!(reference(&p, "bad").is_err());
    }

    #[test]
    fn test_local_ids_are_unique() {
        assert_ne!(new_local_id(), new_local_id());
    }
}
