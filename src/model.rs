use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

pub type Timestamp = DateTime<Utc>;

/// Declared type of a configuration value. The core treats the bytes as
/// opaque; the type travels with the entry for the benefit of consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    String,
    Integer,
    Float,
    Boolean,
    Json,
    Binary,
}

impl Default for ValueType {
    fn default() -> Self {
        ValueType::String
    }
}

/// One configuration entry. Exactly one of `value` / `blob_id` is set:
/// inline values carry their bytes, blob-backed values carry a
/// content-addressed reference into the blob store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub namespace: String,
    pub key: String,
    pub value: Option<Vec<u8>>,
    pub blob_id: Option<String>,
    pub value_type: ValueType,
    /// Monotonic per `(namespace, key)`, incremented by 1 per apply.
    pub version: u64,
    pub updated_at: Timestamp,
    pub updated_by: String,
}

impl ConfigEntry {
    pub fn is_blob_backed(&self) -> bool {
        self.blob_id.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    pub path: String,
    pub description: String,
    pub owner: String,
    /// Preserved across updates of the namespace record.
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Config,
    Namespace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditVerb {
    Created,
    Updated,
    Deleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditAction {
    pub resource: ResourceType,
    pub verb: AuditVerb,
}

/// An audit trail record. The id is deterministic over
/// `(timestamp, namespace, key)` so replaying a committed entry upserts the
/// same logical event instead of duplicating it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub timestamp: Timestamp,
    pub action: AuditAction,
    pub actor: String,
    pub namespace: String,
    pub key: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
}

impl AuditEvent {
    /// Deterministic id. The verb is deliberately excluded: a replay that
    /// transitions `created` to `updated` must collapse into one event.
    pub fn deterministic_id(timestamp: Timestamp, namespace: &str, key: &str) -> Uuid {
        let mut hasher = Sha256::new();
        hasher.update(timestamp.timestamp_micros().to_be_bytes());
        hasher.update([0u8]);
        hasher.update(namespace.as_bytes());
        hasher.update([0u8]);
        hasher.update(key.as_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Uuid::from_bytes(bytes)
    }
}

/// Bounded human-readable rendering of a value for audit rows. Blob-backed
/// values never store their bytes in the audit trail.
pub fn audit_value_preview(entry: &ConfigEntry) -> Option<String> {
    const PREVIEW_CAP: usize = 256;
    if let Some(blob_id) = &entry.blob_id {
        return Some(format!("blob:{blob_id}"));
    }
    entry.value.as_ref().map(|bytes| {
        let shown = &bytes[..bytes.len().min(PREVIEW_CAP)];
        let mut preview = String::from_utf8_lossy(shown).into_owned();
        if bytes.len() > PREVIEW_CAP {
            preview.push_str(&format!("… ({} bytes)", bytes.len()));
        }
        preview
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn audit_id_is_deterministic_and_verb_independent() {
        let ts = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let a = AuditEvent::deterministic_id(ts, "prod", "timeout");
        let b = AuditEvent::deterministic_id(ts, "prod", "timeout");
        assert_eq!(a, b);
    }

    #[test]
    fn audit_id_varies_with_inputs() {
        let ts = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let base = AuditEvent::deterministic_id(ts, "prod", "timeout");
        assert_ne!(base, AuditEvent::deterministic_id(ts, "prod", "retries"));
        assert_ne!(base, AuditEvent::deterministic_id(ts, "staging", "timeout"));
        let later = ts + chrono::Duration::microseconds(1);
        assert_ne!(base, AuditEvent::deterministic_id(later, "prod", "timeout"));
    }

    #[test]
    fn preview_caps_long_inline_values() {
        let entry = ConfigEntry {
            namespace: "ns".into(),
            key: "k".into(),
            value: Some(vec![b'x'; 1000]),
            blob_id: None,
            value_type: ValueType::Binary,
            version: 1,
            updated_at: Utc::now(),
            updated_by: "test".into(),
        };
        let preview = audit_value_preview(&entry).unwrap();
        assert!(preview.contains("1000 bytes"));
        assert!(preview.len() < 300);
    }

    #[test]
    fn preview_of_blob_entry_is_reference_only() {
        let entry = ConfigEntry {
            namespace: "ns".into(),
            key: "k".into(),
            value: None,
            blob_id: Some("ab".repeat(32)),
            value_type: ValueType::Binary,
            version: 3,
            updated_at: Utc::now(),
            updated_by: "test".into(),
        };
        assert_eq!(
            audit_value_preview(&entry).unwrap(),
            format!("blob:{}", "ab".repeat(32))
        );
    }
}
