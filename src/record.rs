//! Purpose: Define a stable, structured schema for per-session event records.
//! Exports: `SessionRecord`, `record_json`.
//! Role: Shared contract helper for CLI output describing opens, commands, and closes.
//! Invariants: Records are diagnostic only; no gate behavior depends on them.
//! Invariants: JSON schema is stable once published; fields are additive-only.
use serde_json::{Map, Value, json};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub kind: String,
    pub time: String,
    pub device: String,
    pub comm: String,
    pub pid: u32,
    pub message: String,
    pub details: Map<String, Value>,
}

pub fn record_json(record: &SessionRecord) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(record.kind));
    inner.insert("time".to_string(), json!(record.time));
    inner.insert("device".to_string(), json!(record.device));
    inner.insert("comm".to_string(), json!(record.comm));
    inner.insert("pid".to_string(), json!(record.pid));
    inner.insert("message".to_string(), json!(record.message));
    inner.insert("details".to_string(), Value::Object(record.details.clone()));

    let mut outer = Map::new();
    outer.insert("record".to_string(), Value::Object(inner));
    Value::Object(outer)
}

#[cfg(test)]
mod tests {
    use super::{SessionRecord, record_json};
    use serde_json::{Map, Value};

    #[test]
    fn record_json_has_required_fields() {
        let mut details = Map::new();
        details.insert("code".to_string(), Value::from(0));

        let record = SessionRecord {
            kind: "command".to_string(),
            time: "2026-02-01T00:00:00Z".to_string(),
            device: "customdevice".to_string(),
            comm: "python".to_string(),
            pid: 4242,
            message: "command issued".to_string(),
            details,
        };

        let value = record_json(&record);
        let obj = value
            .get("record")
            .and_then(|v| v.as_object())
            .expect("record object");

        assert_eq!(obj.get("kind").and_then(|v| v.as_str()), Some("command"));
        assert_eq!(
            obj.get("time").and_then(|v| v.as_str()),
            Some("2026-02-01T00:00:00Z")
        );
        assert_eq!(
            obj.get("device").and_then(|v| v.as_str()),
            Some("customdevice")
        );
        assert_eq!(obj.get("comm").and_then(|v| v.as_str()), Some("python"));
        assert_eq!(obj.get("pid").and_then(|v| v.as_u64()), Some(4242));
        assert!(obj.get("details").and_then(|v| v.as_object()).is_some());
    }
}
