use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A record body: a JSON object of field name to value.
pub type Document = Map<String, Value>;

/// Version stamp of a remote document as last observed locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordVersion {
    pub version: String,
    /// Remote last-modified time, unix millis
    pub modified_at: Option<i64>,
}

/// Milliseconds since the unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Shallow field-by-field merge; fields in `patch` win.
pub fn merge_fields(target: &mut Document, patch: &Document) {
    for (key, value) in patch {
        target.insert(key.clone(), value.clone());
    }
}

/// Convert a JSON value into a `Document`, rejecting non-objects.
pub fn into_document(value: Value) -> Option<Document> {
    match value {
        Value::Object(map) => Some(map),
        Value::Null => Some(Map::new()),
        _ => None,
    }
}
