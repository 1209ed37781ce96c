use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::catalog::DatDocumentStream;

/// Lifecycle position of a stream within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamStatus {
    Started,
    Running,
    Completed,
}

/// Checkpoint for a stream: opaque cursor data plus where the stream was
/// in its lifecycle when the checkpoint was taken.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamState {
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_status: Option<StreamStatus>,
}

impl StreamState {
    /// The state of a stream that has never been persisted.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_status(data: Map<String, Value>, status: StreamStatus) -> Self {
        Self {
            data,
            stream_status: Some(status),
        }
    }

    /// `{cursor_field: cursor_value}`, or `{}` when there is no cursor.
    pub fn cursor_data(cursor_field: Option<&str>, cursor_value: Option<&Value>) -> Map<String, Value> {
        let mut data = Map::new();
        if let (Some(field), Some(value)) = (cursor_field, cursor_value) {
            data.insert(field.to_string(), value.clone());
        }
        data
    }

    pub fn cursor_value(&self, cursor_field: &str) -> Option<&Value> {
        self.data.get(cursor_field).filter(|v| !v.is_null())
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A `STATE` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatStateMessage {
    pub stream: DatDocumentStream,
    pub stream_state: StreamState,
}

impl DatStateMessage {
    pub fn status(&self) -> Option<StreamStatus> {
        self.stream_state.stream_status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_uses_uppercase_wire_names() {
        let state = StreamState::with_status(Map::new(), StreamStatus::Completed);
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json, json!({"data": {}, "stream_status": "COMPLETED"}));
    }

    #[test]
    fn cursor_data_needs_field_and_value() {
        let value = json!(42);
        assert_eq!(
            StreamState::cursor_data(Some("ts"), Some(&value)),
            json!({"ts": 42}).as_object().cloned().unwrap()
        );
        assert!(StreamState::cursor_data(Some("ts"), None).is_empty());
        assert!(StreamState::cursor_data(None, Some(&value)).is_empty());
    }

    #[test]
    fn null_cursor_counts_as_absent() {
        let state: StreamState = serde_json::from_value(json!({"data": {"ts": null}})).unwrap();
        assert!(state.cursor_value("ts").is_none());
        assert!(state.stream_status.is_none());
    }
}
