use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::catalog::{DatDocumentStream, StreamKey};

/// Milliseconds since the Unix epoch, the unit of `emitted_at`.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Provenance carried by every record from source to destination.
///
/// The `dat_*` fields are the ones destinations filter on; anything else a
/// source wants to keep travels in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamMetadata {
    #[serde(default)]
    pub dat_source: String,
    #[serde(default)]
    pub dat_stream: String,
    #[serde(default)]
    pub dat_document_entity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dat_record_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dat_run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dat_last_modified: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StreamMetadata {
    /// Look up a metadata field by its wire name.
    pub fn field(&self, name: &str) -> Option<Value> {
        let non_empty = |s: &String| (!s.is_empty()).then(|| Value::String(s.clone()));
        match name {
            "dat_source" => non_empty(&self.dat_source),
            "dat_stream" => non_empty(&self.dat_stream),
            "dat_document_entity" => non_empty(&self.dat_document_entity),
            "dat_record_id" => self.dat_record_id.clone().map(Value::String),
            "dat_run_id" => self.dat_run_id.clone().map(Value::String),
            "dat_last_modified" => self.dat_last_modified.map(Value::from),
            other => self.extra.get(other).cloned(),
        }
    }
}

/// A record's payload: the chunk text, its vectors once a generator has
/// run, and the provenance metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Data {
    #[serde(default)]
    pub document_chunk: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vectors: Option<Vec<f32>>,
    #[serde(default)]
    pub metadata: StreamMetadata,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Data {
    pub fn new(document_chunk: impl Into<String>, metadata: StreamMetadata) -> Self {
        Self {
            document_chunk: document_chunk.into(),
            vectors: None,
            metadata,
            extra: Map::new(),
        }
    }

    /// Look up a top-level payload field. `metadata` itself is not a
    /// candidate; use [`StreamMetadata::field`] for that.
    pub fn field(&self, name: &str) -> Option<Value> {
        match name {
            "document_chunk" => Some(Value::String(self.document_chunk.clone())),
            "vectors" => self
                .vectors
                .as_ref()
                .and_then(|v| serde_json::to_value(v).ok()),
            "metadata" => None,
            other => self.extra.get(other).cloned(),
        }
    }
}

/// A `RECORD` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatDocumentMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub stream: DatDocumentStream,
    pub data: Data,
    #[serde(default)]
    pub emitted_at: i64,
}

impl DatDocumentMessage {
    pub fn new(stream: DatDocumentStream, data: Data) -> Self {
        Self {
            namespace: stream.namespace.clone(),
            stream,
            data,
            emitted_at: now_millis(),
        }
    }

    /// The `(namespace, stream)` this record belongs to. The record's own
    /// namespace wins over the one on its stream reference.
    pub fn key(&self) -> StreamKey {
        let namespace = self
            .namespace
            .clone()
            .or_else(|| self.stream.namespace.clone())
            .unwrap_or_default();
        StreamKey::new(namespace, self.stream.name.clone())
    }

    /// A named value from the data payload, falling back to metadata.
    /// Nulls count as absent.
    pub fn field(&self, name: &str) -> Option<Value> {
        self.data
            .field(name)
            .filter(|v| !v.is_null())
            .or_else(|| self.data.metadata.field(name))
            .filter(|v| !v.is_null())
    }

    /// Identity used for dedup: `dat_record_id`, else the chunk text.
    pub fn record_id(&self) -> String {
        self.data
            .metadata
            .dat_record_id
            .clone()
            .unwrap_or_else(|| self.data.document_chunk.clone())
    }
}
