//! The per-connector stream capability.

use serde_json::Value;

use crate::protocol::{DatCatalog, DatDocumentMessage, DatDocumentStream, ReadSyncMode};

/// Lazy, finite, non-restartable sequence of records produced by a stream.
///
/// An `Err` item is terminal: the runner stops pulling and aborts the read.
pub type RecordIter = Box<dyn Iterator<Item = anyhow::Result<DatDocumentMessage>> + Send>;

/// A readable stream exposed by a source connector.
///
/// Implementations must be deterministic for a given cursor value, and a
/// stream that supports [`ReadSyncMode::Incremental`] must yield records in
/// nondecreasing cursor order.
pub trait Stream: Send + Sync {
    /// Stream name, unique within the source's catalog.
    fn name(&self) -> &str;

    /// JSON schema of the documents this stream produces.
    fn json_schema(&self) -> Value {
        serde_json::json!({"type": "object"})
    }

    fn supported_sync_modes(&self) -> Vec<ReadSyncMode> {
        vec![ReadSyncMode::FullRefresh]
    }

    /// Cursor field used when a configured stream doesn't name one.
    fn default_cursor_field(&self) -> Option<&str> {
        None
    }

    /// Emit a checkpoint at least every this many records. `None`
    /// checkpoints on cursor changes only.
    fn state_checkpoint_interval(&self) -> Option<usize> {
        None
    }

    /// Start reading. `cursor_value` is `None` for a full read, or the last
    /// checkpointed cursor for an incremental continuation.
    fn read_records(
        &self,
        catalog: &DatCatalog,
        configured: &DatDocumentStream,
        cursor_value: Option<Value>,
    ) -> anyhow::Result<RecordIter>;

    /// The stream as it appears in a discovered catalog.
    fn as_document_stream(&self) -> DatDocumentStream {
        let mut stream = DatDocumentStream::new(self.name());
        stream.json_schema = Some(self.json_schema());
        stream.supported_sync_modes = self.supported_sync_modes();
        stream.default_cursor_field = self.default_cursor_field().map(str::to_string);
        stream
    }
}

/// Cursor value of a record: the data payload's field first, then the
/// metadata field of the same name.
pub fn extract_cursor(record: &DatDocumentMessage, cursor_field: &str) -> Option<Value> {
    record.field(cursor_field)
}
