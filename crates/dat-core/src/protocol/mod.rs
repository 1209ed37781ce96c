//! The envelope model exchanged between pipeline stages.
//!
//! Every line on a stage's stdin/stdout is one [`DatMessage`]: a value
//! tagged by `type` whose single populated payload matches the tag. Field
//! names and enum spellings here are the wire format and must not drift.

mod catalog;
mod message;
mod record;
mod state;

pub use catalog::{DatCatalog, DatDocumentStream, ReadSyncMode, StreamKey, WriteSyncMode};
pub use message::{
    ConnectorSpecification, DatConnectionStatus, DatErrorTrace, DatLogMessage, DatMessage,
    DatTraceMessage, LogLevel, MessageType, Status, TraceType,
};
pub use record::{now_millis, Data, DatDocumentMessage, StreamMetadata};
pub use state::{DatStateMessage, StreamState, StreamStatus};
