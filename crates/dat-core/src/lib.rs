//! # dat core
//!
//! Runtime-agnostic protocol and synchronization engine for `dat`.
//!
//! This crate contains no tokio, sqlx, or filesystem I/O. Concrete
//! connectors, the file-backed state manager, and the concurrent pipeline
//! orchestrator live in the `dat` application crate.
//!
//! ```text
//! ┌──────────────┐  envelopes  ┌───────────┐  envelopes  ┌───────────────┐
//! │ SourceRunner │────────────▶│ Generator │────────────▶│ DataProcessor │──▶ Loader
//! │  (Streams)   │             │ (vectors) │             │  (batching)   │
//! └──────┬───────┘             └───────────┘             └───────────────┘
//!        │ checkpoints
//!        ▼
//!  StateManager
//! ```
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`protocol`] | Envelope, catalog, record, and state types (the wire format) |
//! | [`codec`] | Newline-delimited JSON framing with malformed-line recovery |
//! | [`connector`] | `Connector` identity and the `Checkable` capability |
//! | [`error`] | [`DatError`] and transient-failure classification |
//! | [`state`] | [`StateManager`](state::StateManager) contract and in-memory manager |
//! | [`stream`] | [`Stream`](stream::Stream) capability and cursor extraction |
//! | [`source`] | Source capabilities and the incremental-read [`SourceRunner`](source::SourceRunner) |
//! | [`generator`] | Embedding [`Generator`](generator::Generator) capability |
//! | [`loader`] | Destination [`Loader`](loader::Loader) capability and metadata filters |
//! | [`processor`] | Destination batching and write-mode reconciliation |

pub mod codec;
pub mod connector;
pub mod error;
pub mod generator;
pub mod loader;
pub mod processor;
pub mod protocol;
pub mod source;
pub mod state;
pub mod stream;

pub use error::{DatError, Result};
pub use protocol::{
    DatCatalog, DatDocumentMessage, DatDocumentStream, DatMessage, MessageType, ReadSyncMode,
    StreamState, StreamStatus, WriteSyncMode,
};
