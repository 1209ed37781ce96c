//! # dat
//!
//! Sync documents from sources, through embedding generators, into vector
//! destinations. Stages talk newline-delimited JSON envelopes, so they can
//! run as separate processes joined by pipes or in one process under
//! [`orchestrator::PipelineOrchestrator`].
//!
//! The protocol types and the sync engine live in `dat_core`; this crate
//! adds configuration, the file-backed state store, the reference
//! connectors, the orchestrator, and the CLI.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  RECORD/STATE  ┌────────────┐  RECORD+vectors  ┌─────────────┐
//! │   source   │ ─────────────▶ │ generator  │ ───────────────▶ │ destination │
//! │ filesystem │                │ openai/    │                  │   sqlite    │
//! └─────┬──────┘                │ ollama/hash│                  └─────────────┘
//!       │ checkpoints           └────────────┘
//!       ▼
//!  LocalStateManager (<dir>/.<namespace>/stream_state.json)
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Connector, catalog, state and pipeline configuration files |
//! | [`logging`] | `tracing` subscriber setup (stderr) |
//! | [`state_file`] | File-backed [`StateManager`](dat_core::state::StateManager) |
//! | [`registry`] | Name → connector constructors, per role |
//! | [`connector_fs`] | Filesystem source |
//! | [`chunk`] | Paragraph-aware text chunking |
//! | [`embedding`] | OpenAI, Ollama and hash embedding generators |
//! | [`sqlite_loader`] | SQLite vector destination |
//! | [`db`] | SQLite connection pool |
//! | [`migrate`] | Vector table schema |
//! | [`retry`] | Backoff policy and retrying loader |
//! | [`orchestrator`] | In-process concurrent pipeline |
//! | [`commands`] | CLI command implementations |

pub mod chunk;
pub mod commands;
pub mod config;
pub mod connector_fs;
pub mod db;
pub mod embedding;
pub mod logging;
pub mod migrate;
pub mod orchestrator;
pub mod registry;
pub mod retry;
pub mod sqlite_loader;
pub mod state_file;
