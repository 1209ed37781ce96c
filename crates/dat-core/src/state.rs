//! Checkpoint persistence.
//!
//! A [`StateManager`] stores one [`StreamState`] per key, where the key is a
//! stream's namespace (see [`DatDocumentStream::state_key`]). Each key is
//! expected to have a single writer; concurrent runs against the same
//! namespace race and the last save wins.
//!
//! [`DatDocumentStream::state_key`]: crate::protocol::DatDocumentStream::state_key

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Result;

use crate::protocol::StreamState;

/// Persists and retrieves per-stream checkpoints across runs.
///
/// Calls are synchronous: the source runner is a pull-driven iterator and
/// checkpoints are small.
pub trait StateManager: Send + Sync {
    /// Overwrite the state for `key`.
    fn save(&self, key: &str, state: &StreamState) -> Result<()>;

    /// The last saved state, or [`StreamState::empty`] if none was saved.
    fn get(&self, key: &str) -> Result<StreamState>;

    /// Forget the state for `key`. Removing a missing key is not an error.
    fn cleanup(&self, key: &str) -> Result<()>;
}

/// A [`StateManager`] backed by a map, for tests and single-process runs
/// that don't need to resume.
#[derive(Debug, Default)]
pub struct InMemoryStateManager {
    states: RwLock<HashMap<String, StreamState>>,
}

impl InMemoryStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently holding state.
    pub fn len(&self) -> usize {
        self.states.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StateManager for InMemoryStateManager {
    fn save(&self, key: &str, state: &StreamState) -> Result<()> {
        self.states
            .write()
            .expect("lock poisoned")
            .insert(key.to_string(), state.clone());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<StreamState> {
        Ok(self
            .states
            .read()
            .expect("lock poisoned")
            .get(key)
            .cloned()
            .unwrap_or_else(StreamState::empty))
    }

    fn cleanup(&self, key: &str) -> Result<()> {
        self.states.write().expect("lock poisoned").remove(key);
        Ok(())
    }
}
