//! File-backed checkpoint store.
//!
//! Each state key gets its own directory under the state root:
//!
//! ```text
//! <dir>/.<key>/stream_state.json
//! ```
//!
//! Keys made only of ASCII alphanumerics, `-` and `_` are used as is. Any
//! other key is cleaned to that alphabet and suffixed with `~` plus a short
//! SHA-256 of the raw key, so distinct keys never share a file.
//!
//! Writes go to a temporary sibling first and are renamed into place, so
//! a crash mid-save leaves the previous checkpoint intact.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use dat_core::protocol::StreamState;
use dat_core::state::StateManager;

const STATE_FILE: &str = "stream_state.json";

/// A [`StateManager`] that keeps one JSON file per namespace.
#[derive(Debug, Clone)]
pub struct LocalStateManager {
    dir: PathBuf,
}

impl LocalStateManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Location of the state file for `key`.
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!(".{}", sanitize(key))).join(STATE_FILE)
    }
}

fn is_plain(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}

/// Map a key to a directory name inside the state root. Injective: plain
/// keys never contain `~`, and every other key carries a digest of itself.
fn sanitize(key: &str) -> String {
    if !key.is_empty() && key.chars().all(is_plain) {
        return key.to_string();
    }
    let cleaned: String = key
        .chars()
        .map(|c| if is_plain(c) { c } else { '_' })
        .collect();
    let digest = format!("{:x}", Sha256::digest(key.as_bytes()));
    format!("{}~{}", cleaned, &digest[..16])
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create state directory: {}", parent.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, contents)
        .with_context(|| format!("Failed to write state file: {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to move state file into place: {}", path.display()))?;
    Ok(())
}

impl StateManager for LocalStateManager {
    fn save(&self, key: &str, state: &StreamState) -> Result<()> {
        let path = self.path_for(key);
        let body = serde_json::to_vec_pretty(state)?;
        write_atomic(&path, &body)?;
        tracing::debug!(key, path = %path.display(), "saved stream state");
        Ok(())
    }

    fn get(&self, key: &str) -> Result<StreamState> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(StreamState::empty());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read state file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Corrupt state file: {}", path.display()))
    }

    fn cleanup(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to remove state file: {}", path.display()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dat_core::protocol::StreamStatus;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn missing_file_reads_as_empty() {
        let tmp = TempDir::new().unwrap();
        let mgr = LocalStateManager::new(tmp.path());
        assert!(mgr.get("docs").unwrap().is_empty());
    }

    #[test]
    fn save_then_get_round_trips_and_lays_out_per_key() {
        let tmp = TempDir::new().unwrap();
        let mgr = LocalStateManager::new(tmp.path());
        let state = StreamState::with_status(
            StreamState::cursor_data(Some("dat_last_modified"), Some(&json!(42))),
            StreamStatus::Running,
        );
        mgr.save("docs", &state).unwrap();

        assert!(tmp.path().join(".docs").join("stream_state.json").exists());
        assert_eq!(mgr.get("docs").unwrap(), state);
        assert!(mgr.get("other").unwrap().is_empty());
    }

    #[test]
    fn keys_cannot_escape_the_root() {
        let mgr = LocalStateManager::new("/state");
        for key in ["../etc", "a/b", "", "."] {
            let path = mgr.path_for(key);
            let dir = path.parent().unwrap();
            assert_eq!(dir.parent().unwrap(), Path::new("/state"), "{:?}", key);
            let name = dir.file_name().unwrap().to_str().unwrap();
            assert!(name.starts_with('.') && name.contains('~'), "{}", name);
        }
        assert!(mgr
            .path_for("../etc")
            .to_str()
            .unwrap()
            .starts_with("/state/.___etc~"));
    }

    #[test]
    fn similar_keys_get_separate_files() {
        let tmp = TempDir::new().unwrap();
        let mgr = LocalStateManager::new(tmp.path());
        let state = StreamState::with_status(
            StreamState::cursor_data(Some("dat_last_modified"), Some(&json!(99))),
            StreamStatus::Completed,
        );
        mgr.save("tenant.a", &state).unwrap();

        assert!(mgr.get("tenant_a").unwrap().is_empty());
        assert_eq!(mgr.get("tenant.a").unwrap(), state);

        for (a, b) in [("a/b", "a_b"), ("tenant.a", "tenant_a"), ("", "default")] {
            assert_ne!(mgr.path_for(a), mgr.path_for(b), "{} vs {}", a, b);
        }
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let mgr = LocalStateManager::new(tmp.path());
        let path = mgr.path_for("docs");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{not json").unwrap();
        assert!(mgr.get("docs").is_err());
    }

    #[test]
    fn cleanup_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let mgr = LocalStateManager::new(tmp.path());
        mgr.save("docs", &StreamState::empty()).unwrap();
        mgr.cleanup("docs").unwrap();
        mgr.cleanup("docs").unwrap();
        assert!(mgr.get("docs").unwrap().is_empty());
    }
}
