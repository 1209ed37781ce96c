//! Configuration loading.
//!
//! Three kinds of files are read here:
//!
//! - **connector configs** (`--config` on every per-stage command): a
//!   [`ConnectorSpecification`] naming the connector and carrying its
//!   `connectionSpecification` settings, as TOML or JSON;
//! - **catalogs** (`--catalog`): a JSON [`DatCatalog`], or the `CATALOG`
//!   envelope `dat discover` prints;
//! - **pipeline configs** (`dat run --config`): TOML wiring a source, a
//!   generator and a destination together with orchestration settings.
//!
//! # Pipeline example
//!
//! ```toml
//! [source]
//! name = "filesystem"
//! [source.connectionSpecification]
//! root = "./docs"
//!
//! [generator]
//! name = "hash"
//! [generator.connectionSpecification]
//! dims = 64
//!
//! [destination]
//! name = "sqlite"
//! [destination.connectionSpecification]
//! path = "./data/vectors.sqlite"
//!
//! [pipeline]
//! channel_capacity = 64
//! write_timeout_secs = 300
//!
//! [state]
//! dir = "./data/state"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use dat_core::protocol::{ConnectorSpecification, DatCatalog, StreamState};

/// Load a connector configuration. `.toml` files are parsed as TOML,
/// anything else as JSON.
pub fn load_connector_config(path: &Path) -> Result<ConnectorSpecification> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: ConnectorSpecification = if is_toml(path) {
        toml::from_str(&content).with_context(|| "Failed to parse connector config (TOML)")?
    } else {
        serde_json::from_str(&content).with_context(|| "Failed to parse connector config (JSON)")?
    };

    if config.name.trim().is_empty() {
        bail!("connector config must name a connector");
    }
    Ok(config)
}

/// Load and validate a catalog file. Accepts a bare catalog or a
/// `CATALOG` envelope.
pub fn load_catalog(path: &Path) -> Result<DatCatalog> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read catalog file: {}", path.display()))?;
    let mut value: serde_json::Value =
        serde_json::from_str(&content).with_context(|| "Failed to parse catalog file")?;
    if value.get("type").and_then(serde_json::Value::as_str) == Some("CATALOG") {
        value = value
            .get_mut("catalog")
            .map(serde_json::Value::take)
            .with_context(|| "CATALOG envelope has no catalog payload")?;
    }
    let catalog: DatCatalog =
        serde_json::from_value(value).with_context(|| "Failed to parse catalog file")?;
    if catalog.document_streams.is_empty() {
        bail!("catalog {} configures no streams", path.display());
    }
    Ok(catalog)
}

/// Load a `--state` file: a JSON map of state key to [`StreamState`].
pub fn load_state_file(path: &Path) -> Result<HashMap<String, StreamState>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read state file: {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| "Failed to parse state file")
}

fn is_toml(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false)
}

/// A source → generator → destination pipeline.
#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    pub source: ConnectorSpecification,
    pub generator: ConnectorSpecification,
    pub destination: ConnectorSpecification,
    /// Catalog file; when absent the source's discovered catalog is used.
    #[serde(default)]
    pub catalog: Option<PathBuf>,
    #[serde(default)]
    pub pipeline: PipelineSettings,
    #[serde(default)]
    pub state: StateSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineSettings {
    /// Records per destination flush. Overrides the destination's own
    /// `batch_size` setting when present.
    #[serde(default)]
    pub batch_size: Option<usize>,
    /// Capacity of each inter-stage channel.
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Records handed to the generator per call.
    #[serde(default = "default_generator_batch_size")]
    pub generator_batch_size: usize,
    /// Envelopes the destination stage buffers before a write.
    #[serde(default = "default_max_len_rows_buffer")]
    pub max_len_rows_buffer: usize,
    /// Upper bound on a single destination write.
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
    /// Retries for transient loader failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            batch_size: None,
            channel_capacity: default_channel_capacity(),
            generator_batch_size: default_generator_batch_size(),
            max_len_rows_buffer: default_max_len_rows_buffer(),
            write_timeout_secs: default_write_timeout_secs(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

fn default_channel_capacity() -> usize {
    64
}
fn default_generator_batch_size() -> usize {
    16
}
fn default_max_len_rows_buffer() -> usize {
    100
}
fn default_write_timeout_secs() -> u64 {
    300
}
fn default_max_retries() -> u32 {
    5
}
fn default_retry_base_delay_ms() -> u64 {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateSettings {
    /// Directory holding one `.<namespace>/stream_state.json` per namespace.
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,
}

impl Default for StateSettings {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".")
}

impl PipelineSettings {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == Some(0) {
            bail!("pipeline.batch_size must be > 0");
        }
        if self.channel_capacity == 0 {
            bail!("pipeline.channel_capacity must be > 0");
        }
        if self.generator_batch_size == 0 {
            bail!("pipeline.generator_batch_size must be > 0");
        }
        if self.max_len_rows_buffer == 0 {
            bail!("pipeline.max_len_rows_buffer must be > 0");
        }
        if self.write_timeout_secs == 0 {
            bail!("pipeline.write_timeout_secs must be > 0");
        }
        Ok(())
    }
}

pub fn load_pipeline_config(path: &Path) -> Result<PipelineConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read pipeline config: {}", path.display()))?;

    let mut config: PipelineConfig =
        toml::from_str(&content).with_context(|| "Failed to parse pipeline config")?;

    config.pipeline.validate()?;

    // Relative catalog paths resolve against the pipeline file.
    if let (Some(catalog), Some(parent)) = (config.catalog.as_ref(), path.parent()) {
        if catalog.is_relative() {
            config.catalog = Some(parent.join(catalog));
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_temp(suffix: &str, content: &str) -> NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn connector_config_reads_toml_and_json() {
        let toml_file = write_temp(
            ".toml",
            "name = \"filesystem\"\n[connectionSpecification]\nroot = \"/tmp/docs\"\n",
        );
        let cfg = load_connector_config(toml_file.path()).unwrap();
        assert_eq!(cfg.name, "filesystem");
        assert_eq!(cfg.setting_str("root"), Some("/tmp/docs"));

        let json_file = write_temp(
            ".json",
            r#"{"name": "hash", "connectionSpecification": {"dims": 8}}"#,
        );
        let cfg = load_connector_config(json_file.path()).unwrap();
        assert_eq!(cfg.name, "hash");
        assert_eq!(cfg.setting("dims").and_then(|v| v.as_u64()), Some(8));
    }

    #[test]
    fn connector_config_requires_name() {
        let file = write_temp(".json", r#"{"name": "  "}"#);
        assert!(load_connector_config(file.path()).is_err());
    }

    #[test]
    fn pipeline_defaults_apply() {
        let file = write_temp(
            ".toml",
            r#"
[source]
name = "filesystem"
[generator]
name = "hash"
[destination]
name = "sqlite"
"#,
        );
        let cfg = load_pipeline_config(file.path()).unwrap();
        assert_eq!(cfg.pipeline.channel_capacity, 64);
        assert_eq!(cfg.pipeline.max_len_rows_buffer, 100);
        assert_eq!(cfg.state.dir, PathBuf::from("."));
        assert!(cfg.catalog.is_none());
    }

    #[test]
    fn pipeline_rejects_zero_sizes() {
        let file = write_temp(
            ".toml",
            r#"
[source]
name = "filesystem"
[generator]
name = "hash"
[destination]
name = "sqlite"
[pipeline]
channel_capacity = 0
"#,
        );
        let err = load_pipeline_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("channel_capacity"));
    }

    #[test]
    fn catalog_must_have_streams() {
        let file = write_temp(".json", r#"{"document_streams": []}"#);
        assert!(load_catalog(file.path()).is_err());

        let file = write_temp(".json", r#"{"document_streams": [{"name": "files"}]}"#);
        assert_eq!(load_catalog(file.path()).unwrap().document_streams.len(), 1);
    }

    #[test]
    fn catalog_accepts_discover_envelope() {
        let envelope = dat_core::codec::encode_line(&dat_core::DatMessage::catalog(
            DatCatalog::new(vec![dat_core::DatDocumentStream::new("files")]),
        ))
        .unwrap();
        let file = write_temp(".json", &envelope);
        let catalog = load_catalog(file.path()).unwrap();
        assert_eq!(catalog.document_streams[0].name, "files");

        let file = write_temp(".json", r#"{"type": "CATALOG"}"#);
        assert!(load_catalog(file.path()).is_err());
    }
}
