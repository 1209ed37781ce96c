use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DatError, Result};

/// How a source reads a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadSyncMode {
    #[default]
    #[serde(alias = "FULL_REFRESH")]
    FullRefresh,
    #[serde(alias = "INCREMENTAL")]
    Incremental,
}

/// How a destination reconciles a stream's records with what it already
/// holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteSyncMode {
    #[default]
    #[serde(alias = "APPEND")]
    Append,
    #[serde(alias = "UPSERT")]
    Upsert,
    #[serde(alias = "REPLACE")]
    Replace,
}

impl fmt::Display for WriteSyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Append => "append",
            Self::Upsert => "upsert",
            Self::Replace => "replace",
        })
    }
}

/// Identity of a stream within a run: `(namespace, stream name)`.
///
/// A missing namespace is the empty string, so a stream declared without
/// one and a record that carries none resolve to the same key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamKey {
    pub namespace: String,
    pub stream: String,
}

impl StreamKey {
    pub fn new(namespace: impl Into<String>, stream: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            stream: stream.into(),
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.stream)
        } else {
            write!(f, "{}/{}", self.namespace, self.stream)
        }
    }
}

/// A stream as declared by a source at discover time and configured by the
/// user for a run.
///
/// The declared half (`json_schema`, `supported_sync_modes`,
/// `default_cursor_field`) comes from the connector; the configured half
/// (`read_sync_mode`, `write_sync_mode`, `cursor_field`, `upsert_keys`) is
/// filled in by whoever writes the catalog for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatDocumentStream {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_schema: Option<Value>,
    #[serde(default)]
    pub supported_sync_modes: Vec<ReadSyncMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_cursor_field: Option<String>,
    #[serde(default)]
    pub read_sync_mode: ReadSyncMode,
    #[serde(default)]
    pub write_sync_mode: WriteSyncMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor_field: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upsert_keys: Vec<String>,
}

impl DatDocumentStream {
    /// A full-refresh, append-mode stream with no namespace.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: None,
            json_schema: None,
            supported_sync_modes: vec![ReadSyncMode::FullRefresh],
            default_cursor_field: None,
            read_sync_mode: ReadSyncMode::FullRefresh,
            write_sync_mode: WriteSyncMode::Append,
            cursor_field: None,
            upsert_keys: Vec::new(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn incremental(mut self, cursor_field: impl Into<String>) -> Self {
        self.read_sync_mode = ReadSyncMode::Incremental;
        self.cursor_field = Some(cursor_field.into());
        if !self.supported_sync_modes.contains(&ReadSyncMode::Incremental) {
            self.supported_sync_modes.push(ReadSyncMode::Incremental);
        }
        self
    }

    pub fn with_write_mode(mut self, mode: WriteSyncMode) -> Self {
        self.write_sync_mode = mode;
        self
    }

    pub fn with_upsert_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.upsert_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn key(&self) -> StreamKey {
        StreamKey::new(self.namespace.clone().unwrap_or_default(), self.name.clone())
    }

    /// Key under which this stream's checkpoint state is persisted.
    ///
    /// State is partitioned by namespace; a stream without a namespace
    /// falls back to its own name.
    pub fn state_key(&self) -> &str {
        self.namespace.as_deref().unwrap_or(&self.name)
    }

    /// The configured cursor field, else the connector's default.
    pub fn effective_cursor_field(&self) -> Option<&str> {
        self.cursor_field
            .as_deref()
            .or(self.default_cursor_field.as_deref())
    }

    /// Check the configured half against the required-iff rules.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(DatError::Configuration(
                "document stream name must not be empty".into(),
            ));
        }
        if self.read_sync_mode == ReadSyncMode::Incremental
            && self.effective_cursor_field().is_none()
        {
            return Err(DatError::Configuration(format!(
                "stream '{}' is incremental but has no cursor_field",
                self.key()
            )));
        }
        if self.write_sync_mode == WriteSyncMode::Upsert && self.upsert_keys.is_empty() {
            return Err(DatError::Configuration(format!(
                "stream '{}' uses upsert but has no upsert_keys",
                self.key()
            )));
        }
        Ok(())
    }
}

/// The set of streams a connector declares, or a user configures for a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatCatalog {
    pub document_streams: Vec<DatDocumentStream>,
}

impl DatCatalog {
    pub fn new(document_streams: Vec<DatDocumentStream>) -> Self {
        Self { document_streams }
    }

    pub fn find(&self, key: &StreamKey) -> Option<&DatDocumentStream> {
        self.document_streams.iter().find(|s| &s.key() == key)
    }

    /// Validate every stream and reject duplicate keys.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::BTreeSet::new();
        for stream in &self.document_streams {
            stream.validate()?;
            if !seen.insert(stream.key()) {
                return Err(DatError::Configuration(format!(
                    "stream '{}' appears more than once in the catalog",
                    stream.key()
                )));
            }
        }
        Ok(())
    }
}
