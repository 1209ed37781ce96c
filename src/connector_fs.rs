//! Filesystem source connector.
//!
//! Walks a local directory, applies include/exclude globs, and emits one
//! record per chunk of each matching UTF-8 file on a single stream,
//! `files`.
//!
//! # Configuration
//!
//! ```toml
//! name = "filesystem"
//! [connectionSpecification]
//! root = "./docs"
//! include_globs = ["**/*.md", "**/*.txt"]
//! exclude_globs = ["**/drafts/**"]
//! chunk_size = 2800
//! namespace = "team-docs"
//! ```
//!
//! # Incremental reads
//!
//! The default cursor is `dat_last_modified`, the file's mtime in epoch
//! seconds. Files are emitted in nondecreasing mtime order (ties broken by
//! path) and a continuation returns every file with `mtime >= cursor`.
//! Files sharing the checkpointed mtime are re-read. An UPSERT destination
//! only removes duplicates within one run, so a boundary file re-read by
//! a later run is loaded again.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use walkdir::WalkDir;

use dat_core::connector::{Checkable, Connector};
use dat_core::protocol::{
    ConnectorSpecification, Data, DatCatalog, DatDocumentMessage, DatDocumentStream,
    ReadSyncMode, StreamMetadata,
};
use dat_core::source::{catalog_from_streams, Discoverable, Readable};
use dat_core::stream::{RecordIter, Stream};

use crate::chunk::chunk_text;

pub const CONNECTOR_NAME: &str = "filesystem";
pub const STREAM_NAME: &str = "files";
const CURSOR_FIELD: &str = "dat_last_modified";

/// `connectionSpecification` of the filesystem source.
#[derive(Debug, Deserialize, Clone)]
pub struct FilesystemSettings {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    /// Maximum chunk length in bytes.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default)]
    pub namespace: Option<String>,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*".to_string()]
}

fn default_chunk_size() -> usize {
    2800
}

impl FilesystemSettings {
    pub fn from_config(config: &ConnectorSpecification) -> Result<Self> {
        let settings: Self = serde_json::from_value(config.connection_specification.clone())
            .with_context(|| "Invalid filesystem connectionSpecification")?;
        if settings.chunk_size == 0 {
            bail!("filesystem.chunk_size must be > 0");
        }
        Ok(settings)
    }
}

/// The `filesystem` source.
#[derive(Debug, Default)]
pub struct FilesystemSource;

impl FilesystemSource {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for FilesystemSource {
    fn name(&self) -> &str {
        CONNECTOR_NAME
    }

    fn spec(&self) -> ConnectorSpecification {
        let mut spec = ConnectorSpecification::new(
            CONNECTOR_NAME,
            json!({
                "type": "object",
                "required": ["root"],
                "properties": {
                    "root": {"type": "string", "description": "Directory to scan"},
                    "include_globs": {"type": "array", "items": {"type": "string"}, "default": ["**/*"]},
                    "exclude_globs": {"type": "array", "items": {"type": "string"}, "default": []},
                    "follow_symlinks": {"type": "boolean", "default": false},
                    "chunk_size": {"type": "integer", "minimum": 1, "default": default_chunk_size()},
                    "namespace": {"type": "string"}
                }
            }),
        );
        spec.supports_incremental = true;
        spec
    }
}

#[async_trait]
impl Checkable for FilesystemSource {
    async fn check_connection(
        &self,
        config: &ConnectorSpecification,
    ) -> Result<(bool, Option<String>)> {
        let settings = FilesystemSettings::from_config(config)?;
        if !settings.root.is_dir() {
            return Ok((
                false,
                Some(format!(
                    "root is not a readable directory: {}",
                    settings.root.display()
                )),
            ));
        }
        build_globset(&settings.include_globs)?;
        build_globset(&settings.exclude_globs)?;
        Ok((true, None))
    }
}

#[async_trait]
impl Discoverable for FilesystemSource {
    async fn discover(&self, config: &ConnectorSpecification) -> Result<DatCatalog> {
        let settings = FilesystemSettings::from_config(config)?;
        let streams = self.streams(config)?;
        Ok(catalog_from_streams(&streams, settings.namespace.as_deref()))
    }
}

impl Readable for FilesystemSource {
    fn streams(&self, config: &ConnectorSpecification) -> Result<Vec<Arc<dyn Stream>>> {
        let settings = FilesystemSettings::from_config(config)?;
        Ok(vec![Arc::new(FilesStream::new(settings)?)])
    }
}

/// The `files` stream.
pub struct FilesStream {
    settings: FilesystemSettings,
    include: GlobSet,
    exclude: GlobSet,
}

impl FilesStream {
    pub fn new(settings: FilesystemSettings) -> Result<Self> {
        let include = build_globset(&settings.include_globs)?;

        let mut excludes = vec![
            "**/.git/**".to_string(),
            "**/target/**".to_string(),
            "**/node_modules/**".to_string(),
        ];
        excludes.extend(settings.exclude_globs.iter().cloned());
        let exclude = build_globset(&excludes)?;

        Ok(Self {
            settings,
            include,
            exclude,
        })
    }

    /// Matching files, ordered by `(mtime, relative path)`.
    fn scan(&self, min_modified: Option<i64>) -> Result<Vec<FileEntry>> {
        let root = &self.settings.root;
        if !root.exists() {
            bail!("Filesystem source root does not exist: {}", root.display());
        }

        let mut entries = Vec::new();
        for entry in WalkDir::new(root).follow_links(self.settings.follow_symlinks) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(path);
            let rel_str = relative.to_string_lossy().replace('\\', "/");

            if self.exclude.is_match(&rel_str) || !self.include.is_match(&rel_str) {
                continue;
            }

            let modified = modified_secs(path)?;
            if min_modified.is_some_and(|min| modified < min) {
                continue;
            }

            entries.push(FileEntry {
                path: path.to_path_buf(),
                relative: rel_str,
                modified,
            });
        }

        entries.sort_by(|a, b| {
            a.modified
                .cmp(&b.modified)
                .then_with(|| a.relative.cmp(&b.relative))
        });
        Ok(entries)
    }
}

impl Stream for FilesStream {
    fn name(&self) -> &str {
        STREAM_NAME
    }

    fn json_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "document_chunk": {"type": "string"},
                "metadata": {
                    "type": "object",
                    "properties": {
                        "dat_document_entity": {"type": "string"},
                        "dat_last_modified": {"type": "integer"},
                        "chunk_index": {"type": "integer"},
                        "content_hash": {"type": "string"}
                    }
                }
            }
        })
    }

    fn supported_sync_modes(&self) -> Vec<ReadSyncMode> {
        vec![ReadSyncMode::FullRefresh, ReadSyncMode::Incremental]
    }

    fn default_cursor_field(&self) -> Option<&str> {
        Some(CURSOR_FIELD)
    }

    fn read_records(
        &self,
        _catalog: &DatCatalog,
        configured: &DatDocumentStream,
        cursor_value: Option<Value>,
    ) -> Result<RecordIter> {
        let min_modified = match cursor_value {
            None => None,
            Some(v) => Some(v.as_i64().with_context(|| {
                format!("{} cursor must be an integer, got {}", CURSOR_FIELD, v)
            })?),
        };
        let files = self.scan(min_modified)?;
        tracing::debug!(
            root = %self.settings.root.display(),
            files = files.len(),
            cursor = ?min_modified,
            "filesystem scan complete"
        );

        Ok(Box::new(FileRecords {
            files: files.into_iter(),
            pending: Vec::new().into_iter(),
            stream: configured.clone(),
            chunk_size: self.settings.chunk_size,
        }))
    }
}

struct FileEntry {
    path: PathBuf,
    relative: String,
    modified: i64,
}

/// Reads and chunks one file at a time as records are pulled.
struct FileRecords {
    files: std::vec::IntoIter<FileEntry>,
    pending: std::vec::IntoIter<DatDocumentMessage>,
    stream: DatDocumentStream,
    chunk_size: usize,
}

impl FileRecords {
    fn load(&self, file: &FileEntry) -> Result<Vec<DatDocumentMessage>> {
        let bytes = std::fs::read(&file.path)
            .with_context(|| format!("Failed to read {}", file.path.display()))?;
        let Ok(text) = String::from_utf8(bytes) else {
            tracing::debug!(path = %file.relative, "skipping non-UTF-8 file");
            return Ok(Vec::new());
        };

        let records = chunk_text(&file.relative, &text, self.chunk_size)
            .into_iter()
            .map(|chunk| {
                let mut metadata = StreamMetadata {
                    dat_source: CONNECTOR_NAME.to_string(),
                    dat_stream: self.stream.name.clone(),
                    dat_document_entity: file.relative.clone(),
                    dat_record_id: Some(chunk.id),
                    dat_last_modified: Some(file.modified),
                    ..Default::default()
                };
                metadata
                    .extra
                    .insert("chunk_index".into(), Value::from(chunk.index));
                metadata
                    .extra
                    .insert("content_hash".into(), Value::String(chunk.hash));
                DatDocumentMessage::new(self.stream.clone(), Data::new(chunk.text, metadata))
            })
            .collect();
        Ok(records)
    }
}

impl Iterator for FileRecords {
    type Item = Result<DatDocumentMessage>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.pending.next() {
                return Some(Ok(record));
            }
            let file = self.files.next()?;
            match self.load(&file) {
                Ok(records) => self.pending = records.into_iter(),
                Err(e) => {
                    self.files = Vec::new().into_iter();
                    return Some(Err(e));
                }
            }
        }
    }
}

fn modified_secs(path: &Path) -> Result<i64> {
    let modified = std::fs::metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?
        .modified()
        .unwrap_or(SystemTime::UNIX_EPOCH);
    Ok(modified
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}
