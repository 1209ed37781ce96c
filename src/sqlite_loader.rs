//! SQLite destination connector.
//!
//! Stores each record as one row of the `dat_vectors` table: the chunk
//! text, its vector as a little-endian `f32` BLOB, and its metadata as
//! JSON. Metadata filters become `json_extract` predicates, so the
//! processor's UPSERT and REPLACE deletes run entirely in SQL.
//!
//! ```toml
//! name = "sqlite"
//! [connectionSpecification]
//! path = "./data/vectors.sqlite"
//! batch_size = 100
//! ```

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::sync::Arc;

use dat_core::connector::{Checkable, Connector};
use dat_core::error::DatError;
use dat_core::loader::{FilterClause, Loader, MetadataFilter, Writable};
use dat_core::protocol::{ConnectorSpecification, DatCatalog, DatDocumentMessage, WriteSyncMode};

use crate::db;
use crate::embedding::vec_to_blob;
use crate::migrate::run_migrations;

pub const CONNECTOR_NAME: &str = "sqlite";

/// The `sqlite` destination.
#[derive(Debug, Default)]
pub struct SqliteDestination;

impl SqliteDestination {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for SqliteDestination {
    fn name(&self) -> &str {
        CONNECTOR_NAME
    }

    fn spec(&self) -> ConnectorSpecification {
        let mut spec = ConnectorSpecification::new(
            CONNECTOR_NAME,
            json!({
                "type": "object",
                "required": ["path"],
                "properties": {
                    "path": {"type": "string", "description": "SQLite database file"},
                    "batch_size": {"type": "integer", "minimum": 1, "default": 100}
                }
            }),
        );
        spec.supported_destination_sync_modes = vec![
            WriteSyncMode::Append,
            WriteSyncMode::Upsert,
            WriteSyncMode::Replace,
        ];
        spec
    }
}

#[async_trait]
impl Checkable for SqliteDestination {
    async fn check_connection(
        &self,
        config: &ConnectorSpecification,
    ) -> Result<(bool, Option<String>)> {
        let loader = SqliteLoader::open(Path::new(config.require_str("path")?)).await?;
        loader.check().await
    }
}

#[async_trait]
impl Writable for SqliteDestination {
    async fn loader(&self, config: &ConnectorSpecification) -> Result<Arc<dyn Loader>> {
        let path = config.require_str("path")?;
        Ok(Arc::new(SqliteLoader::open(Path::new(path)).await?))
    }
}

/// [`Loader`] over a SQLite pool.
pub struct SqliteLoader {
    pool: SqlitePool,
}

impl SqliteLoader {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(db::connect(path).await?))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Stored record ids of one namespace, in load order.
    pub async fn record_ids(&self, namespace: &str) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT record_id FROM dat_vectors WHERE namespace = ? ORDER BY id")
            .bind(namespace)
            .fetch_all(&self.pool)
            .await
            .map_err(classify)?;
        Ok(rows.iter().map(|r| r.get::<String, _>("record_id")).collect())
    }
}

/// Everything a filter can address: metadata, overlaid with extra data
/// fields (data wins, as in [`DatDocumentMessage::field`]).
fn filterable_fields(record: &DatDocumentMessage) -> Result<String> {
    let mut fields = match serde_json::to_value(&record.data.metadata)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    for (k, v) in &record.data.extra {
        if !v.is_null() {
            fields.insert(k.clone(), v.clone());
        }
    }
    Ok(Value::Object(fields).to_string())
}

fn json_path(field: &str) -> Result<String> {
    if field.is_empty() || !field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        bail!(DatError::Configuration(format!(
            "unsupported metadata filter field: '{}'",
            field
        )));
    }
    Ok(format!("$.{}", field))
}

/// A filter compiled to a WHERE fragment plus its bind values.
struct SqlFilter {
    clause: String,
    binds: Vec<Value>,
}

fn compile_filter(filter: &MetadataFilter) -> Result<Option<SqlFilter>> {
    let mut parts = Vec::new();
    let mut binds = Vec::new();

    for (field, clause) in filter.clauses() {
        let path = json_path(field)?;
        match clause {
            FilterClause::Eq(Value::Null) => {
                parts.push("json_extract(metadata_json, ?) IS NULL".to_string());
                binds.push(Value::String(path));
            }
            FilterClause::Eq(v) => {
                parts.push("json_extract(metadata_json, ?) = ?".to_string());
                binds.push(Value::String(path));
                binds.push(v.clone());
            }
            FilterClause::In(values) => {
                if values.is_empty() {
                    // Matches nothing.
                    return Ok(None);
                }
                let placeholders = vec!["?"; values.len()].join(", ");
                parts.push(format!(
                    "json_extract(metadata_json, ?) IN ({})",
                    placeholders
                ));
                binds.push(Value::String(path));
                binds.extend(values.iter().cloned());
            }
        }
    }

    Ok(Some(SqlFilter {
        clause: parts.join(" AND "),
        binds,
    }))
}

fn bind_value<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    value: &Value,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    match value {
        Value::String(s) => query.bind(s.clone()),
        Value::Bool(b) => query.bind(*b as i64),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64().unwrap_or_default()),
        },
        Value::Null => query.bind(Option::<String>::None),
        other => query.bind(other.to_string()),
    }
}

/// Lock contention and pool exhaustion are worth retrying; everything else
/// is reported as-is.
fn classify(err: sqlx::Error) -> anyhow::Error {
    let transient = match &err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => true,
        sqlx::Error::Database(db) => {
            let msg = db.message().to_ascii_lowercase();
            msg.contains("locked") || msg.contains("busy")
        }
        _ => false,
    };
    if transient {
        DatError::Transient(err.to_string()).into()
    } else {
        err.into()
    }
}

#[async_trait]
impl Loader for SqliteLoader {
    async fn load(
        &self,
        records: &[DatDocumentMessage],
        namespace: &str,
        stream: &str,
    ) -> Result<()> {
        let loaded_at = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await.map_err(classify)?;

        for record in records {
            let blob = record.data.vectors.as_deref().map(vec_to_blob);
            let dims = record.data.vectors.as_ref().map(|v| v.len() as i64);
            sqlx::query(
                r#"
                INSERT INTO dat_vectors (namespace, stream, record_id, document_chunk,
                                         embedding, dims, metadata_json, emitted_at, loaded_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(namespace)
            .bind(stream)
            .bind(record.record_id())
            .bind(&record.data.document_chunk)
            .bind(blob)
            .bind(dims)
            .bind(filterable_fields(record)?)
            .bind(record.emitted_at)
            .bind(loaded_at)
            .execute(&mut *tx)
            .await
            .map_err(classify)?;
        }

        tx.commit().await.map_err(classify)?;
        Ok(())
    }

    async fn delete(&self, filter: &Value, namespace: &str) -> Result<()> {
        let parsed = MetadataFilter::from_json(filter)?;
        let Some(compiled) = compile_filter(&parsed)? else {
            return Ok(());
        };

        let sql = if compiled.clause.is_empty() {
            "DELETE FROM dat_vectors WHERE namespace = ?".to_string()
        } else {
            format!(
                "DELETE FROM dat_vectors WHERE namespace = ? AND {}",
                compiled.clause
            )
        };

        let mut query = sqlx::query(&sql).bind(namespace);
        for value in &compiled.binds {
            query = bind_value(query, value);
        }
        let result = query.execute(&self.pool).await.map_err(classify)?;
        tracing::debug!(namespace, deleted = result.rows_affected(), "sqlite delete");
        Ok(())
    }

    async fn check(&self) -> Result<(bool, Option<String>)> {
        let one: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(classify)?;
        Ok((one == 1, None))
    }

    async fn initiate_sync(&self, _catalog: &DatCatalog) -> Result<()> {
        run_migrations(&self.pool).await
    }
}
