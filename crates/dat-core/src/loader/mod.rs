//! Destination capability.
//!
//! A [`Loader`] is the narrow interface the [`DataProcessor`] drives: load a
//! batch, delete by metadata filter, check connectivity, and prepare the
//! destination at the start of a sync. Filters are built as a
//! [`MetadataFilter`] and handed to the loader's
//! [`prepare_metadata_filter`](Loader::prepare_metadata_filter), which turns
//! them into whatever the backend understands.
//!
//! [`DataProcessor`]: crate::processor::DataProcessor

pub mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::codec::Incoming;
use crate::connector::{Checkable, Connector};
use crate::error::{DatError, Result};
use crate::processor::{DataProcessor, DEFAULT_BATCH_SIZE};
use crate::protocol::{ConnectorSpecification, DatCatalog, DatDocumentMessage};

/// One condition on a metadata field.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterClause {
    Eq(Value),
    In(Vec<Value>),
}

/// A conjunction of per-field conditions over record metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataFilter {
    clauses: BTreeMap<String, FilterClause>,
}

impl MetadataFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.clauses.insert(field.into(), FilterClause::Eq(value.into()));
        self
    }

    pub fn field_in(mut self, field: impl Into<String>, values: Vec<Value>) -> Self {
        self.clauses.insert(field.into(), FilterClause::In(values));
        self
    }

    pub fn clauses(&self) -> impl Iterator<Item = (&str, &FilterClause)> {
        self.clauses.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Render as `{"field": {"$eq": v}, "other": {"$in": [..]}}`.
    pub fn to_json(&self) -> Value {
        let mut out = Map::new();
        for (field, clause) in &self.clauses {
            let rendered = match clause {
                FilterClause::Eq(v) => json!({ "$eq": v }),
                FilterClause::In(vs) => json!({ "$in": vs }),
            };
            out.insert(field.clone(), rendered);
        }
        Value::Object(out)
    }

    /// Parse the JSON rendering produced by [`to_json`](Self::to_json).
    pub fn from_json(value: &Value) -> Result<Self> {
        let obj = value.as_object().ok_or_else(|| {
            DatError::Configuration(format!("metadata filter must be an object, got {}", value))
        })?;
        let mut filter = Self::new();
        for (field, cond) in obj {
            let clause = match (cond.get("$eq"), cond.get("$in")) {
                (Some(v), None) => FilterClause::Eq(v.clone()),
                (None, Some(Value::Array(vs))) => FilterClause::In(vs.clone()),
                _ => {
                    return Err(DatError::Configuration(format!(
                        "unsupported condition on '{}': {}",
                        field, cond
                    )))
                }
            };
            filter.clauses.insert(field.clone(), clause);
        }
        Ok(filter)
    }

    /// Whether `record` satisfies every clause.
    pub fn matches(&self, record: &DatDocumentMessage) -> bool {
        self.clauses.iter().all(|(field, clause)| {
            let value = record.field(field);
            match clause {
                FilterClause::Eq(expected) => value.as_ref() == Some(expected),
                FilterClause::In(allowed) => value.is_some_and(|v| allowed.contains(&v)),
            }
        })
    }
}

/// Writes records into a destination store.
#[async_trait]
pub trait Loader: Send + Sync {
    /// Append `records` of one stream.
    async fn load(
        &self,
        records: &[DatDocumentMessage],
        namespace: &str,
        stream: &str,
    ) -> anyhow::Result<()>;

    /// Remove every record in `namespace` matching a prepared filter.
    async fn delete(&self, filter: &Value, namespace: &str) -> anyhow::Result<()>;

    /// `(true, _)` if the destination is reachable and writable.
    async fn check(&self) -> anyhow::Result<(bool, Option<String>)>;

    /// Prepare the destination for a sync of `catalog` (create tables,
    /// indexes, collections). Called once per run before any other write.
    async fn initiate_sync(&self, catalog: &DatCatalog) -> anyhow::Result<()>;

    /// Translate a metadata filter into this destination's filter syntax.
    fn prepare_metadata_filter(&self, filter: &MetadataFilter) -> Value {
        filter.to_json()
    }
}

/// A destination connector's write capability.
#[async_trait]
pub trait Writable: Send + Sync {
    /// Build a loader for `config`.
    async fn loader(&self, config: &ConnectorSpecification) -> anyhow::Result<Arc<dyn Loader>>;

    /// Records per flush; `connectionSpecification.batch_size` if set.
    fn batch_size(&self, config: &ConnectorSpecification) -> usize {
        config
            .setting("batch_size")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_BATCH_SIZE)
    }

    /// Run a whole input through a fresh [`DataProcessor`].
    async fn write(
        &self,
        config: &ConnectorSpecification,
        catalog: &DatCatalog,
        input: Vec<Incoming>,
    ) -> Result<Vec<Incoming>> {
        let loader = self.loader(config).await.map_err(DatError::Loader)?;
        let mut processor = DataProcessor::new(loader, catalog.clone(), self.batch_size(config))?;
        processor.process(input).await
    }
}

/// A complete destination connector.
pub trait Destination: Connector + Checkable + Writable {}

impl<T> Destination for T where T: Connector + Checkable + Writable {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Data, DatDocumentStream, StreamMetadata};

    fn record(id: &str, run: &str) -> DatDocumentMessage {
        let metadata = StreamMetadata {
            dat_stream: "docs".into(),
            dat_record_id: Some(id.into()),
            dat_run_id: Some(run.into()),
            ..Default::default()
        };
        DatDocumentMessage::new(DatDocumentStream::new("docs"), Data::new(id, metadata))
    }

    #[test]
    fn renders_eq_and_in_operators() {
        let filter = MetadataFilter::new()
            .field_eq("dat_stream", "docs")
            .field_in("dat_record_id", vec![json!("1"), json!("2")]);
        assert_eq!(
            filter.to_json(),
            json!({
                "dat_stream": {"$eq": "docs"},
                "dat_record_id": {"$in": ["1", "2"]}
            })
        );
        assert_eq!(MetadataFilter::from_json(&filter.to_json()).unwrap(), filter);
    }

    #[test]
    fn rejects_unknown_operators() {
        let bad = json!({"dat_stream": {"$ne": "docs"}});
        assert!(MetadataFilter::from_json(&bad).is_err());
        assert!(MetadataFilter::from_json(&json!([1])).is_err());
    }

    #[test]
    fn matches_requires_every_clause() {
        let filter = MetadataFilter::new()
            .field_eq("dat_run_id", "r1")
            .field_in("dat_record_id", vec![json!("a")]);
        assert!(filter.matches(&record("a", "r1")));
        assert!(!filter.matches(&record("a", "r2")));
        assert!(!filter.matches(&record("b", "r1")));
        assert!(MetadataFilter::new().matches(&record("z", "r9")));
    }
}
