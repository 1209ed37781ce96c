//! Destination-side batching and write-mode reconciliation.
//!
//! [`DataProcessor`] turns an interleaved stream of `RECORD` and `STATE`
//! envelopes into [`Loader`] calls:
//!
//! - records are buffered per `(namespace, stream)`;
//! - the buffer is flushed when it holds `batch_size` records in total,
//!   when a non-`STARTED` state arrives for any stream, and at end of input;
//! - on flush, `upsert` streams delete the batch's ids before loading;
//!   `append` and `replace` streams just load;
//! - `replace` streams are wiped once, at their `STARTED` state or first
//!   record, whichever comes first;
//! - one progress `LOG` envelope is emitted per stream flushed.
//!
//! Everything else is forwarded in position. `STATE` envelopes that force a
//! flush come out after the flush's progress logs.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use serde_json::{json, Value};

use crate::codec::Incoming;
use crate::error::{DatError, Result};
use crate::loader::{Loader, MetadataFilter};
use crate::protocol::{
    DatCatalog, DatDocumentMessage, DatDocumentStream, DatMessage, LogLevel, MessageType,
    StreamKey, StreamStatus, WriteSyncMode,
};

/// Records per flush when a destination doesn't configure one.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Per-stream record buckets, emptied as a whole on flush.
#[derive(Debug, Default)]
struct Accumulator {
    buckets: BTreeMap<StreamKey, Vec<DatDocumentMessage>>,
    total: usize,
}

impl Accumulator {
    fn push(&mut self, key: StreamKey, record: DatDocumentMessage) {
        self.buckets.entry(key).or_default().push(record);
        self.total += 1;
    }

    fn take(&mut self) -> BTreeMap<StreamKey, Vec<DatDocumentMessage>> {
        self.total = 0;
        std::mem::take(&mut self.buckets)
    }
}

/// Drives a [`Loader`] from a stream of envelopes. One instance per run.
pub struct DataProcessor {
    loader: Arc<dyn Loader>,
    catalog: DatCatalog,
    batch_size: usize,
    buffer: Accumulator,
    initiated: bool,
    wiped: HashSet<StreamKey>,
    processed: BTreeMap<StreamKey, usize>,
}

impl DataProcessor {
    pub fn new(loader: Arc<dyn Loader>, catalog: DatCatalog, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(DatError::Configuration("batch_size must be > 0".into()));
        }
        for stream in &catalog.document_streams {
            if stream.write_sync_mode == WriteSyncMode::Upsert && stream.upsert_keys.is_empty() {
                return Err(DatError::Configuration(format!(
                    "stream '{}' uses upsert but has no upsert_keys",
                    stream.key()
                )));
            }
        }
        Ok(Self {
            loader,
            catalog,
            batch_size,
            buffer: Accumulator::default(),
            initiated: false,
            wiped: HashSet::new(),
            processed: BTreeMap::new(),
        })
    }

    /// Records loaded so far, per stream.
    pub fn processed(&self) -> &BTreeMap<StreamKey, usize> {
        &self.processed
    }

    /// Handle one input item, returning whatever should be emitted now.
    pub async fn handle(&mut self, item: Incoming) -> Result<Vec<Incoming>> {
        let msg = match item {
            Incoming::Message(msg) => msg,
            other => return Ok(vec![other]),
        };

        match msg.kind {
            MessageType::Record => {
                let Some(record) = msg.record else {
                    return Ok(Vec::new());
                };
                let key = record.key();
                let stream = self.configured(&key)?.clone();
                self.ensure_initiated().await?;
                if stream.write_sync_mode == WriteSyncMode::Replace {
                    self.wipe_once(&key, &stream).await?;
                }
                self.buffer.push(key, record);
                if self.buffer.total >= self.batch_size {
                    return self.flush().await;
                }
                Ok(Vec::new())
            }
            MessageType::State => {
                let Some(state) = msg.state.as_ref() else {
                    return Ok(vec![Incoming::Message(msg)]);
                };
                let key = state.stream.key();
                let stream = self.configured(&key)?.clone();
                if state.status() == Some(StreamStatus::Started) {
                    if stream.write_sync_mode == WriteSyncMode::Replace {
                        self.ensure_initiated().await?;
                        self.wipe_once(&key, &stream).await?;
                    }
                    return Ok(vec![Incoming::Message(msg)]);
                }
                let mut out = self.flush().await?;
                out.push(Incoming::Message(msg));
                Ok(out)
            }
            _ => Ok(vec![Incoming::Message(msg)]),
        }
    }

    /// Handle a batch of items without flushing at the end.
    pub async fn handle_all<I>(&mut self, items: I) -> Result<Vec<Incoming>>
    where
        I: IntoIterator<Item = Incoming>,
    {
        let mut out = Vec::new();
        for item in items {
            out.extend(self.handle(item).await?);
        }
        Ok(out)
    }

    /// End of input: flush whatever is buffered.
    pub async fn finish(&mut self) -> Result<Vec<Incoming>> {
        let out = self.flush().await?;
        tracing::info!(streams = self.processed.len(), "destination write finished");
        Ok(out)
    }

    /// Handle a complete input, then finish.
    pub async fn process<I>(&mut self, items: I) -> Result<Vec<Incoming>>
    where
        I: IntoIterator<Item = Incoming>,
    {
        let mut out = self.handle_all(items).await?;
        out.extend(self.finish().await?);
        Ok(out)
    }

    fn configured(&self, key: &StreamKey) -> Result<&DatDocumentStream> {
        self.catalog.find(key).ok_or_else(|| {
            DatError::Configuration(format!("stream '{}' is not in the configured catalog", key))
        })
    }

    async fn ensure_initiated(&mut self) -> Result<()> {
        if !self.initiated {
            self.loader
                .initiate_sync(&self.catalog)
                .await
                .map_err(DatError::Loader)?;
            self.initiated = true;
        }
        Ok(())
    }

    async fn wipe_once(&mut self, key: &StreamKey, stream: &DatDocumentStream) -> Result<()> {
        if !self.wiped.insert(key.clone()) {
            return Ok(());
        }
        let filter = MetadataFilter::new().field_eq("dat_stream", stream.name.clone());
        let prepared = self.loader.prepare_metadata_filter(&filter);
        tracing::info!(stream = %key, "replacing stream contents");
        self.loader
            .delete(&prepared, &key.namespace)
            .await
            .map_err(DatError::Loader)
    }

    async fn flush(&mut self) -> Result<Vec<Incoming>> {
        if self.buffer.total == 0 {
            return Ok(Vec::new());
        }
        let buckets = self.buffer.take();
        let mut logs = Vec::with_capacity(buckets.len());

        for (key, records) in buckets {
            let stream = self.configured(&key)?.clone();
            if stream.write_sync_mode == WriteSyncMode::Upsert {
                for filter in upsert_filters(&stream, &records) {
                    let prepared = self.loader.prepare_metadata_filter(&filter);
                    self.loader
                        .delete(&prepared, &key.namespace)
                        .await
                        .map_err(DatError::Loader)?;
                }
            }
            self.loader
                .load(&records, &key.namespace, &key.stream)
                .await
                .map_err(DatError::Loader)?;

            let total = self.processed.entry(key.clone()).or_default();
            *total += records.len();
            tracing::info!(
                stream = %key,
                mode = %stream.write_sync_mode,
                batch = records.len(),
                total = *total,
                "flushed batch"
            );
            let summary = json!({
                "namespace": key.namespace,
                "stream_name": key.stream,
                "n_docs_processed": *total,
            });
            logs.push(Incoming::Message(DatMessage::log(
                LogLevel::Info,
                summary.to_string(),
            )));
        }
        Ok(logs)
    }
}

/// Delete filters that scope an upsert batch to its own ids.
///
/// Records are grouped by `(dat_source, dat_run_id)` so each filter pins
/// those exactly; every upsert key becomes an `$in` over the group's values.
fn upsert_filters(stream: &DatDocumentStream, records: &[DatDocumentMessage]) -> Vec<MetadataFilter> {
    let mut groups: BTreeMap<(String, Option<String>), Vec<&DatDocumentMessage>> = BTreeMap::new();
    for record in records {
        let meta = &record.data.metadata;
        groups
            .entry((meta.dat_source.clone(), meta.dat_run_id.clone()))
            .or_default()
            .push(record);
    }

    groups
        .into_iter()
        .map(|((source, run_id), group)| {
            let mut filter = MetadataFilter::new().field_eq("dat_stream", stream.name.clone());
            if !source.is_empty() {
                filter = filter.field_eq("dat_source", source);
            }
            if let Some(run_id) = run_id {
                filter = filter.field_eq("dat_run_id", run_id);
            }
            for upsert_key in &stream.upsert_keys {
                let mut seen = BTreeSet::new();
                let values: Vec<Value> = group
                    .iter()
                    .filter_map(|r| r.field(upsert_key))
                    .filter(|v| seen.insert(v.to_string()))
                    .collect();
                filter = filter.field_in(upsert_key.clone(), values);
            }
            filter
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode_line;
    use crate::loader::memory::{InMemoryLoader, LoaderCall};
    use crate::protocol::{Data, DatStateMessage, StreamMetadata, StreamState};
    use serde_json::Map;

    fn stream(name: &str, mode: WriteSyncMode) -> DatDocumentStream {
        let s = DatDocumentStream::new(name).with_write_mode(mode);
        if mode == WriteSyncMode::Upsert {
            s.with_upsert_keys(["dat_record_id"])
        } else {
            s
        }
    }

    fn record(stream: &DatDocumentStream, id: &str) -> Incoming {
        let metadata = StreamMetadata {
            dat_source: "src".into(),
            dat_stream: stream.name.clone(),
            dat_record_id: Some(id.into()),
            dat_run_id: Some("run-1".into()),
            ..Default::default()
        };
        Incoming::Message(DatMessage::record(DatDocumentMessage::new(
            stream.clone(),
            Data::new(format!("chunk {}", id), metadata),
        )))
    }

    fn state(stream: &DatDocumentStream, status: StreamStatus) -> Incoming {
        Incoming::Message(DatMessage::state(DatStateMessage {
            stream: stream.clone(),
            stream_state: StreamState::with_status(Map::new(), status),
        }))
    }

    fn processor(
        loader: &Arc<InMemoryLoader>,
        streams: Vec<DatDocumentStream>,
        batch_size: usize,
    ) -> DataProcessor {
        DataProcessor::new(
            Arc::clone(loader) as Arc<dyn Loader>,
            DatCatalog::new(streams),
            batch_size,
        )
        .unwrap()
    }

    /// `STATE:<status>`, `LOG:<n>`, or `RECORD`.
    fn labels(out: &[Incoming]) -> Vec<String> {
        out.iter()
            .map(|item| match item {
                Incoming::Message(m) => match m.kind {
                    MessageType::State => format!("STATE:{:?}", m.as_state().unwrap().status().unwrap()),
                    MessageType::Log => {
                        let v: Value = serde_json::from_str(&m.as_log().unwrap().message).unwrap();
                        format!("LOG:{}", v["n_docs_processed"])
                    }
                    other => format!("{:?}", other),
                },
                Incoming::Unrecognized(_) => "UNKNOWN".into(),
            })
            .collect()
    }

    #[tokio::test]
    async fn scenario_single_flush_between_started_and_completed() {
        let a = stream("A", WriteSyncMode::Append);
        let loader = Arc::new(InMemoryLoader::new());
        let mut p = processor(&loader, vec![a.clone()], 10);

        let out = p
            .process(vec![
                state(&a, StreamStatus::Started),
                record(&a, "1"),
                record(&a, "2"),
                state(&a, StreamStatus::Completed),
            ])
            .await
            .unwrap();

        assert_eq!(loader.load_batches(), vec![vec!["1", "2"]]);
        assert_eq!(labels(&out), vec!["STATE:Started", "LOG:2", "STATE:Completed"]);
    }

    #[tokio::test]
    async fn scenario_unknown_stream_fails_before_any_loader_call() {
        let a = stream("A", WriteSyncMode::Append);
        let b = stream("B", WriteSyncMode::Append);
        let loader = Arc::new(InMemoryLoader::new());
        let mut p = processor(&loader, vec![a], 10);

        let err = p.process(vec![record(&b, "1")]).await.unwrap_err();
        assert!(matches!(err, DatError::Configuration(_)));
        assert!(loader.calls().is_empty());
    }

    #[tokio::test]
    async fn scenario_two_full_batches_two_loads_two_logs() {
        let a = stream("A", WriteSyncMode::Append);
        let loader = Arc::new(InMemoryLoader::new());
        let mut p = processor(&loader, vec![a.clone()], 2);

        let input = (1..=4).map(|i| record(&a, &i.to_string())).collect::<Vec<_>>();
        let out = p.process(input).await.unwrap();

        assert_eq!(loader.load_batches(), vec![vec!["1", "2"], vec!["3", "4"]]);
        assert_eq!(labels(&out), vec!["LOG:2", "LOG:4"]);
    }

    #[tokio::test]
    async fn total_loaded_matches_configured_records_for_any_batch_size() {
        let a = stream("A", WriteSyncMode::Append);
        let b = stream("B", WriteSyncMode::Upsert);
        let mut input = vec![state(&a, StreamStatus::Started)];
        for i in 0..7 {
            input.push(record(&a, &format!("a{}", i)));
            if i % 2 == 0 {
                input.push(record(&b, &format!("b{}", i)));
            }
            if i == 3 {
                input.push(state(&a, StreamStatus::Running));
            }
        }
        let expected = input
            .iter()
            .filter(|i| matches!(i, Incoming::Message(m) if m.kind == MessageType::Record))
            .count();

        for batch_size in [1, 3, expected] {
            let loader = Arc::new(InMemoryLoader::new());
            let mut p = processor(&loader, vec![a.clone(), b.clone()], batch_size);
            p.process(input.clone()).await.unwrap();
            let loaded: usize = loader.load_batches().iter().map(Vec::len).sum();
            assert_eq!(loaded, expected, "batch_size = {}", batch_size);
        }
    }

    #[tokio::test]
    async fn upsert_replay_keeps_one_copy_per_id() {
        let s = stream("docs", WriteSyncMode::Upsert);
        let loader = Arc::new(InMemoryLoader::new());
        let batch = vec![record(&s, "1"), record(&s, "2")];

        let mut p = processor(&loader, vec![s.clone()], 10);
        p.process(batch.clone()).await.unwrap();
        let mut p = processor(&loader, vec![s.clone()], 10);
        p.process(batch).await.unwrap();

        let mut ids = loader.stored_ids();
        ids.sort();
        assert_eq!(ids, vec!["1", "2"]);

        let calls = loader.calls();
        let delete_pos = calls
            .iter()
            .position(|c| matches!(c, LoaderCall::Delete { .. }))
            .unwrap();
        let load_pos = calls
            .iter()
            .position(|c| matches!(c, LoaderCall::Load { .. }))
            .unwrap();
        assert!(delete_pos < load_pos);
    }

    #[tokio::test]
    async fn upsert_delete_filter_is_scoped_to_batch() {
        let s = stream("docs", WriteSyncMode::Upsert);
        let loader = Arc::new(InMemoryLoader::new());
        let mut p = processor(&loader, vec![s.clone()], 10);
        p.process(vec![record(&s, "1"), record(&s, "2"), record(&s, "1")])
            .await
            .unwrap();

        let filter = loader
            .calls()
            .into_iter()
            .find_map(|c| match c {
                LoaderCall::Delete { filter, .. } => Some(filter),
                _ => None,
            })
            .unwrap();
        assert_eq!(
            filter,
            json!({
                "dat_stream": {"$eq": "docs"},
                "dat_source": {"$eq": "src"},
                "dat_run_id": {"$eq": "run-1"},
                "dat_record_id": {"$in": ["1", "2"]}
            })
        );
    }

    #[tokio::test]
    async fn replace_wipes_once_per_stream() {
        let s = stream("docs", WriteSyncMode::Replace);
        let loader = Arc::new(InMemoryLoader::new());
        let mut p = processor(&loader, vec![s.clone()], 1);
        p.process(vec![
            state(&s, StreamStatus::Started),
            record(&s, "1"),
            record(&s, "2"),
            state(&s, StreamStatus::Completed),
        ])
        .await
        .unwrap();

        let calls = loader.calls();
        assert_eq!(calls[0], LoaderCall::InitiateSync);
        assert!(matches!(calls[1], LoaderCall::Delete { .. }));
        let deletes = calls
            .iter()
            .filter(|c| matches!(c, LoaderCall::Delete { .. }))
            .count();
        assert_eq!(deletes, 1);
        assert_eq!(loader.load_batches().len(), 2);
    }

    #[tokio::test]
    async fn replace_without_started_wipes_at_first_record() {
        let s = stream("docs", WriteSyncMode::Replace);
        let loader = Arc::new(InMemoryLoader::new());
        let mut p = processor(&loader, vec![s.clone()], 10);
        p.process(vec![record(&s, "1")]).await.unwrap();

        let calls = loader.calls();
        assert_eq!(calls.len(), 3);
        assert!(matches!(calls[1], LoaderCall::Delete { .. }));
        assert!(matches!(calls[2], LoaderCall::Load { .. }));
    }

    #[tokio::test]
    async fn initiate_sync_runs_once_before_first_write() {
        let a = stream("A", WriteSyncMode::Append);
        let loader = Arc::new(InMemoryLoader::new());
        let mut p = processor(&loader, vec![a.clone()], 1);
        p.process(vec![record(&a, "1"), record(&a, "2")]).await.unwrap();

        let calls = loader.calls();
        assert_eq!(calls[0], LoaderCall::InitiateSync);
        assert_eq!(
            calls.iter().filter(|c| **c == LoaderCall::InitiateSync).count(),
            1
        );
    }

    #[tokio::test]
    async fn non_record_envelopes_pass_through_in_position() {
        let a = stream("A", WriteSyncMode::Append);
        let loader = Arc::new(InMemoryLoader::new());
        let mut p = processor(&loader, vec![a.clone()], 10);

        let unknown = decode_line(r#"{"type":"HEARTBEAT"}"#).unwrap();
        let log = Incoming::Message(DatMessage::log(LogLevel::Debug, "hello"));
        let out = p
            .process(vec![unknown.clone(), record(&a, "1"), log.clone()])
            .await
            .unwrap();

        assert_eq!(out[0], unknown);
        assert_eq!(out[1], log);
        assert_eq!(labels(&out[2..]), vec!["LOG:1"]);
    }

    #[tokio::test]
    async fn state_flush_covers_all_streams() {
        let a = stream("A", WriteSyncMode::Append);
        let b = stream("B", WriteSyncMode::Append);
        let loader = Arc::new(InMemoryLoader::new());
        let mut p = processor(&loader, vec![a.clone(), b.clone()], 100);

        let out = p
            .process(vec![
                record(&a, "a1"),
                record(&b, "b1"),
                state(&a, StreamStatus::Completed),
            ])
            .await
            .unwrap();

        assert_eq!(loader.load_batches().len(), 2);
        assert_eq!(labels(&out), vec!["LOG:1", "LOG:1", "STATE:Completed"]);
        assert_eq!(p.processed().values().sum::<usize>(), 2);
    }

    #[tokio::test]
    async fn upsert_without_keys_is_rejected() {
        let s = DatDocumentStream::new("docs").with_write_mode(WriteSyncMode::Upsert);
        let loader: Arc<dyn Loader> = Arc::new(InMemoryLoader::new());
        assert!(matches!(
            DataProcessor::new(loader, DatCatalog::new(vec![s]), 10),
            Err(DatError::Configuration(_))
        ));
    }
}
