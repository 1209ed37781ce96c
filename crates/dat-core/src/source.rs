//! Source capabilities and the incremental read state machine.
//!
//! [`SourceRunner::read`] drives each configured stream through
//! `STARTED → RUNNING → COMPLETED`, interleaving checkpoint `STATE`
//! envelopes with records:
//!
//! ```text
//! STATE(STARTED, {})
//! STATE(RUNNING, {cursor: c1})   ← built from the first record
//! RECORD r1
//! RECORD r2                      ← same cursor, no checkpoint
//! STATE(RUNNING, {cursor: c3})   ← cursor changed (incremental only)
//! RECORD r3
//! STATE(COMPLETED, {cursor: c3})
//! ```
//!
//! Every RUNNING and COMPLETED state is persisted through the
//! [`StateManager`] before it is yielded. STARTED is not persisted, so it
//! never clobbers a stored cursor.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::connector::{Checkable, Connector};
use crate::error::{DatError, Result};
use crate::protocol::{
    now_millis, ConnectorSpecification, DatCatalog, DatDocumentMessage, DatDocumentStream,
    DatMessage, DatStateMessage, LogLevel, ReadSyncMode, StreamState, StreamStatus,
};
use crate::state::StateManager;
use crate::stream::{extract_cursor, RecordIter, Stream};

/// Produces the catalog of streams a source offers.
#[async_trait]
pub trait Discoverable: Send + Sync {
    async fn discover(&self, config: &ConnectorSpecification) -> anyhow::Result<DatCatalog>;
}

/// Exposes a source's streams for reading.
pub trait Readable: Send + Sync {
    fn streams(&self, config: &ConnectorSpecification) -> anyhow::Result<Vec<Arc<dyn Stream>>>;
}

/// A complete source connector.
pub trait Source: Connector + Checkable + Discoverable + Readable {}

impl<T> Source for T where T: Connector + Checkable + Discoverable + Readable {}

/// Build a discovered catalog from a source's streams, tagging each with
/// `namespace` when one is given.
pub fn catalog_from_streams(streams: &[Arc<dyn Stream>], namespace: Option<&str>) -> DatCatalog {
    DatCatalog::new(
        streams
            .iter()
            .map(|s| {
                let mut doc = s.as_document_stream();
                doc.namespace = namespace.map(str::to_string);
                doc
            })
            .collect(),
    )
}

/// Runs reads for one source within a single run id.
pub struct SourceRunner {
    source_name: String,
    run_id: String,
    state_manager: Arc<dyn StateManager>,
    initial_state: HashMap<String, StreamState>,
}

impl SourceRunner {
    pub fn new(source_name: impl Into<String>, state_manager: Arc<dyn StateManager>) -> Self {
        Self {
            source_name: source_name.into(),
            run_id: uuid::Uuid::new_v4().to_string(),
            state_manager,
            initial_state: HashMap::new(),
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    /// Prior state per state key that takes precedence over the state
    /// manager for the initial lookup.
    pub fn with_initial_state(mut self, initial_state: HashMap<String, StreamState>) -> Self {
        self.initial_state = initial_state;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Read every stream configured in `catalog`, in catalog order.
    ///
    /// Configuration problems (a stream the source doesn't offer, an
    /// incremental stream without a cursor) fail here before any envelope
    /// is produced. The returned iterator yields envelopes lazily; an `Err`
    /// item is terminal.
    pub fn read(&self, streams: Vec<Arc<dyn Stream>>, catalog: &DatCatalog) -> Result<SourceRead> {
        let mut plan = VecDeque::new();
        for configured in &catalog.document_streams {
            let stream = streams
                .iter()
                .find(|s| s.name() == configured.name)
                .cloned()
                .ok_or_else(|| {
                    DatError::Configuration(format!(
                        "catalog stream '{}' is not offered by source '{}'",
                        configured.key(),
                        self.source_name
                    ))
                })?;
            let mut configured = configured.clone();
            if configured.default_cursor_field.is_none() {
                configured.default_cursor_field = stream.default_cursor_field().map(str::to_string);
            }
            configured.validate()?;
            plan.push_back((stream, configured));
        }

        tracing::info!(
            source = %self.source_name,
            run_id = %self.run_id,
            streams = plan.len(),
            "starting read"
        );

        Ok(SourceRead {
            source_name: self.source_name.clone(),
            run_id: self.run_id.clone(),
            state_manager: Arc::clone(&self.state_manager),
            initial_state: self.initial_state.clone(),
            catalog: catalog.clone(),
            plan,
            current: None,
            pending: VecDeque::new(),
            done: false,
        })
    }
}

/// Progress through the stream currently being read.
struct StreamProgress {
    configured: DatDocumentStream,
    incremental: bool,
    cursor_field: Option<String>,
    interval: Option<usize>,
    records: RecordIter,
    prior: StreamState,
    emitted: usize,
    since_checkpoint: usize,
    last_checkpointed: Option<Value>,
    last_cursor: Option<Value>,
}

/// Lazy envelope sequence returned by [`SourceRunner::read`].
pub struct SourceRead {
    source_name: String,
    run_id: String,
    state_manager: Arc<dyn StateManager>,
    initial_state: HashMap<String, StreamState>,
    catalog: DatCatalog,
    plan: VecDeque<(Arc<dyn Stream>, DatDocumentStream)>,
    current: Option<StreamProgress>,
    pending: VecDeque<DatMessage>,
    done: bool,
}

impl Iterator for SourceRead {
    type Item = Result<DatMessage>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(msg) = self.pending.pop_front() {
                return Some(Ok(msg));
            }
            if self.done {
                return None;
            }
            match self.step() {
                Ok(true) => continue,
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    self.pending.clear();
                    return Some(Err(e));
                }
            }
        }
    }
}

impl SourceRead {
    /// Advance by one unit of work, queueing envelopes in `pending`.
    /// Returns `false` once every stream is finished.
    fn step(&mut self) -> Result<bool> {
        if self.current.is_none() {
            return match self.plan.pop_front() {
                Some((stream, configured)) => {
                    self.start_stream(stream, configured)?;
                    Ok(true)
                }
                None => {
                    tracing::info!(run_id = %self.run_id, "read finished");
                    Ok(false)
                }
            };
        }

        let next = match self.current.as_mut() {
            Some(progress) => progress.records.next(),
            None => return Ok(true),
        };
        match next {
            Some(Ok(record)) => self.on_record(record)?,
            Some(Err(source)) => {
                let stream = self
                    .current
                    .as_ref()
                    .map(|p| p.configured.name.clone())
                    .unwrap_or_default();
                return Err(DatError::Stream { stream, source });
            }
            None => self.finish_stream()?,
        }
        Ok(true)
    }

    fn start_stream(&mut self, stream: Arc<dyn Stream>, configured: DatDocumentStream) -> Result<()> {
        self.pending.push_back(state_message(
            &configured,
            StreamState::with_status(Map::new(), StreamStatus::Started),
        ));

        let key = configured.state_key().to_string();
        let prior = match self.initial_state.get(&key) {
            Some(state) => state.clone(),
            None => self.state_manager.get(&key).map_err(DatError::State)?,
        };

        let incremental = configured.read_sync_mode == ReadSyncMode::Incremental;
        let cursor_field = configured.effective_cursor_field().map(str::to_string);
        let cursor_value = match (incremental, cursor_field.as_deref()) {
            (true, Some(field)) => prior.cursor_value(field).cloned(),
            _ => None,
        };

        tracing::info!(
            stream = %configured.key(),
            mode = if incremental { "incremental" } else { "full_refresh" },
            cursor = ?cursor_value,
            "reading stream"
        );

        let records = stream
            .read_records(&self.catalog, &configured, cursor_value)
            .map_err(|source| DatError::Stream {
                stream: configured.name.clone(),
                source,
            })?;

        self.current = Some(StreamProgress {
            interval: stream.state_checkpoint_interval().filter(|k| *k > 0),
            configured,
            incremental,
            cursor_field,
            records,
            prior,
            emitted: 0,
            since_checkpoint: 0,
            last_checkpointed: None,
            last_cursor: None,
        });
        Ok(())
    }

    fn on_record(&mut self, mut record: DatDocumentMessage) -> Result<()> {
        let Some(progress) = self.current.as_mut() else {
            return Ok(());
        };
        stamp(&mut record, &progress.configured, &self.source_name, &self.run_id);

        let cursor = progress
            .cursor_field
            .as_deref()
            .and_then(|field| extract_cursor(&record, field));

        let checkpoint = if progress.emitted == 0 {
            Some(StreamStatus::Running)
        } else {
            progress.since_checkpoint += 1;
            let interval_reached = progress
                .interval
                .is_some_and(|k| progress.since_checkpoint >= k);
            let cursor_changed = cursor.is_some() && cursor != progress.last_checkpointed;
            (progress.incremental && (interval_reached || cursor_changed))
                .then_some(StreamStatus::Running)
        };

        if cursor.is_some() {
            progress.last_cursor = cursor.clone();
        }

        if let Some(status) = checkpoint {
            let value = cursor.clone().or_else(|| progress.last_cursor.clone());
            let state = StreamState::with_status(
                StreamState::cursor_data(progress.cursor_field.as_deref(), value.as_ref()),
                status,
            );
            self.state_manager
                .save(progress.configured.state_key(), &state)
                .map_err(DatError::State)?;
            tracing::debug!(stream = %progress.configured.key(), cursor = ?value, "checkpoint");
            self.pending
                .push_back(state_message(&progress.configured, state));
            progress.last_checkpointed = value;
            progress.since_checkpoint = 0;
        }

        progress.emitted += 1;
        self.pending.push_back(DatMessage::record(record));
        Ok(())
    }

    fn finish_stream(&mut self) -> Result<()> {
        let Some(progress) = self.current.take() else {
            return Ok(());
        };

        let data = if progress.emitted == 0 {
            tracing::warn!(stream = %progress.configured.key(), "source returned no data");
            self.pending.push_back(DatMessage::log(
                LogLevel::Warn,
                format!(
                    "stream '{}' returned no data",
                    progress.configured.key()
                ),
            ));
            progress.prior.data.clone()
        } else if progress.last_cursor.is_some() {
            StreamState::cursor_data(
                progress.cursor_field.as_deref(),
                progress.last_cursor.as_ref(),
            )
        } else {
            progress.prior.data.clone()
        };

        let state = StreamState::with_status(data, StreamStatus::Completed);
        self.state_manager
            .save(progress.configured.state_key(), &state)
            .map_err(DatError::State)?;
        tracing::info!(
            stream = %progress.configured.key(),
            records = progress.emitted,
            "stream completed"
        );
        self.pending
            .push_back(state_message(&progress.configured, state));
        Ok(())
    }
}

fn state_message(stream: &DatDocumentStream, stream_state: StreamState) -> DatMessage {
    DatMessage::state(DatStateMessage {
        stream: stream.clone(),
        stream_state,
    })
}

/// Fill in the scoping fields downstream filters rely on.
fn stamp(record: &mut DatDocumentMessage, configured: &DatDocumentStream, source: &str, run_id: &str) {
    record.namespace = configured.namespace.clone();
    record.stream = configured.clone();
    let meta = &mut record.data.metadata;
    if meta.dat_stream.is_empty() {
        meta.dat_stream = configured.name.clone();
    }
    if meta.dat_source.is_empty() {
        meta.dat_source = source.to_string();
    }
    if meta.dat_run_id.is_none() {
        meta.dat_run_id = Some(run_id.to_string());
    }
    if record.emitted_at == 0 {
        record.emitted_at = now_millis();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Data, MessageType, StreamMetadata};
    use crate::state::InMemoryStateManager;
    use serde_json::json;
    use std::sync::Mutex;

    /// A stream over fixed `(id, cursor)` pairs that honours `>=` cursors.
    struct FixedStream {
        rows: Vec<(&'static str, i64)>,
        interval: Option<usize>,
        fail_after: Option<usize>,
        seen_cursors: Mutex<Vec<Option<Value>>>,
    }

    impl FixedStream {
        fn new(rows: Vec<(&'static str, i64)>) -> Self {
            Self {
                rows,
                interval: None,
                fail_after: None,
                seen_cursors: Mutex::new(Vec::new()),
            }
        }
    }

    impl Stream for FixedStream {
        fn name(&self) -> &str {
            "docs"
        }

        fn default_cursor_field(&self) -> Option<&str> {
            Some("dat_last_modified")
        }

        fn state_checkpoint_interval(&self) -> Option<usize> {
            self.interval
        }

        fn read_records(
            &self,
            _catalog: &DatCatalog,
            configured: &DatDocumentStream,
            cursor_value: Option<Value>,
        ) -> anyhow::Result<RecordIter> {
            self.seen_cursors.lock().unwrap().push(cursor_value.clone());
            let min = cursor_value.and_then(|v| v.as_i64()).unwrap_or(i64::MIN);
            let stream = configured.clone();
            let fail_after = self.fail_after;
            let rows: Vec<_> = self.rows.iter().filter(|(_, ts)| *ts >= min).cloned().collect();
            Ok(Box::new(rows.into_iter().enumerate().map(move |(i, (id, ts))| {
                if fail_after == Some(i) {
                    anyhow::bail!("transport closed");
                }
                let metadata = StreamMetadata {
                    dat_record_id: Some(id.to_string()),
                    dat_last_modified: Some(ts),
                    ..Default::default()
                };
                Ok(DatDocumentMessage::new(stream.clone(), Data::new(id, metadata)))
            })))
        }
    }

    fn catalog(mode: ReadSyncMode) -> DatCatalog {
        let mut stream = DatDocumentStream::new("docs").with_namespace("ws");
        stream.read_sync_mode = mode;
        DatCatalog::new(vec![stream])
    }

    /// Compact trace: `S:<status>:<cursor>`, `R:<id>`, `L`.
    fn trace(msgs: &[DatMessage]) -> Vec<String> {
        msgs.iter()
            .map(|m| match m.kind {
                MessageType::Record => format!("R:{}", m.record.as_ref().unwrap().data.document_chunk),
                MessageType::State => {
                    let s = &m.state.as_ref().unwrap().stream_state;
                    let status = match s.stream_status.unwrap() {
                        StreamStatus::Started => "STARTED",
                        StreamStatus::Running => "RUNNING",
                        StreamStatus::Completed => "COMPLETED",
                    };
                    match s.data.get("dat_last_modified") {
                        Some(v) => format!("S:{}:{}", status, v),
                        None => format!("S:{}", status),
                    }
                }
                MessageType::Log => "L".to_string(),
                other => format!("{:?}", other),
            })
            .collect()
    }

    fn run(
        stream: Arc<FixedStream>,
        mode: ReadSyncMode,
        mgr: Arc<InMemoryStateManager>,
    ) -> Vec<DatMessage> {
        let runner = SourceRunner::new("test-source", mgr).with_run_id("run-1");
        runner
            .read(vec![stream as Arc<dyn Stream>], &catalog(mode))
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    #[test]
    fn full_refresh_emits_started_running_completed() {
        let stream = Arc::new(FixedStream::new(vec![("a", 1), ("b", 2), ("c", 3)]));
        let mgr = Arc::new(InMemoryStateManager::new());
        let out = run(stream, ReadSyncMode::FullRefresh, Arc::clone(&mgr));
        assert_eq!(
            trace(&out),
            vec!["S:STARTED", "S:RUNNING:1", "R:a", "R:b", "R:c", "S:COMPLETED:3"]
        );
        assert_eq!(mgr.get("ws").unwrap().stream_status, Some(StreamStatus::Completed));
    }

    #[test]
    fn incremental_checkpoints_on_cursor_change() {
        let stream = Arc::new(FixedStream::new(vec![("a", 1), ("b", 1), ("c", 2), ("d", 3)]));
        let mgr = Arc::new(InMemoryStateManager::new());
        let out = run(stream, ReadSyncMode::Incremental, Arc::clone(&mgr));
        assert_eq!(
            trace(&out),
            vec![
                "S:STARTED",
                "S:RUNNING:1",
                "R:a",
                "R:b",
                "S:RUNNING:2",
                "R:c",
                "S:RUNNING:3",
                "R:d",
                "S:COMPLETED:3"
            ]
        );
        assert_eq!(mgr.get("ws").unwrap().data["dat_last_modified"], 3);
    }

    #[test]
    fn incremental_checkpoints_every_interval_records() {
        let mut fixed = FixedStream::new(vec![("a", 7), ("b", 7), ("c", 7), ("d", 7), ("e", 7)]);
        fixed.interval = Some(2);
        let mgr = Arc::new(InMemoryStateManager::new());
        let out = run(Arc::new(fixed), ReadSyncMode::Incremental, mgr);
        assert_eq!(
            trace(&out),
            vec![
                "S:STARTED",
                "S:RUNNING:7",
                "R:a",
                "R:b",
                "S:RUNNING:7",
                "R:c",
                "R:d",
                "S:RUNNING:7",
                "R:e",
                "S:COMPLETED:7"
            ]
        );
    }

    #[test]
    fn after_k_plus_one_records_a_checkpoint_matches_the_previous_cursor() {
        let k = 3;
        let mut fixed = FixedStream::new(vec![("a", 1), ("b", 2), ("c", 3), ("d", 4), ("e", 5)]);
        fixed.interval = Some(k);
        let out = run(
            Arc::new(fixed),
            ReadSyncMode::Incremental,
            Arc::new(InMemoryStateManager::new()),
        );

        let mut records = 0;
        let mut prior_cursor = None;
        let mut checkpoints = Vec::new();
        for msg in &out {
            if let Some(r) = msg.as_record() {
                records += 1;
                if records == k + 1 {
                    break;
                }
                prior_cursor = r.data.metadata.dat_last_modified;
            } else if let Some(s) = msg.as_state() {
                if s.status() == Some(StreamStatus::Running) {
                    checkpoints.push(s.stream_state.data["dat_last_modified"].as_i64());
                }
            }
        }
        assert_eq!(prior_cursor, Some(3));
        assert!(checkpoints.contains(&prior_cursor));
    }

    #[test]
    fn resumes_from_persisted_cursor() {
        let stream = Arc::new(FixedStream::new(vec![("a", 1), ("b", 5), ("c", 9)]));
        let mgr = Arc::new(InMemoryStateManager::new());
        mgr.save(
            "ws",
            &StreamState::with_status(
                json!({"dat_last_modified": 5}).as_object().cloned().unwrap(),
                StreamStatus::Completed,
            ),
        )
        .unwrap();

        let out = run(Arc::clone(&stream), ReadSyncMode::Incremental, mgr);
        assert_eq!(stream.seen_cursors.lock().unwrap().as_slice(), &[Some(json!(5))]);
        assert_eq!(
            trace(&out),
            vec!["S:STARTED", "S:RUNNING:5", "R:b", "S:RUNNING:9", "R:c", "S:COMPLETED:9"]
        );
    }

    #[test]
    fn full_refresh_ignores_persisted_cursor() {
        let stream = Arc::new(FixedStream::new(vec![("a", 1)]));
        let mgr = Arc::new(InMemoryStateManager::new());
        mgr.save(
            "ws",
            &StreamState::with_status(
                json!({"dat_last_modified": 5}).as_object().cloned().unwrap(),
                StreamStatus::Completed,
            ),
        )
        .unwrap();
        run(Arc::clone(&stream), ReadSyncMode::FullRefresh, mgr);
        assert_eq!(stream.seen_cursors.lock().unwrap().as_slice(), &[None]);
    }

    #[test]
    fn initial_state_overrides_manager() {
        let stream = Arc::new(FixedStream::new(vec![("a", 1), ("b", 5)]));
        let mgr = Arc::new(InMemoryStateManager::new());
        let mut initial = HashMap::new();
        initial.insert(
            "ws".to_string(),
            StreamState {
                data: json!({"dat_last_modified": 4}).as_object().cloned().unwrap(),
                stream_status: None,
            },
        );
        let runner = SourceRunner::new("test-source", mgr).with_initial_state(initial);
        let out: Vec<_> = runner
            .read(vec![Arc::clone(&stream) as Arc<dyn Stream>], &catalog(ReadSyncMode::Incremental))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(stream.seen_cursors.lock().unwrap().as_slice(), &[Some(json!(4))]);
        assert_eq!(out.iter().filter(|m| m.as_record().is_some()).count(), 1);
    }

    #[test]
    fn empty_stream_warns_and_completes_with_prior_state() {
        let stream = Arc::new(FixedStream::new(vec![("a", 1)]));
        let mgr = Arc::new(InMemoryStateManager::new());
        mgr.save(
            "ws",
            &StreamState::with_status(
                json!({"dat_last_modified": 10}).as_object().cloned().unwrap(),
                StreamStatus::Completed,
            ),
        )
        .unwrap();
        let out = run(stream, ReadSyncMode::Incremental, Arc::clone(&mgr));
        assert_eq!(trace(&out), vec!["S:STARTED", "L", "S:COMPLETED:10"]);
        assert_eq!(out[1].as_log().unwrap().level, LogLevel::Warn);
        assert_eq!(mgr.get("ws").unwrap().data["dat_last_modified"], 10);
    }

    #[test]
    fn records_are_stamped_with_run_scope() {
        let stream = Arc::new(FixedStream::new(vec![("a", 1)]));
        let out = run(stream, ReadSyncMode::FullRefresh, Arc::new(InMemoryStateManager::new()));
        let record = out.iter().find_map(|m| m.as_record()).unwrap();
        assert_eq!(record.namespace.as_deref(), Some("ws"));
        assert_eq!(record.data.metadata.dat_stream, "docs");
        assert_eq!(record.data.metadata.dat_source, "test-source");
        assert_eq!(record.data.metadata.dat_run_id.as_deref(), Some("run-1"));
        assert!(record.emitted_at > 0);
    }

    #[test]
    fn stream_failure_is_terminal() {
        let mut fixed = FixedStream::new(vec![("a", 1), ("b", 2), ("c", 3)]);
        fixed.fail_after = Some(1);
        let runner = SourceRunner::new("test-source", Arc::new(InMemoryStateManager::new()));
        let mut read = runner
            .read(vec![Arc::new(fixed) as Arc<dyn Stream>], &catalog(ReadSyncMode::FullRefresh))
            .unwrap();

        let mut ok = 0;
        let mut err = None;
        for item in read.by_ref() {
            match item {
                Ok(_) => ok += 1,
                Err(e) => err = Some(e),
            }
        }
        assert_eq!(ok, 3); // STARTED, RUNNING, record a
        assert!(matches!(err, Some(DatError::Stream { ref stream, .. }) if stream == "docs"));
        assert!(read.next().is_none());
    }

    #[test]
    fn unknown_catalog_stream_is_a_configuration_error() {
        let mut catalog = catalog(ReadSyncMode::FullRefresh);
        catalog.document_streams[0].name = "missing".into();
        let runner = SourceRunner::new("test-source", Arc::new(InMemoryStateManager::new()));
        let stream = Arc::new(FixedStream::new(vec![])) as Arc<dyn Stream>;
        assert!(matches!(
            runner.read(vec![stream], &catalog),
            Err(DatError::Configuration(_))
        ));
    }

    #[test]
    fn incremental_uses_stream_default_cursor() {
        let catalog = catalog(ReadSyncMode::Incremental);
        assert!(catalog.document_streams[0].cursor_field.is_none());
        let runner = SourceRunner::new("test-source", Arc::new(InMemoryStateManager::new()));
        let stream = Arc::new(FixedStream::new(vec![("a", 1)])) as Arc<dyn Stream>;
        assert!(runner.read(vec![stream], &catalog).is_ok());
    }
}
