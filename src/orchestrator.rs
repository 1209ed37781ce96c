//! In-process source → generator → destination pipeline.
//!
//! ```text
//!  ┌──────────────┐  mpsc(cap)  ┌──────────────┐  mpsc(cap)  ┌────────────────┐
//!  │ source stage │ ──────────▶ │ generator    │ ──────────▶ │ destination    │
//!  │ (blocking    │  DatMessage │ stage        │  DatMessage │ stage          │
//!  │  thread)     │             │ generate_    │             │ DataProcessor  │
//!  │ SourceRunner │             │ batch()      │             │ + RetryingLoader│
//!  └──────────────┘             └──────────────┘             └────────────────┘
//! ```
//!
//! Each stage runs as its own task. Channels are bounded, so a slow
//! destination backpressures the generator and, through it, the source.
//! End of input is signalled by dropping the sender.
//!
//! All stages share one [`CancellationToken`]. The first stage to fail
//! cancels it; the others notice at their next channel operation and stop.
//! [`PipelineOrchestrator::run`] always joins all three stages and returns
//! the failure that started the shutdown.
//!
//! The destination stage collects up to `max_len_rows_buffer` envelopes and
//! writes each full buffer as one batch, flushing it before reading on, so
//! no loader call carries more rows than that. One [`DataProcessor`] serves
//! the whole run; `initiate_sync` and REPLACE wipes still happen once. Each
//! write is bounded by `write_timeout_secs`.

use anyhow::{anyhow, bail, Context, Result};
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use dat_core::codec::Incoming;
use dat_core::generator::Generator;
use dat_core::loader::{Destination, Loader};
use dat_core::processor::DataProcessor;
use dat_core::protocol::{ConnectorSpecification, DatCatalog, DatMessage, MessageType};
use dat_core::source::{Source, SourceRunner};
use dat_core::state::StateManager;

use crate::config::{load_catalog, PipelineConfig, PipelineSettings};
use crate::registry::ConnectorRegistry;
use crate::retry::{RetryPolicy, RetryingLoader};
use crate::state_file::LocalStateManager;

/// A connector together with the configuration it runs with.
pub struct Configured<T: ?Sized> {
    pub connector: Arc<T>,
    pub config: ConnectorSpecification,
}

impl<T: ?Sized> Configured<T> {
    pub fn new(connector: Arc<T>, config: ConnectorSpecification) -> Self {
        Self { connector, config }
    }
}

impl<T: ?Sized> Clone for Configured<T> {
    fn clone(&self) -> Self {
        Self {
            connector: Arc::clone(&self.connector),
            config: self.config.clone(),
        }
    }
}

/// What a finished run did.
#[derive(Debug)]
pub struct PipelineReport {
    pub run_id: String,
    /// RECORD envelopes produced by the source.
    pub records_read: usize,
    /// RECORD envelopes produced by the generator.
    pub records_generated: usize,
    /// Records handed to the destination's loader.
    pub records_loaded: usize,
    /// Envelopes emitted by the destination stage (STATE and LOG), in order.
    pub output: Vec<Incoming>,
}

/// Stage stopped because another stage failed or the run was cancelled.
#[derive(Debug)]
struct StageInterrupted(&'static str);

impl fmt::Display for StageInterrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} stage interrupted", self.0)
    }
}

impl std::error::Error for StageInterrupted {}

pub struct PipelineOrchestrator {
    source: Configured<dyn Source>,
    generator: Configured<dyn Generator>,
    destination: Configured<dyn Destination>,
    state_manager: Arc<dyn StateManager>,
    settings: PipelineSettings,
    run_id: String,
    cancel: CancellationToken,
}

impl PipelineOrchestrator {
    pub fn new(
        source: Configured<dyn Source>,
        generator: Configured<dyn Generator>,
        destination: Configured<dyn Destination>,
        state_manager: Arc<dyn StateManager>,
    ) -> Self {
        Self {
            source,
            generator,
            destination,
            state_manager,
            settings: PipelineSettings::default(),
            run_id: uuid::Uuid::new_v4().to_string(),
            cancel: CancellationToken::new(),
        }
    }

    /// Build from a pipeline file's contents, resolving connectors by name.
    pub fn from_config(registry: &ConnectorRegistry, config: &PipelineConfig) -> Result<Self> {
        let source = registry.source(&config.source.name)?;
        let generator = registry.generator(&config.generator.name)?;
        let destination = registry.destination(&config.destination.name)?;
        Ok(Self::new(
            Configured::new(source, config.source.clone()),
            Configured::new(generator, config.generator.clone()),
            Configured::new(destination, config.destination.clone()),
            Arc::new(LocalStateManager::new(config.state.dir.clone())),
        )
        .with_settings(config.pipeline.clone()))
    }

    pub fn with_settings(mut self, settings: PipelineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Token that stops the run when cancelled (e.g. on Ctrl-C).
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The catalog at `path`, or the source's discovered catalog.
    pub async fn resolve_catalog(&self, path: Option<&Path>) -> Result<DatCatalog> {
        match path {
            Some(path) => load_catalog(path),
            None => self
                .source
                .connector
                .discover(&self.source.config)
                .await
                .with_context(|| format!("Failed to discover '{}'", self.source.config.name)),
        }
    }

    /// Run the pipeline over `catalog` to completion.
    pub async fn run(self, catalog: DatCatalog) -> Result<PipelineReport> {
        self.settings.validate()?;
        let settings = self.settings.clone();

        tracing::info!(
            run_id = %self.run_id,
            source = %self.source.config.name,
            generator = %self.generator.config.name,
            destination = %self.destination.config.name,
            streams = catalog.document_streams.len(),
            "starting pipeline"
        );

        let (source_tx, source_rx) = mpsc::channel::<DatMessage>(settings.channel_capacity);
        let (generated_tx, generated_rx) = mpsc::channel::<DatMessage>(settings.channel_capacity);

        let source_handle = {
            let source = self.source.clone();
            let catalog = catalog.clone();
            let state_manager = Arc::clone(&self.state_manager);
            let run_id = self.run_id.clone();
            let cancel = self.cancel.clone();
            tokio::task::spawn_blocking(move || {
                let result =
                    source_stage(source, catalog, state_manager, run_id, source_tx, &cancel);
                if result.is_err() {
                    cancel.cancel();
                }
                result
            })
        };

        let generator_handle = tokio::spawn(supervised(
            self.cancel.clone(),
            generator_stage(
                self.generator.clone(),
                settings.generator_batch_size,
                source_rx,
                generated_tx,
                self.cancel.clone(),
            ),
        ));

        let destination_handle = tokio::spawn(supervised(
            self.cancel.clone(),
            destination_stage(
                self.destination.clone(),
                catalog,
                settings,
                generated_rx,
                self.cancel.clone(),
            ),
        ));

        let (source_res, generator_res, destination_res) =
            tokio::join!(source_handle, generator_handle, destination_handle);

        let source_res = joined("source", source_res);
        let generator_res = joined("generator", generator_res);
        let destination_res = joined("destination", destination_res);

        match (source_res, generator_res, destination_res) {
            (Ok(records_read), Ok(records_generated), Ok(outcome)) => {
                tracing::info!(
                    run_id = %self.run_id,
                    records_read,
                    records_generated,
                    records_loaded = outcome.loaded,
                    "pipeline finished"
                );
                Ok(PipelineReport {
                    run_id: self.run_id,
                    records_read,
                    records_generated,
                    records_loaded: outcome.loaded,
                    output: outcome.output,
                })
            }
            (s, g, d) => {
                let errors: Vec<(&str, anyhow::Error)> = [
                    ("source", s.err()),
                    ("generator", g.err()),
                    ("destination", d.err()),
                ]
                .into_iter()
                .filter_map(|(stage, e)| e.map(|e| (stage, e)))
                .collect();
                Err(root_cause(errors))
            }
        }
    }
}

/// The first error that isn't an interruption, tagged with its stage.
fn root_cause(errors: Vec<(&str, anyhow::Error)>) -> anyhow::Error {
    let index = errors
        .iter()
        .position(|(_, e)| !e.is::<StageInterrupted>())
        .unwrap_or(0);
    match errors.into_iter().nth(index) {
        Some((stage, e)) => {
            tracing::error!(stage, error = %format!("{:#}", e), "pipeline failed");
            e.context(format!("{} stage failed", stage))
        }
        None => anyhow!("pipeline failed without an error"),
    }
}

fn joined<T>(stage: &str, res: std::result::Result<Result<T>, JoinError>) -> Result<T> {
    match res {
        Ok(inner) => inner,
        Err(e) => Err(anyhow!("{} stage panicked: {}", stage, e)),
    }
}

async fn supervised<T>(cancel: CancellationToken, stage: impl Future<Output = Result<T>>) -> Result<T> {
    let result = stage.await;
    if result.is_err() {
        cancel.cancel();
    }
    result
}

fn source_stage(
    source: Configured<dyn Source>,
    catalog: DatCatalog,
    state_manager: Arc<dyn StateManager>,
    run_id: String,
    tx: mpsc::Sender<DatMessage>,
    cancel: &CancellationToken,
) -> Result<usize> {
    let streams = source.connector.streams(&source.config)?;
    let runner = SourceRunner::new(source.connector.name(), state_manager).with_run_id(run_id);

    let mut records = 0;
    for item in runner.read(streams, &catalog)? {
        if cancel.is_cancelled() {
            return Err(StageInterrupted("source").into());
        }
        let msg = item?;
        if msg.kind == MessageType::Record {
            records += 1;
        }
        tx.blocking_send(msg)
            .map_err(|_| StageInterrupted("source"))?;
    }
    tracing::debug!(records, "source stage finished");
    Ok(records)
}

async fn forward(
    tx: &mpsc::Sender<DatMessage>,
    msg: DatMessage,
    cancel: &CancellationToken,
) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(StageInterrupted("generator").into()),
        sent = tx.send(msg) => sent.map_err(|_| StageInterrupted("generator").into()),
    }
}

async fn generate_and_forward(
    generator: &Configured<dyn Generator>,
    batch: Vec<DatMessage>,
    tx: &mpsc::Sender<DatMessage>,
    cancel: &CancellationToken,
) -> Result<usize> {
    if batch.is_empty() {
        return Ok(0);
    }
    let generated = tokio::select! {
        _ = cancel.cancelled() => return Err(StageInterrupted("generator").into()),
        out = generator.connector.generate_batch(&generator.config, batch) => out?,
    };
    let records = generated
        .iter()
        .filter(|m| m.kind == MessageType::Record)
        .count();
    for msg in generated {
        forward(tx, msg, cancel).await?;
    }
    Ok(records)
}

/// Drain ready envelopes in groups of up to `batch_size` records. Each
/// non-RECORD envelope flushes the records before it and is forwarded in
/// place.
async fn generator_stage(
    generator: Configured<dyn Generator>,
    batch_size: usize,
    mut rx: mpsc::Receiver<DatMessage>,
    tx: mpsc::Sender<DatMessage>,
    cancel: CancellationToken,
) -> Result<usize> {
    let mut generated = 0;
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Err(StageInterrupted("generator").into()),
            next = rx.recv() => next,
        };
        let Some(first) = next else { break };

        let mut ready = vec![first];
        while ready.len() < batch_size {
            match rx.try_recv() {
                Ok(msg) => ready.push(msg),
                Err(_) => break,
            }
        }

        let mut pending = Vec::new();
        for msg in ready {
            if msg.kind == MessageType::Record {
                pending.push(msg);
            } else {
                generated +=
                    generate_and_forward(&generator, std::mem::take(&mut pending), &tx, &cancel)
                        .await?;
                forward(&tx, msg, &cancel).await?;
            }
        }
        generated += generate_and_forward(&generator, pending, &tx, &cancel).await?;
    }
    tracing::debug!(generated, "generator stage finished");
    Ok(generated)
}

struct DestinationOutcome {
    loaded: usize,
    output: Vec<Incoming>,
}

/// Run one destination write, bounded by `timeout` and the cancel token.
async fn bounded<T>(
    timeout: Duration,
    cancel: &CancellationToken,
    write: impl Future<Output = dat_core::Result<T>>,
) -> Result<T> {
    tokio::select! {
        _ = cancel.cancelled() => Err(StageInterrupted("destination").into()),
        res = tokio::time::timeout(timeout, write) => match res {
            Ok(written) => Ok(written?),
            Err(_) => bail!("destination write timed out after {}s", timeout.as_secs()),
        },
    }
}

async fn destination_stage(
    destination: Configured<dyn Destination>,
    catalog: DatCatalog,
    settings: PipelineSettings,
    mut rx: mpsc::Receiver<DatMessage>,
    cancel: CancellationToken,
) -> Result<DestinationOutcome> {
    let inner = destination.connector.loader(&destination.config).await?;
    let policy = RetryPolicy::new(settings.max_retries, settings.retry_base_delay_ms);
    let loader: Arc<dyn Loader> = Arc::new(RetryingLoader::new(inner, policy));
    let batch_size = settings
        .batch_size
        .unwrap_or_else(|| destination.connector.batch_size(&destination.config));
    let mut processor = DataProcessor::new(loader, catalog, batch_size)?;

    let timeout = Duration::from_secs(settings.write_timeout_secs);
    let mut buffer: Vec<Incoming> = Vec::with_capacity(settings.max_len_rows_buffer);
    let mut output = Vec::new();

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return Err(StageInterrupted("destination").into()),
            next = rx.recv() => next,
        };
        let Some(msg) = next else { break };
        buffer.push(Incoming::Message(msg));
        if buffer.len() >= settings.max_len_rows_buffer {
            let batch = std::mem::take(&mut buffer);
            output.extend(bounded(timeout, &cancel, processor.process(batch)).await?);
        }
    }
    output.extend(bounded(timeout, &cancel, processor.process(buffer)).await?);

    let loaded = processor.processed().values().sum();
    tracing::debug!(loaded, "destination stage finished");
    Ok(DestinationOutcome { loaded, output })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dat_core::connector::{Checkable, Connector};
    use dat_core::protocol::{Data, DatDocumentMessage, DatDocumentStream, LogLevel, StreamMetadata};
    use std::sync::Mutex;

    /// Records the size of every batch it is handed.
    #[derive(Default)]
    struct Recording {
        batches: Mutex<Vec<usize>>,
    }

    impl Connector for Recording {
        fn name(&self) -> &str {
            "recording"
        }
        fn spec(&self) -> ConnectorSpecification {
            ConnectorSpecification::new("recording", serde_json::json!({}))
        }
    }

    #[async_trait]
    impl Checkable for Recording {
        async fn check_connection(
            &self,
            _config: &ConnectorSpecification,
        ) -> Result<(bool, Option<String>)> {
            Ok((true, None))
        }
    }

    #[async_trait]
    impl Generator for Recording {
        async fn generate(
            &self,
            _config: &ConnectorSpecification,
            message: DatMessage,
        ) -> Result<Vec<DatMessage>> {
            Ok(vec![message])
        }

        async fn generate_batch(
            &self,
            _config: &ConnectorSpecification,
            messages: Vec<DatMessage>,
        ) -> Result<Vec<DatMessage>> {
            self.batches.lock().unwrap().push(messages.len());
            Ok(messages)
        }
    }

    fn record(text: &str) -> DatMessage {
        DatMessage::record(DatDocumentMessage::new(
            DatDocumentStream::new("docs"),
            Data::new(text, StreamMetadata::default()),
        ))
    }

    #[tokio::test]
    async fn generator_stage_batches_and_keeps_position() {
        let recording = Arc::new(Recording::default());
        let generator: Configured<dyn Generator> = Configured::new(
            recording.clone() as Arc<dyn Generator>,
            ConnectorSpecification::new("recording", serde_json::json!({})),
        );

        let (in_tx, in_rx) = mpsc::channel(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        for msg in [
            record("a"),
            record("b"),
            record("c"),
            DatMessage::log(LogLevel::Info, "marker"),
            record("d"),
        ] {
            in_tx.send(msg).await.unwrap();
        }
        drop(in_tx);

        let generated = generator_stage(generator, 2, in_rx, out_tx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(generated, 4);

        let mut kinds = Vec::new();
        while let Some(msg) = out_rx.recv().await {
            kinds.push(match msg.as_record() {
                Some(r) => r.data.document_chunk.clone(),
                None => "LOG".to_string(),
            });
        }
        assert_eq!(kinds, vec!["a", "b", "c", "LOG", "d"]);
        // Everything was ready at once: [a, b] fills a batch, then [c] is
        // flushed by the LOG, then [d] on its own.
        assert_eq!(*recording.batches.lock().unwrap(), vec![2, 1, 1]);
    }

    #[tokio::test]
    async fn cancelled_generator_stage_reports_interruption() {
        let generator: Configured<dyn Generator> = Configured::new(
            Arc::new(Recording::default()) as Arc<dyn Generator>,
            ConnectorSpecification::new("recording", serde_json::json!({})),
        );
        let (_in_tx, in_rx) = mpsc::channel(1);
        let (out_tx, _out_rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = generator_stage(generator, 4, in_rx, out_tx, cancel)
            .await
            .unwrap_err();
        assert!(err.is::<StageInterrupted>());
    }

    #[test]
    fn root_cause_skips_interruptions() {
        let errors = vec![
            ("source", anyhow::Error::new(StageInterrupted("source"))),
            ("destination", anyhow!("disk full")),
        ];
        let err = root_cause(errors);
        assert_eq!(err.to_string(), "destination stage failed");
        assert_eq!(err.root_cause().to_string(), "disk full");
    }
}
