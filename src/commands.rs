//! Implementations of the `dat` subcommands.
//!
//! Every command writes NDJSON envelopes to the writer it is given (stdout
//! in the binary) and nothing else; diagnostics go through `tracing`.
//! Commands that consume envelopes (`generate`, `write`) read them line by
//! line, skipping malformed lines and forwarding unknown message types.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use dat_core::codec::{decode_line, encode_line, Incoming};
use dat_core::connector::{Checkable, Connector};
use dat_core::error::DatError;
use dat_core::loader::{Loader, Writable};
use dat_core::processor::DataProcessor;
use dat_core::protocol::{
    ConnectorSpecification, DatCatalog, DatConnectionStatus, DatMessage, Status, StreamState,
};
use dat_core::source::{Discoverable, Readable, SourceRunner};

use crate::config::{load_pipeline_config, PipelineSettings};
use crate::orchestrator::{PipelineOrchestrator, PipelineReport};
use crate::registry::{ConnectorRegistry, Role};
use crate::retry::{RetryPolicy, RetryingLoader};
use crate::state_file::LocalStateManager;

/// Write one envelope line.
pub fn write_message(out: &mut impl Write, msg: &DatMessage) -> Result<()> {
    out.write_all(encode_line(msg)?.as_bytes())?;
    Ok(())
}

async fn write_incoming<W: AsyncWrite + Unpin>(out: &mut W, item: &Incoming) -> Result<()> {
    out.write_all(item.encode()?.as_bytes()).await?;
    Ok(())
}

/// `dat spec`: the connector's specification as a SPEC envelope.
pub fn spec(registry: &ConnectorRegistry, connector: &str) -> Result<DatMessage> {
    let (_, spec) = registry.find_spec(connector)?;
    Ok(DatMessage::spec(spec))
}

/// `dat check`: a CONNECTION_STATUS envelope. Never fails; lookup and
/// configuration problems come back as `FAILED`.
pub async fn check(
    registry: &ConnectorRegistry,
    config: &ConnectorSpecification,
    role: Role,
) -> DatMessage {
    let status = match role {
        Role::Source => match registry.source(&config.name) {
            Ok(c) => c.check(config).await,
            Err(e) => failed(e),
        },
        Role::Generator => match registry.generator(&config.name) {
            Ok(c) => c.check(config).await,
            Err(e) => failed(e),
        },
        Role::Destination => match registry.destination(&config.name) {
            Ok(c) => c.check(config).await,
            Err(e) => failed(e),
        },
    };
    DatMessage::connection_status(status)
}

fn failed(e: anyhow::Error) -> DatConnectionStatus {
    DatConnectionStatus {
        status: Status::Failed,
        message: Some(DatError::Connection(format!("{:#}", e)).to_string()),
    }
}

/// `dat discover`: the source's catalog as a CATALOG envelope.
pub async fn discover(
    registry: &ConnectorRegistry,
    config: &ConnectorSpecification,
) -> Result<DatMessage> {
    let source = registry.source(&config.name)?;
    let catalog = source
        .discover(config)
        .await
        .with_context(|| format!("Failed to discover '{}'", config.name))?;
    Ok(DatMessage::catalog(catalog))
}

/// `dat read`: run the source over `catalog`, writing every envelope.
///
/// If a stream fails, a TRACE envelope naming it is written before the
/// error is returned.
pub fn read(
    registry: &ConnectorRegistry,
    config: &ConnectorSpecification,
    catalog: &DatCatalog,
    initial_state: HashMap<String, StreamState>,
    state_dir: &Path,
    out: &mut impl Write,
) -> Result<usize> {
    let source = registry.source(&config.name)?;
    let streams = source.streams(config)?;
    let runner = SourceRunner::new(source.name(), Arc::new(LocalStateManager::new(state_dir)))
        .with_initial_state(initial_state);

    let mut written = 0;
    for item in runner.read(streams, catalog)? {
        match item {
            Ok(msg) => {
                write_message(out, &msg)?;
                written += 1;
            }
            Err(e) => {
                let stream = match &e {
                    DatError::Stream { stream, .. } => Some(stream.clone()),
                    _ => None,
                };
                write_message(
                    out,
                    &DatMessage::trace(e.to_string(), stream, Some(format!("{:?}", e))),
                )?;
                out.flush()?;
                return Err(e.into());
            }
        }
    }
    out.flush()?;
    Ok(written)
}

/// `dat generate`: enrich envelopes from `input` with the generator.
pub async fn generate<R, W>(
    registry: &ConnectorRegistry,
    config: &ConnectorSpecification,
    input: R,
    out: &mut W,
) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let generator = registry.generator(&config.name)?;
    let mut lines = input.lines();
    let mut written = 0;

    while let Some(line) = lines.next_line().await? {
        match decode_line(&line) {
            Some(Incoming::Message(msg)) => {
                for enriched in generator.generate(config, msg).await? {
                    write_incoming(out, &Incoming::Message(enriched)).await?;
                    written += 1;
                }
            }
            Some(unknown @ Incoming::Unrecognized(_)) => {
                write_incoming(out, &unknown).await?;
                written += 1;
            }
            None => {}
        }
    }
    out.flush().await?;
    Ok(written)
}

/// `dat write`: load envelopes from `input` into the destination.
pub async fn write<R, W>(
    registry: &ConnectorRegistry,
    config: &ConnectorSpecification,
    catalog: &DatCatalog,
    input: R,
    out: &mut W,
) -> Result<usize>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let destination = registry.destination(&config.name)?;
    let defaults = PipelineSettings::default();
    let inner = destination.loader(config).await?;
    let loader: Arc<dyn Loader> = Arc::new(RetryingLoader::new(
        inner,
        RetryPolicy::new(defaults.max_retries, defaults.retry_base_delay_ms),
    ));
    let mut processor =
        DataProcessor::new(loader, catalog.clone(), destination.batch_size(config))?;

    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        let Some(item) = decode_line(&line) else {
            continue;
        };
        for emitted in processor.handle(item).await? {
            write_incoming(out, &emitted).await?;
        }
    }
    for emitted in processor.finish().await? {
        write_incoming(out, &emitted).await?;
    }
    out.flush().await?;

    Ok(processor.processed().values().sum())
}

/// `dat run`: the whole pipeline in-process, writing the destination's
/// STATE and LOG envelopes once it finishes.
pub async fn run(
    registry: &ConnectorRegistry,
    pipeline_path: &Path,
    catalog_path: Option<&Path>,
    out: &mut (impl AsyncWrite + Unpin),
) -> Result<PipelineReport> {
    let config = load_pipeline_config(pipeline_path)?;
    let orchestrator = PipelineOrchestrator::from_config(registry, &config)?;

    let cancel = orchestrator.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling pipeline");
            cancel.cancel();
        }
    });

    let catalog_path = catalog_path.or(config.catalog.as_deref());
    let catalog = orchestrator.resolve_catalog(catalog_path).await?;
    let report = orchestrator.run(catalog).await?;

    for item in &report.output {
        write_incoming(out, item).await?;
    }
    out.flush().await?;
    Ok(report)
}

/// `dat connectors`: one `role<TAB>name` line per registered connector.
pub fn connectors(registry: &ConnectorRegistry) -> Vec<String> {
    [Role::Source, Role::Generator, Role::Destination]
        .into_iter()
        .flat_map(|role| {
            registry
                .names(role)
                .into_iter()
                .map(move |name| format!("{}\t{}", role.as_str(), name))
        })
        .collect()
}
