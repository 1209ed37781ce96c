//! # `dat` CLI
//!
//! Drives connectors over the NDJSON envelope protocol. Each command that
//! produces envelopes writes them to stdout, one per line; logs go to
//! stderr.
//!
//! ## Usage
//!
//! ```bash
//! dat spec --connector filesystem
//! dat check --config source.json --role source
//! dat discover --config source.json > catalog.json
//! dat read --config source.json --catalog catalog.json \
//!   | dat generate --config embed.toml \
//!   | dat write --config sqlite.json --catalog catalog.json
//! dat run --config pipeline.toml
//! ```
//!
//! ## Commands
//!
//! | Command | Output |
//! |---------|--------|
//! | `dat spec` | `SPEC` envelope for a connector |
//! | `dat check` | `CONNECTION_STATUS` envelope |
//! | `dat discover` | `CATALOG` envelope |
//! | `dat read` | `STATE`, `RECORD` and `LOG` envelopes; `TRACE` on failure |
//! | `dat generate` | stdin envelopes with vectors filled in |
//! | `dat write` | `STATE` and progress `LOG` envelopes |
//! | `dat run` | the destination's `STATE` and `LOG` envelopes |
//! | `dat connectors` | registered connectors, one per line |

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use tokio::io::BufReader;

use dat::commands;
use dat::config::{load_catalog, load_connector_config, load_state_file};
use dat::logging;
use dat::registry::{ConnectorRegistry, Role};

/// dat: sync documents from sources through embedding generators into
/// vector destinations.
#[derive(Parser)]
#[command(name = "dat", version, about)]
struct Cli {
    /// Log level when `RUST_LOG` is unset (logs go to stderr).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a connector's specification.
    Spec {
        /// Registered connector name, any role.
        #[arg(long)]
        connector: String,
    },

    /// Check that a connector can reach its backend.
    Check {
        /// Connector configuration (`.toml` or JSON).
        #[arg(long)]
        config: PathBuf,

        /// Which registry to look the connector up in.
        #[arg(long, value_enum, default_value = "source")]
        role: Role,
    },

    /// Print the catalog of streams a source offers.
    Discover {
        #[arg(long)]
        config: PathBuf,
    },

    /// Read the catalog's streams from a source.
    Read {
        #[arg(long)]
        config: PathBuf,

        /// Catalog selecting streams and sync modes.
        #[arg(long)]
        catalog: PathBuf,

        /// Prior state per namespace; overrides the persisted state.
        #[arg(long)]
        state: Option<PathBuf>,

        /// Where checkpoints are persisted.
        #[arg(long, default_value = ".")]
        state_dir: PathBuf,
    },

    /// Fill in vectors for envelopes read from stdin.
    Generate {
        #[arg(long)]
        config: PathBuf,
    },

    /// Load envelopes read from stdin into a destination.
    Write {
        #[arg(long)]
        config: PathBuf,

        #[arg(long)]
        catalog: PathBuf,
    },

    /// Run source, generator and destination in one process.
    Run {
        /// Pipeline configuration (TOML).
        #[arg(long)]
        config: PathBuf,

        /// Catalog to use instead of the configured one or discovery.
        #[arg(long)]
        catalog: Option<PathBuf>,
    },

    /// List registered connectors.
    Connectors,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level);

    let registry = ConnectorRegistry::builtin();

    match cli.command {
        Commands::Spec { connector } => {
            let msg = commands::spec(&registry, &connector)?;
            commands::write_message(&mut std::io::stdout().lock(), &msg)?;
        }
        Commands::Check { config, role } => {
            let config = load_connector_config(&config)?;
            let msg = commands::check(&registry, &config, role).await;
            commands::write_message(&mut std::io::stdout().lock(), &msg)?;
        }
        Commands::Discover { config } => {
            let config = load_connector_config(&config)?;
            let msg = commands::discover(&registry, &config).await?;
            commands::write_message(&mut std::io::stdout().lock(), &msg)?;
        }
        Commands::Read {
            config,
            catalog,
            state,
            state_dir,
        } => {
            let config = load_connector_config(&config)?;
            let catalog = load_catalog(&catalog)?;
            let initial_state = match state {
                Some(path) => load_state_file(&path)?,
                None => Default::default(),
            };
            // Streams read synchronously; keep them off the async workers.
            let written = tokio::task::spawn_blocking(move || {
                let stdout = std::io::stdout();
                let mut out = std::io::BufWriter::new(stdout.lock());
                commands::read(
                    &registry,
                    &config,
                    &catalog,
                    initial_state,
                    &state_dir,
                    &mut out,
                )
            })
            .await??;
            tracing::info!(envelopes = written, "read complete");
        }
        Commands::Generate { config } => {
            let config = load_connector_config(&config)?;
            let input = BufReader::new(tokio::io::stdin());
            let mut out = tokio::io::stdout();
            let written = commands::generate(&registry, &config, input, &mut out).await?;
            tracing::info!(envelopes = written, "generate complete");
        }
        Commands::Write { config, catalog } => {
            let config = load_connector_config(&config)?;
            let catalog = load_catalog(&catalog)?;
            let input = BufReader::new(tokio::io::stdin());
            let mut out = tokio::io::stdout();
            let loaded = commands::write(&registry, &config, &catalog, input, &mut out).await?;
            tracing::info!(records = loaded, "write complete");
        }
        Commands::Run { config, catalog } => {
            let mut out = tokio::io::stdout();
            let report = commands::run(&registry, &config, catalog.as_deref(), &mut out).await?;
            tracing::info!(
                run_id = %report.run_id,
                read = report.records_read,
                generated = report.records_generated,
                loaded = report.records_loaded,
                "pipeline complete"
            );
        }
        Commands::Connectors => {
            let stdout = std::io::stdout();
            let mut out = stdout.lock();
            for line in commands::connectors(&registry) {
                writeln!(out, "{}", line)?;
            }
        }
    }

    Ok(())
}
