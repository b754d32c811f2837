//! CLI Entry Point for rust-ingest
//!
//! # Usage
//!
//! Live ingest from the configured metadata bus and correlator ranks:
//! ```bash
//! rust_ingest run --config config/ingest.toml
//! ```
//!
//! Drive the same pipeline from simulated sources:
//! ```bash
//! rust_ingest simulate --config config/ingest.toml --cycles 20
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use rust_ingest::config::IngestConfig;
use rust_ingest::ingest::{
    MetadataChannel, MetadataSubscriber, StreamMerger, VisibilityChannel, VisibilityReceiver,
};
use rust_ingest::logging;
use rust_ingest::mock::{SimulationParams, Simulator};
use rust_ingest::monitoring::{server, MonitoringStore};
use rust_ingest::pipeline::{LoggingSink, StageContext, StageRegistry, TaskPipeline};

#[derive(Parser)]
#[command(name = "rust_ingest")]
#[command(about = "Correlator ingest pipeline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest from the configured metadata bus and correlator ranks
    Run {
        /// Configuration file (TOML format)
        #[arg(long)]
        config: PathBuf,

        /// Stop after this many integrations (overrides the configuration)
        #[arg(long)]
        max_integrations: Option<u64>,
    },

    /// Run the pipeline against simulated metadata and correlator ranks
    Simulate {
        /// Configuration file (TOML format)
        #[arg(long)]
        config: PathBuf,

        /// Number of integration cycles to simulate
        #[arg(long, default_value = "10")]
        cycles: u64,

        /// Half-width of the uniform noise added to every sample
        #[arg(long, default_value = "0.0")]
        noise: f32,

        /// Wall-clock pause between simulated cycles in milliseconds
        #[arg(long, default_value = "0")]
        pacing_ms: u64,
    },

    /// List the stage types that may appear in `[[stages]]`
    Stages,
}

/// Where chunks come from.
enum Source {
    Live,
    Simulated(SimulationParams, u64),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            max_integrations,
        } => {
            let mut config = load_config(&config)?;
            if max_integrations.is_some() {
                config.pipeline.max_integrations = max_integrations;
            }
            run_ingest(config, Source::Live).await
        }
        Commands::Simulate {
            config,
            cycles,
            noise,
            pacing_ms,
        } => {
            let mut config = load_config(&config)?;
            config.pipeline.max_integrations = Some(cycles);
            let params = SimulationParams {
                noise,
                pacing: (pacing_ms > 0).then(|| Duration::from_millis(pacing_ms)),
                ..SimulationParams::default()
            };
            run_ingest(config, Source::Simulated(params, cycles)).await
        }
        Commands::Stages => {
            for name in StageRegistry::new().list() {
                println!("{}", name);
            }
            Ok(())
        }
    }
}

fn load_config(path: &Path) -> Result<IngestConfig> {
    let config = IngestConfig::load_from(path)
        .with_context(|| format!("loading configuration from {}", path.display()))?;
    config.validate().context("validating configuration")?;
    logging::init_from_config(&config)?;
    Ok(config)
}

async fn run_ingest(config: IngestConfig, source: Source) -> Result<()> {
    info!(
        application = %config.application.name,
        array = %config.array.name,
        antennas = config.array.antennas.len(),
        ranks = config.visibility.ranks.len(),
        "Ingest starting"
    );

    let monitoring = Arc::new(MonitoringStore::new());
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let monitor_task = match &config.monitoring.address {
        Some(address) => {
            let listener = TcpListener::bind(address)
                .await
                .with_context(|| format!("binding monitoring service to {}", address))?;
            let store = Arc::clone(&monitoring);
            Some(tokio::spawn(server::serve(listener, store, async move {
                let _ = shutdown_rx.await;
            })))
        }
        None => None,
    };

    let metadata = Arc::new(MetadataChannel::new(config.metadata.buffer_size));
    let visibility = Arc::new(VisibilityChannel::from_config(&config.visibility));
    let stop = Arc::new(AtomicBool::new(false));

    match source {
        Source::Live => {
            MetadataSubscriber::new(&config.metadata)
                .spawn(Arc::clone(&metadata), Arc::clone(&stop))
                .context("starting metadata receiver")?;
            for receiver in VisibilityReceiver::from_config(&config.visibility) {
                receiver
                    .spawn(Arc::clone(&visibility), Arc::clone(&stop))
                    .context("starting visibility receiver")?;
            }
        }
        Source::Simulated(params, cycles) => {
            Simulator::new(&config, params)?
                .spawn(
                    cycles,
                    Arc::clone(&metadata),
                    Arc::clone(&visibility),
                    Arc::clone(&stop),
                )
                .context("starting simulator")?;
        }
    }

    let ctx = StageContext::new(config.array.clone(), Arc::clone(&monitoring))?;
    let merger = StreamMerger::new(&config, metadata, visibility)?;
    let mut pipeline = TaskPipeline::from_config(
        &config,
        &StageRegistry::new(),
        &ctx,
        merger,
        Box::new(LoggingSink::default()),
    )?;

    let abort = pipeline.abort_handle();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current cycle");
            abort.store(true, Ordering::SeqCst);
        }
    });

    let result = tokio::task::spawn_blocking(move || pipeline.run())
        .await
        .context("pipeline thread panicked")?;

    stop.store(true, Ordering::SeqCst);
    let _ = shutdown_tx.send(());
    if let Some(task) = monitor_task {
        match task.await {
            Ok(Err(e)) => warn!(error = %e, "Monitoring service failed"),
            Err(e) => warn!(error = %e, "Monitoring service task failed"),
            Ok(Ok(())) => {}
        }
    }

    match result {
        Ok(stats) => {
            info!(
                cycles = stats.cycles,
                empty_polls = stats.empty_polls,
                "Ingest finished"
            );
            Ok(())
        }
        Err(e) => {
            error!(category = e.category(), error = %e, "Ingest stopped on fatal error");
            Err(e.into())
        }
    }
}
