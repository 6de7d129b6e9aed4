// ABOUTME: CLI entry point for entity-replicator
// ABOUTME: Loads a job description and drives the orchestrator end to end

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use entity_replicator::connector_file::FileConnector;
use entity_replicator::job::{JobSpec, StoreConfig};
use entity_replicator::remote::{AccessTokenProvider, FileTokenProvider, HttpLockArbiter};
use entity_replicator::report::JsonFileSink;
use entity_replicator::store::MemoryStore;
use entity_replicator::sync::{JobOrchestrator, StoreMode};

#[derive(Parser)]
#[command(name = "entity-replicator")]
#[command(about = "Synchronize external sources into a versioned entity store", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a synchronization job end to end
    Run {
        /// Path to the TOML job description
        #[arg(long)]
        job: PathBuf,
    },
    /// Retract a previously synchronized document (full-scope deletion scan)
    Unmap {
        /// Path to the TOML job description
        #[arg(long)]
        job: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&cli.log)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match cli.command {
        Commands::Run { job } => run_job(&job, false).await,
        Commands::Unmap { job } => run_job(&job, true).await,
    }
}

async fn run_job(path: &Path, unmap: bool) -> anyhow::Result<()> {
    let job = JobSpec::load(path)?;

    let mode = match &job.store {
        StoreConfig::Ephemeral => StoreMode::Ephemeral,
        StoreConfig::Live {
            arbiter_url,
            token_file,
        } => {
            let tokens: Arc<dyn AccessTokenProvider> =
                Arc::new(FileTokenProvider::new(token_file.as_deref())?);
            let _arbiter = HttpLockArbiter::new(arbiter_url.clone(), tokens)?;
            anyhow::bail!(
                "live store mode needs an entity-store client, which this CLI does not bundle; \
                 embed the library with your store implementation, or use mode = \"ephemeral\""
            );
        }
    };

    let connector = match job.source.kind.as_str() {
        "file" => Box::new(FileConnector::new(&job.source.path)),
        other => anyhow::bail!("unknown source kind '{other}' (expected \"file\")"),
    };

    let report_path = job
        .error_report
        .clone()
        .unwrap_or_else(JsonFileSink::default_path);
    let reporter = Arc::new(JsonFileSink::new(&report_path));

    let mut orchestrator = JobOrchestrator::new(
        job,
        Box::new(MemoryStore::new()),
        connector,
        mode,
        reporter,
    );

    let summary = if unmap {
        orchestrator.run_unmap().await
    } else {
        orchestrator.run().await
    }
    .with_context(|| {
        format!(
            "synchronization failed; see the failure report at {}",
            report_path.display()
        )
    })?;

    println!(
        "Synchronized: {} new, {} changed, {} unchanged, {} deleted ({} ms)",
        summary.new, summary.changed, summary.unchanged, summary.deleted, summary.duration_ms
    );
    Ok(())
}
