use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod cmd;

static LOG_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

#[derive(Parser)]
#[command(name = "crucible")]
#[command(version, about = "Stage-gated orchestration engine for externally-run coding agents")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Initialize a crucible project in the current directory
    Init,
    /// Run the engine daemon: change watcher, supervisor, and event hub
    Serve {
        /// Bind address (overrides configuration)
        #[arg(long)]
        bind: Option<String>,
    },
    /// Show stage, gate, task, worker, and budget status
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("resolve current directory")?,
    };

    let console = cli.verbose || matches!(cli.command, Commands::Serve { .. });
    init_tracing(&project_dir.join(".crucible"), console)?;

    match &cli.command {
        Commands::Init => cmd::cmd_init(&project_dir)?,
        Commands::Serve { bind } => cmd::cmd_serve(&project_dir, bind.clone()).await?,
        Commands::Status => cmd::cmd_status(&project_dir)?,
    }

    Ok(())
}

/// Dual-layer logging: optional stderr console plus a daily-rotated JSON
/// file under `.crucible/logs/` once the project exists.
fn init_tracing(crucible_dir: &Path, console: bool) -> Result<()> {
    let filter = match std::env::var("RUST_LOG") {
        Ok(v) if !v.trim().is_empty() => EnvFilter::from_default_env(),
        _ => EnvFilter::new("crucible=info"),
    };

    let file_layer = if crucible_dir.exists() {
        let log_dir = crucible_dir.join("logs");
        std::fs::create_dir_all(&log_dir)
            .with_context(|| format!("create log directory {}", log_dir.display()))?;
        let appender = tracing_appender::rolling::daily(log_dir, "crucible.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);
        let _ = LOG_GUARD.set(guard);
        Some(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
    } else {
        None
    };

    let console_layer = console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(console::colors_enabled_stderr())
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();
    Ok(())
}
