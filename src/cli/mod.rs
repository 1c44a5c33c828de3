//! CLI entrypoint
//!
//! Two subcommands: `serve` runs the control plane, `validate` loads the
//! configuration and every definition and exits. Exit codes distinguish
//! configuration failures (2) from runtime failures (1).

use crate::config::{Config, DefinitionStore};
use crate::core::create_runtime;
use crate::{MusterError, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "muster", version, about = "MCP aggregation control plane")]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control plane
    Serve {
        /// Configuration file
        #[arg(short, long, env = "MUSTER_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Validate configuration and definitions, then exit
    Validate {
        /// Configuration file
        #[arg(short, long, env = "MUSTER_CONFIG")]
        config: Option<PathBuf>,
    },
}

/// Exit code for configuration errors (startup failure)
pub const EXIT_CONFIG: i32 = 2;
/// Exit code for runtime failures
pub const EXIT_RUNTIME: i32 = 1;

pub async fn run() -> i32 {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config } => {
            let config = match load_config(config) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("configuration error: {}", e);
                    return EXIT_CONFIG;
                }
            };
            match serve(config).await {
                Ok(()) => 0,
                Err(e) => {
                    eprintln!("fatal: {}", e);
                    EXIT_RUNTIME
                }
            }
        }
        Commands::Validate { config } => match validate(config) {
            Ok(count) => {
                println!("configuration OK, {} definitions valid", count);
                0
            }
            Err(e) => {
                eprintln!("validation failed: {}", e);
                EXIT_CONFIG
            }
        },
    }
}

fn load_config(path: Option<PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path),
        None => Ok(Config::default()),
    }
}

fn validate(path: Option<PathBuf>) -> Result<usize> {
    let config = load_config(path)?;
    let store = DefinitionStore::new();
    let mut count = 0;
    if let Some(ref dir) = config.definitions_dir {
        count = store.load_dir(std::path::Path::new(dir))?.len();
    }
    Ok(count)
}

async fn serve(config: Config) -> Result<()> {
    // A bad config is a startup failure; everything after this point is a
    // runtime failure.
    let runtime = create_runtime(config)
        .await
        .map_err(|e| MusterError::config(e.to_string()))?;

    if let Some(ref dir) = runtime.config.definitions_dir {
        crate::reconciler::spawn_definition_watcher(
            std::path::Path::new(dir),
            runtime.reconciler.clone(),
            runtime.cancel.child_token(),
        )?;
    }
    runtime.reconciler.trigger_full_sync();

    let state = crate::http::AppState {
        aggregator: runtime.aggregator.clone(),
        challenges: runtime.challenges.clone(),
        config: runtime.config.clone(),
    };

    let shutdown = shutdown_signal();
    crate::http::serve(state, shutdown).await?;

    runtime.shutdown().await;
    Ok(())
}

/// Resolve on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("cannot install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}
