use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use stepwise_app::state::open_ledger;
use stepwise_app::{router, AppState, ServerConfig};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "stepwise", about = "Agentic run server with streamed step events")]
struct Cli {
    /// Path to the server TOML config
    #[arg(long, env = "STEPWISE_CONFIG", default_value = "stepwise.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve the lane routes (default)
    Serve {
        /// Overrides `listen_addr` from the config
        #[arg(long)]
        listen: Option<String>,
    },
    /// Top up a user's credit balance
    Grant { user: String, credits: i64 },
    /// Print a user's credit balance
    Balance { user: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout stays free for command output
    fmt()
        .with_env_filter(
            EnvFilter::try_from_env("STEPWISE_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ServerConfig::load(&cli.config)?;

    match cli.command.unwrap_or(Command::Serve { listen: None }) {
        Command::Serve { listen } => serve(config, listen).await,
        Command::Grant { user, credits } => {
            if credits <= 0 {
                anyhow::bail!("credits must be positive");
            }
            std::fs::create_dir_all(&config.data_dir)?;
            let balance = open_ledger(&config)?.grant(&user, credits)?;
            println!("{}: {}", user, balance);
            Ok(())
        }
        Command::Balance { user } => {
            std::fs::create_dir_all(&config.data_dir)?;
            println!("{}: {}", user, open_ledger(&config)?.balance(&user)?);
            Ok(())
        }
    }
}

async fn serve(config: ServerConfig, listen: Option<String>) -> Result<()> {
    #[cfg(feature = "prometheus")]
    if let Some(addr) = config.metrics_addr {
        stepwise_runtime::metrics::install_prometheus_exporter(addr)?;
        tracing::info!(%addr, "Prometheus exporter listening");
    }

    let state = AppState::from_config(&config)?;
    let entry = state.entry.clone();
    let app = router(state);

    let addr = listen.unwrap_or_else(|| config.listen_addr.clone());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!(%addr, "Stepwise listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down, no new runs admitted");
            entry.close();
        })
        .await
        .context("HTTP server failed")?;
    Ok(())
}
