//! Ralph dashboard server and worker bridge

use clap::Parser;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ralph_dashboard::bridge::{OpenAiBackend, TaskTracker, ToolDispatcher};
use ralph_dashboard::config::{BridgeConfig, Cli, Command, ServerConfig};
use ralph_dashboard::{bridge, router, store, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Command::Worker(config)) => {
            init_tracing(true);
            run_worker(config).await
        }
        Some(Command::Serve(config)) => {
            init_tracing(false);
            run_server(config).await
        }
        None => {
            init_tracing(false);
            run_server(cli.server).await
        }
    }
}

/// stdout carries tool responses in worker mode, so logs go to stderr there
fn init_tracing(stderr: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "ralph_dashboard=debug,tower_http=debug".into());

    if stderr {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

async fn run_server(config: ServerConfig) -> anyhow::Result<()> {
    let options = SqliteConnectOptions::from_str(&config.database_url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    store::migrate(&pool).await?;

    let state = AppState::with_capacity(pool, config.broadcast_capacity);
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    tracing::info!("Server listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;

    Ok(())
}

async fn run_worker(config: BridgeConfig) -> anyhow::Result<()> {
    if config.api_key.is_empty() {
        tracing::warn!("OPENAI_API_KEY is not set; backend calls will be rejected");
    }

    let backend = Arc::new(OpenAiBackend::new(config.openai()));
    let tracker = Arc::new(TaskTracker::with_retention(
        backend,
        config.working_directory(),
        config.retention(),
    ));
    let dispatcher = Arc::new(ToolDispatcher::new(tracker, config.timeout()));

    bridge::serve_stdio(dispatcher).await?;
    tracing::info!("stdin closed, worker bridge exiting");
    Ok(())
}
