//! ralph-hook - forwards host hook events to the Ralph dashboard

mod messages;
mod relay;
mod watch;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_URL: &str = "http://localhost:3200";

#[derive(Parser)]
#[command(name = "ralph-hook")]
#[command(about = "Relay hook events to the Ralph dashboard, or watch its live feed")]
#[command(version)]
struct Cli {
    /// Dashboard base URL, also read from RALPH_DASHBOARD_URL
    #[arg(short, long, env = "CLNODE_URL")]
    url: Option<String>,

    /// Event name; defaults to the payload's hook_event_name
    #[arg(short, long)]
    event: Option<String>,

    /// Do not pass the dashboard's reply back to the hook host on stdout
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Print live pushes until the connection closes
    Watch {
        /// Print raw JSON instead of summaries
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout belongs to the hook host
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ralph_hook=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let cli = Cli::parse();
    let url = cli
        .url
        .or_else(|| std::env::var("RALPH_DASHBOARD_URL").ok())
        .unwrap_or_else(|| DEFAULT_URL.to_string());

    match cli.command {
        Some(Commands::Watch { json }) => watch::run(&url, json).await,
        None => relay::run(&url, cli.event.as_deref(), cli.quiet).await,
    }
}
