//! Command line and environment configuration

use clap::{Args, Parser, Subcommand};
use std::time::Duration;

use crate::bridge::backend::{self, OpenAiConfig};
use crate::bridge::RetentionPolicy;

#[derive(Parser, Debug)]
#[command(name = "ralph-dashboard")]
#[command(about = "Delegation lifecycle tracker for CEO/worker agents")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub server: ServerConfig,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the dashboard server (default)
    Serve(ServerConfig),

    /// Run the worker bridge, serving tool calls on stdin/stdout
    Worker(BridgeConfig),
}

#[derive(Args, Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind
    #[arg(long, env = "RALPH_DASHBOARD_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to bind
    #[arg(long, env = "RALPH_DASHBOARD_PORT", default_value_t = 3200)]
    pub port: u16,

    /// SQLite database URL; the file is created if missing
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite:ralph.db")]
    pub database_url: String,

    /// Pushes buffered per observer before it starts lagging
    #[arg(long, default_value_t = crate::publisher::DEFAULT_CAPACITY)]
    pub broadcast_capacity: usize,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Args, Debug, Clone)]
pub struct BridgeConfig {
    #[arg(long, env = "OPENAI_API_KEY", default_value = "", hide_env_values = true)]
    pub api_key: String,

    #[arg(long, env = "OPENAI_BASE_URL", default_value = backend::DEFAULT_BASE_URL)]
    pub base_url: String,

    #[arg(long, env = "CEO_RALPH_CODEX_MODEL", default_value = backend::DEFAULT_MODEL)]
    pub model: String,

    #[arg(long, env = "CEO_RALPH_MAX_TOKENS", default_value_t = backend::DEFAULT_MAX_TOKENS)]
    pub max_tokens: u32,

    #[arg(long, default_value_t = backend::DEFAULT_TEMPERATURE)]
    pub temperature: f32,

    /// Upper bound on a single execute_task call
    #[arg(long, default_value_t = 600)]
    pub timeout_secs: u64,

    /// Most tasks kept in memory
    #[arg(long, default_value_t = 256)]
    pub max_tasks: usize,

    /// How long finished tasks stay queryable
    #[arg(long, default_value_t = 3600)]
    pub task_ttl_secs: u64,

    /// Used when a context package does not name one; defaults to the current directory
    #[arg(long)]
    pub working_directory: Option<String>,
}

impl BridgeConfig {
    pub fn openai(&self) -> OpenAiConfig {
        OpenAiConfig {
            api_key: self.api_key.clone(),
            base_url: self.base_url.clone(),
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }

    pub fn retention(&self) -> RetentionPolicy {
        RetentionPolicy {
            ttl: Duration::from_secs(self.task_ttl_secs),
            max_tasks: self.max_tasks,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn working_directory(&self) -> String {
        self.working_directory.clone().unwrap_or_else(|| {
            std::env::current_dir()
                .map(|dir| dir.display().to_string())
                .unwrap_or_else(|_| ".".to_string())
        })
    }
}
