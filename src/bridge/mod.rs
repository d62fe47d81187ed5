//! Worker-side bridge: hands delegated tasks to an execution backend and tracks them

pub mod backend;
pub mod context;
pub mod signals;
pub mod tools;
pub mod tracker;

pub use backend::{BackendResponse, ExecutionBackend, OpenAiBackend, OpenAiConfig, TokenUsage};
pub use context::{ContextPackage, Mode};
pub use signals::{interpret, FileModification, Signal};
pub use tools::{serve, serve_stdio, ToolDispatcher};
pub use tracker::{RetentionPolicy, TaskStatus, TaskTracker};
