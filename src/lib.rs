//! Multi-provider LLM backend: provider adapters, an internet-search tool, a
//! bounded tool-calling generation loop and SQLite-backed chat sessions.

pub mod adapters;
pub mod config;
pub mod domain;
pub mod error;
pub mod service;
pub mod storage;

pub use adapters::{get_adapter, Provider};
pub use config::{Config, ConfigManager};
pub use domain::controller::{GenerationController, MAX_ITERATIONS};
pub use domain::models::StreamEvent;
pub use domain::orchestrator::ToolOrchestrator;
pub use error::{GatewayError, GenerationError};
pub use service::{ChatReply, ChatRequest, ChatService};
pub use storage::Storage;

use tracing_subscriber::EnvFilter;

/// Installs a compact fmt subscriber. `RUST_LOG` wins over `default_level`.
/// Calling it twice is harmless.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}
