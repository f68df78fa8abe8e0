//! Xiaozhi Gateway - Real-time voice interaction for edge speakers
//!
//! A streaming gateway that mediates VAD → ASR → LLM → TTS for low-power
//! devices over one persistent socket, with:
//! - per-session turn orchestration with barge-in and idle timeout
//! - an intent layer and a plugin/MCP/IoT tool registry
//! - sentence-aware synthesis with paced Opus delivery
//! - chat-history reporting and hot-reloaded remote configuration
//!
//! # Example
//!
//! ```ignore
//! use xiaozhi_gateway::config::Config;
//! use xiaozhi_gateway::server::WebSocketServer;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load(None)?;
//!     let server = WebSocketServer::new(config.clone(), config)?;
//!     server.run(Default::default()).await?;
//!     Ok(())
//! }
//! ```

// Core modules (order matters for cross-module dependencies)
pub mod error;
pub mod utils;
pub mod queue;
pub mod audio;
pub mod dialogue;
pub mod config;
pub mod manage_api;
pub mod auth;
pub mod output_counter;
pub mod providers;
pub mod tools;
pub mod tts;
pub mod session;
pub mod server;
pub mod http_api;

// Re-export commonly used types for convenience
pub use config::Config;
pub use dialogue::{Dialogue, Message, Role};
pub use error::{GatewayError, Result};
pub use server::WebSocketServer;
pub use session::ConnectionHandler;
pub use tools::{ToolResult, ToolType};
pub use tts::{ContentType, SentenceType, TtsMessage};
