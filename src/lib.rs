//! Library root for `relay-bot`.
//!
//! Relay-bot is an LLM-powered participant for live chat streams designed to:
//! - Answer only when it is addressed by name (or, optionally, greeted)
//! - Remember a short, time-bounded conversation per participant
//! - Relay each question plus its context to an OpenAI-compatible model
//! - Keep per-participant replies in arrival order
//!
//! The bot integrates with a chat transport for input and output, a
//! conversation store for memory, and a chat-completions endpoint for answers.
//! The architecture is built around extensible traits that allow for different
//! implementations of each service.

pub mod base;
pub mod interaction;
pub mod prelude;
pub mod runtime;
pub mod service;

use base::{config::Config, types::Void};
use tracing::info;

pub use runtime::{Runtime, RuntimeOptions};

/// Public async entry for the binary crate.
///
/// Creates the runtime context with store, LLM, and chat clients, then runs
/// the intake loop until the transport closes or the process is interrupted.
pub async fn start(config: Config, options: RuntimeOptions) -> Void {
    info!("Starting relay-bot ...");

    // Initialize the runtime.
    let runtime = Runtime::new(config, options)?;

    // Start the runtime.
    runtime.start().await?;

    Ok(())
}
