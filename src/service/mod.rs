//! Service integrations for external APIs and clients.
//!
//! This module contains implementations for the services used by relay-bot:
//! - Chat transports (e.g., the console)
//! - Conversation storage (JSON files or process memory)
//! - LLM services (any OpenAI-compatible chat-completions endpoint)
//!
//! Each service module defines both generic traits and concrete implementations,
//! allowing for extensibility and easy testing.

pub mod chat;
pub mod llm;
pub mod store;
