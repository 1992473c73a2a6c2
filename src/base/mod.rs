//! Core components, types, and utilities for the relay-bot.
//!
//! This module contains fundamental building blocks used throughout the application:
//! - Configuration handling and environment variables.
//! - The default persona prompt.
//! - Common types and result handling.
//! - Pipeline events for observers.

pub mod config;
pub mod events;
pub mod prompts;
pub mod types;
