//! Message handling for relay-bot.
//!
//! This module provides the pieces that turn an incoming chat line into a reply:
//! - Detecting whether the bot was addressed (`mention`)
//! - Assembling the request payload from persona, history and question (`prompt`)
//! - Coordinating store, model and transport for each turn (`orchestrator`)

pub mod mention;
pub mod orchestrator;
pub mod prompt;
