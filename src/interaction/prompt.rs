//! Assembles the ordered request payload for one turn.

use crate::base::types::{HistoryEntry, PromptMessage, Role};

/// Everything sent to the model for one turn.
///
/// Built per request and dropped with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptContext {
    pub system_prompt: String,
    pub history_window: Vec<HistoryEntry>,
    pub current_text: String,
}

impl PromptContext {
    /// The system entry, then history in chronological order, then the new user message.
    pub fn messages(&self) -> Vec<PromptMessage> {
        let mut messages = Vec::with_capacity(self.history_window.len() + 2);

        messages.push(PromptMessage::new(Role::System, &self.system_prompt));
        messages.extend(self.history_window.iter().map(|entry| PromptMessage::new(entry.role.into(), &entry.content)));
        messages.push(PromptMessage::new(Role::User, &self.current_text));

        messages
    }

    pub fn message_count(&self) -> usize {
        self.history_window.len() + 2
    }
}

/// Compose a prompt. Pure; entries keep the order they were given in.
pub fn build(system_prompt: &str, history: Vec<HistoryEntry>, current_text: &str) -> PromptContext {
    PromptContext {
        system_prompt: system_prompt.to_string(),
        history_window: history,
        current_text: current_text.to_string(),
    }
}
