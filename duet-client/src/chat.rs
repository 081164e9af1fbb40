use chrono::{DateTime, Utc};
use duet_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// One line of in-call chat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub sender_name: String,
    pub text: String,
    /// Written by this client (optimistic echo) rather than received
    pub is_local: bool,
    pub sent_at: DateTime<Utc>,
}

/// In-memory chat history for the lifetime of one session
#[derive(Debug, Default, Clone)]
pub struct ChatLog {
    messages: Vec<ChatMessage>,
}

impl ChatLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message typed locally. Blank text is rejected.
    pub fn push_local(&mut self, sender_name: &str, text: &str) -> Result<&ChatMessage> {
        if text.trim().is_empty() {
            return Err(Error::InvalidInput("Chat message is empty".to_string()));
        }
        Ok(self.push(sender_name, text, true))
    }

    /// Append a message relayed from the peer
    pub fn push_remote(&mut self, sender_name: &str, text: &str) -> &ChatMessage {
        self.push(sender_name, text, false)
    }

    fn push(&mut self, sender_name: &str, text: &str, is_local: bool) -> &ChatMessage {
        self.messages.push(ChatMessage {
            sender_name: sender_name.to_string(),
            text: text.to_string(),
            is_local,
            sent_at: Utc::now(),
        });
        &self.messages[self.messages.len() - 1]
    }

    #[must_use]
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}
