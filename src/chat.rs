//! Per-friend chat history kept in memory.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::call::is_sentinel;
use crate::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    /// Email of the author.
    pub sender: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(sender: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Oldest messages are dropped once `limit` is reached.
#[derive(Debug, Clone)]
pub struct ChatLog {
    limit: usize,
    messages: VecDeque<ChatMessage>,
}

impl ChatLog {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            messages: VecDeque::new(),
        }
    }

    pub fn push(&mut self, message: ChatMessage) {
        if self.messages.len() == self.limit {
            self.messages.pop_front();
        }
        self.messages.push_back(message);
    }

    pub fn messages(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Chat logs keyed by friend email.
#[derive(Debug, Clone)]
pub struct ChatBook {
    limit: usize,
    logs: HashMap<String, ChatLog>,
}

impl ChatBook {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            logs: HashMap::new(),
        }
    }

    pub fn push(&mut self, friend: &str, message: ChatMessage) {
        let limit = self.limit;
        self.logs
            .entry(friend.to_string())
            .or_insert_with(|| ChatLog::new(limit))
            .push(message);
    }

    pub fn log(&self, friend: &str) -> Option<&ChatLog> {
        self.logs.get(friend)
    }
}

/// Trims outgoing text and refuses what must not go out as chat.
pub fn validate_outgoing(text: &str) -> Result<String, Error> {
    let text = text.trim();
    if text.is_empty() {
        return Err(Error::Validation("message is empty".to_string()));
    }
    if is_sentinel(text) {
        return Err(Error::Validation(format!("{:?} is reserved for calls", text)));
    }
    Ok(text.to_string())
}
