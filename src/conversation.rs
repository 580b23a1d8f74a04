//! Conversation memory with a token budget
//!
//! One conversation per call. The system prompt is pinned as the first
//! message and survives every truncation; when the budget would overflow,
//! the oldest user/assistant messages are evicted first. Token counts use
//! the ~4-characters-per-token estimate.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::types::{CallId, ChatMessage, Role};

/// Reserved headroom below `max_tokens` for the next reply
pub const TOKEN_BUFFER: u32 = 200;

/// Rough token estimate: ~4 characters per token, minimum 1 for non-empty
/// text
pub fn estimate_tokens(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }
    ((text.chars().count() as u32) / 4).max(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationState {
    Active,
    Ended,
}

/// One stored message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub role: Role,
    pub content: String,
    pub tokens: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Bounded conversation memory for one call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub call_id: CallId,
    pub conversation_id: String,
    pub state: ConversationState,
    pub messages: Vec<ConversationMessage>,
    pub total_tokens: u32,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    #[serde(skip, default = "default_max_tokens")]
    max_tokens: u32,
}

fn default_max_tokens() -> u32 {
    4000
}

impl Conversation {
    /// Create a conversation seeded with the system prompt
    pub fn new(call_id: CallId, system_prompt: &str, max_tokens: u32) -> Self {
        let now = Utc::now();
        let system = ConversationMessage {
            role: Role::System,
            content: system_prompt.to_string(),
            tokens: estimate_tokens(system_prompt),
            timestamp: now,
            metadata: HashMap::new(),
        };
        let total_tokens = system.tokens;
        Self {
            conversation_id: Uuid::new_v4().to_string(),
            call_id,
            state: ConversationState::Active,
            messages: vec![system],
            total_tokens,
            created_at: now,
            last_activity: now,
            max_tokens,
        }
    }

    /// Restore the budget after deserialization (it is not persisted)
    pub fn set_max_tokens(&mut self, max_tokens: u32) {
        self.max_tokens = max_tokens;
    }

    /// Append a message, truncating oldest-first to honor the budget.
    /// The system message is never evicted while the conversation lives.
    pub fn add_message(&mut self, role: Role, content: impl Into<String>) {
        self.add_message_with_metadata(role, content, HashMap::new())
    }

    pub fn add_message_with_metadata(
        &mut self,
        role: Role,
        content: impl Into<String>,
        metadata: HashMap<String, String>,
    ) {
        let mut content = content.into();
        let mut tokens = estimate_tokens(&content);

        let budget = self.max_tokens.saturating_sub(TOKEN_BUFFER.min(self.max_tokens / 4));
        let system_tokens = self.messages.first().map(|m| m.tokens).unwrap_or(0);

        // A single message can never exceed what the budget leaves beside
        // the pinned system prompt
        let message_cap = budget.saturating_sub(system_tokens).max(1);
        if tokens > message_cap {
            content = content
                .chars()
                .take((message_cap * 4) as usize)
                .collect();
            tokens = estimate_tokens(&content);
        }

        if self.total_tokens + tokens > budget {
            self.truncate(budget.saturating_sub(tokens));
        }

        self.messages.push(ConversationMessage {
            role,
            content,
            tokens,
            timestamp: Utc::now(),
            metadata,
        });
        self.total_tokens += tokens;
        self.last_activity = Utc::now();
    }

    /// Evict oldest non-system messages until `total_tokens <= target`
    fn truncate(&mut self, target: u32) {
        let system = if self
            .messages
            .first()
            .map(|m| m.role == Role::System)
            .unwrap_or(false)
        {
            Some(self.messages.remove(0))
        } else {
            None
        };

        let system_tokens = system.as_ref().map(|m| m.tokens).unwrap_or(0);
        while !self.messages.is_empty() && self.total_tokens > target.max(system_tokens) {
            let removed = self.messages.remove(0);
            self.total_tokens -= removed.tokens;
            debug!(
                call_id = %self.call_id,
                role = %removed.role,
                tokens = removed.tokens,
                "evicted oldest message to honor token budget"
            );
        }

        if let Some(system) = system {
            self.messages.insert(0, system);
        }
    }

    /// The current message list in LLM wire form
    pub fn to_chat_messages(&self) -> Vec<ChatMessage> {
        self.messages
            .iter()
            .map(|m| ChatMessage::new(m.role, m.content.clone()))
            .collect()
    }

    pub fn end(&mut self) {
        self.state = ConversationState::Ended;
        self.last_activity = Utc::now();
    }

    pub fn is_ended(&self) -> bool {
        self.state == ConversationState::Ended
    }

    /// Count of user+assistant exchanges (excludes the system prompt)
    pub fn turn_messages(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| m.role != Role::System)
            .count()
    }
}
