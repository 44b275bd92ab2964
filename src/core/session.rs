//! Chat sessions and message retention.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::ids::SessionId;
use super::vclock::VectorClock;

/// Newest non-system messages retained per session; system messages are
/// always kept on top of this budget.
pub const MAX_SAVED_MESSAGES: usize = 100;

/// Sessions untouched for this long are eligible for expiry sweeps.
pub const SESSION_EXPIRY_MS: u64 = 30 * 24 * 60 * 60 * 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub ts: u64,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>, ts: u64) -> Self {
        Self {
            role,
            content: content.into(),
            ts,
        }
    }

    pub fn is_system(&self) -> bool {
        self.role == Role::System
    }
}

/// A chat session. Message ordering is total and stable; reorder is
/// disallowed — mutation is append or retention-filter only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub title: String,
    pub created_at: u64,
    pub updated_at: u64,
    pub message_count: u64,
    pub messages: Vec<Message>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Causality for cross-replica merges.
    #[serde(default)]
    pub vclock: VectorClock,
}

impl Session {
    pub fn new(id: SessionId, title: impl Into<String>, now_ms: u64) -> Self {
        Self {
            id,
            title: title.into(),
            created_at: now_ms,
            updated_at: now_ms,
            message_count: 0,
            messages: Vec::new(),
            metadata: BTreeMap::new(),
            vclock: VectorClock::new(),
        }
    }

    pub fn push_message(&mut self, message: Message, now_ms: u64) {
        self.messages.push(message);
        self.message_count += 1;
        self.updated_at = now_ms;
    }

    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.updated_at) > SESSION_EXPIRY_MS
    }
}

/// Apply the retention policy before persisting.
///
/// Keeps every system message plus the newest non-system messages up to a
/// total of `MAX_SAVED_MESSAGES`, preserving the original relative order.
pub fn filter_messages_for_storage(messages: &[Message]) -> Vec<Message> {
    let system_count = messages.iter().filter(|m| m.is_system()).count();
    let budget = MAX_SAVED_MESSAGES.saturating_sub(system_count);

    let non_system_total = messages.len() - system_count;
    let skip = non_system_total.saturating_sub(budget);

    let mut skipped = 0usize;
    let mut kept = Vec::with_capacity(messages.len().min(MAX_SAVED_MESSAGES));
    for message in messages {
        if message.is_system() {
            kept.push(message.clone());
        } else if skipped < skip {
            skipped += 1;
        } else {
            kept.push(message.clone());
        }
    }
    kept
}
