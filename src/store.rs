//! Persistence collaborators consumed by the hub.
//!
//! The hub only ever talks to these traits: presence writes on
//! register/unregister and chat membership lookups for chat-addressed
//! envelopes. The default implementations are in-memory (DashMap); a
//! deployment backed by a relational store swaps them without touching the
//! hub.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashSet;
use thiserror::Error;
use uuid::Uuid;

use crate::ws::envelope::UserStatus;

/// Failure talking to a backing store. The hub logs these and carries on —
/// routing is best-effort.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown chat {0}")]
    UnknownChat(Uuid),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Persists online/offline status as connections come and go.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn set_online(&self, user_id: Uuid) -> Result<(), StoreError>;
    async fn set_offline(&self, user_id: Uuid) -> Result<(), StoreError>;
}

/// Resolves current chat membership for chat-addressed envelopes.
#[async_trait]
pub trait ChatMembership: Send + Sync {
    async fn members_of(&self, chat_id: Uuid) -> Result<Vec<Uuid>, StoreError>;
}

/// Presence entry tracked per user.
#[derive(Debug, Clone)]
pub struct PresenceEntry {
    pub status: UserStatus,
    pub changed_at: DateTime<Utc>,
}

/// In-memory presence store keyed by user id.
#[derive(Default)]
pub struct MemoryPresence {
    entries: DashMap<Uuid, PresenceEntry>,
}

impl MemoryPresence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current status for a user; `Offline` if never seen.
    pub fn status_of(&self, user_id: Uuid) -> UserStatus {
        self.entries
            .get(&user_id)
            .map(|e| e.status)
            .unwrap_or(UserStatus::Offline)
    }

    fn set(&self, user_id: Uuid, status: UserStatus) {
        self.entries.insert(
            user_id,
            PresenceEntry {
                status,
                changed_at: Utc::now(),
            },
        );
    }
}

#[async_trait]
impl PresenceStore for MemoryPresence {
    async fn set_online(&self, user_id: Uuid) -> Result<(), StoreError> {
        self.set(user_id, UserStatus::Online);
        Ok(())
    }

    async fn set_offline(&self, user_id: Uuid) -> Result<(), StoreError> {
        self.set(user_id, UserStatus::Offline);
        Ok(())
    }
}

/// In-memory chat directory: chat id to member set.
#[derive(Default)]
pub struct MemoryChatDirectory {
    chats: DashMap<Uuid, HashSet<Uuid>>,
}

impl MemoryChatDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_member(&self, chat_id: Uuid, user_id: Uuid) {
        self.chats.entry(chat_id).or_default().insert(user_id);
    }

    pub fn remove_member(&self, chat_id: Uuid, user_id: Uuid) {
        if let Some(mut members) = self.chats.get_mut(&chat_id) {
            members.remove(&user_id);
        }
    }
}

#[async_trait]
impl ChatMembership for MemoryChatDirectory {
    async fn members_of(&self, chat_id: Uuid) -> Result<Vec<Uuid>, StoreError> {
        match self.chats.get(&chat_id) {
            Some(members) => Ok(members.iter().copied().collect()),
            None => Err(StoreError::UnknownChat(chat_id)),
        }
    }
}
