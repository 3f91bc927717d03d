//! Collaborators consumed by the realtime core.
//!
//! The REST backend owns users, servers, channels and messages. The realtime
//! path only needs three narrow capabilities from it: resolving a session
//! token, listing a user's servers, and persisting/reading chat messages.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Ids are positive integers assigned by the backing database.
pub type UserId = u64;
/// A chat "server": the unit of broadcast membership.
pub type ScopeId = u64;
pub type ChannelId = u64;
pub type MessageId = u64;

/// Canonical persisted message as read back from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub message_id: MessageId,
    pub user_id: UserId,
    pub channel_id: ChannelId,
    /// Server owning the channel; decides who receives the fan-out.
    pub server_id: ScopeId,
    pub contents: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("database error: {0}")]
    Database(String),

    #[error("store task failed: {0}")]
    TaskFailed(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound("no matching row".into()),
            other => StoreError::Database(other.to_string()),
        }
    }
}

/// Message persistence used by the dispatcher.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a chat message and return its new id.
    async fn add_message(
        &self,
        channel_id: ChannelId,
        user_id: UserId,
        text: &str,
    ) -> Result<MessageId, StoreError>;

    /// Read back the canonical record, including the owning server.
    async fn get_message(&self, message_id: MessageId) -> Result<MessageRecord, StoreError>;
}

/// Server membership, queried once per connection.
#[async_trait]
pub trait MembershipLookup: Send + Sync {
    async fn scopes_of_user(&self, user_id: UserId) -> Result<Vec<ScopeId>, StoreError>;
}

/// Resolves a session token issued by the REST backend to a user id.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, token: &str) -> Result<UserId, StoreError>;
}
