//! In-process store used by tests and by the demo mode of the binary.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{
    Authenticator, ChannelId, MembershipLookup, MessageId, MessageRecord, MessageStore, ScopeId,
    StoreError, UserId,
};

#[derive(Debug, Default)]
struct MemoryInner {
    memberships: HashMap<UserId, Vec<ScopeId>>,
    channels: HashMap<ChannelId, ScopeId>,
    tokens: HashMap<String, UserId>,
    messages: HashMap<MessageId, MessageRecord>,
    last_message_id: MessageId,
    add_message_calls: usize,
    fail_writes: bool,
    fail_reads: bool,
    fail_membership: bool,
}

/// Map-backed implementation of every store trait.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Two servers, four channels, three users with fixed tokens.
    ///
    /// Users 1 and 2 share server 1, user 3 is only in server 2 and user 1
    /// is in both.
    pub fn demo() -> Self {
        let store = Self::new();
        store.add_channel(1, 1);
        store.add_channel(2, 1);
        store.add_channel(3, 2);
        store.add_channel(4, 2);
        store.add_member(1, 1);
        store.add_member(1, 2);
        store.add_member(2, 1);
        store.add_member(3, 2);
        for user in 1..=3 {
            store.add_token(&format!("demo-token-{user}"), user);
        }
        store
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_member(&self, user_id: UserId, scope_id: ScopeId) {
        let mut inner = self.lock();
        let scopes = inner.memberships.entry(user_id).or_default();
        if !scopes.contains(&scope_id) {
            scopes.push(scope_id);
        }
    }

    pub fn add_channel(&self, channel_id: ChannelId, scope_id: ScopeId) {
        self.lock().channels.insert(channel_id, scope_id);
    }

    pub fn add_token(&self, token: &str, user_id: UserId) {
        self.lock().tokens.insert(token.to_string(), user_id);
    }

    /// Make the next message id `id + 1`.
    pub fn set_last_message_id(&self, id: MessageId) {
        self.lock().last_message_id = id;
    }

    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    pub fn fail_reads(&self, fail: bool) {
        self.lock().fail_reads = fail;
    }

    pub fn fail_membership(&self, fail: bool) {
        self.lock().fail_membership = fail;
    }

    /// Number of `add_message` calls, including failed ones.
    pub fn add_message_calls(&self) -> usize {
        self.lock().add_message_calls
    }

    pub fn tokens(&self) -> Vec<(String, UserId)> {
        let mut tokens: Vec<_> = self
            .lock()
            .tokens
            .iter()
            .map(|(token, user)| (token.clone(), *user))
            .collect();
        tokens.sort_by_key(|(_, user)| *user);
        tokens
    }

    pub fn message_count(&self) -> usize {
        self.lock().messages.len()
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn add_message(
        &self,
        channel_id: ChannelId,
        user_id: UserId,
        text: &str,
    ) -> Result<MessageId, StoreError> {
        let mut inner = self.lock();
        inner.add_message_calls += 1;
        if inner.fail_writes {
            return Err(StoreError::Database("writes disabled".into()));
        }
        let server_id = *inner
            .channels
            .get(&channel_id)
            .ok_or_else(|| StoreError::NotFound(format!("channel {channel_id}")))?;

        inner.last_message_id += 1;
        let message_id = inner.last_message_id;
        inner.messages.insert(
            message_id,
            MessageRecord {
                message_id,
                user_id,
                channel_id,
                server_id,
                contents: text.to_string(),
                timestamp: Utc::now(),
            },
        );
        Ok(message_id)
    }

    async fn get_message(&self, message_id: MessageId) -> Result<MessageRecord, StoreError> {
        let inner = self.lock();
        if inner.fail_reads {
            return Err(StoreError::Database("reads disabled".into()));
        }
        inner
            .messages
            .get(&message_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("message {message_id}")))
    }
}

#[async_trait]
impl MembershipLookup for MemoryStore {
    async fn scopes_of_user(&self, user_id: UserId) -> Result<Vec<ScopeId>, StoreError> {
        let inner = self.lock();
        if inner.fail_membership {
            return Err(StoreError::Database("membership lookup disabled".into()));
        }
        Ok(inner
            .memberships
            .get(&user_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl Authenticator for MemoryStore {
    async fn authenticate(&self, token: &str) -> Result<UserId, StoreError> {
        self.lock()
            .tokens
            .get(token)
            .copied()
            .ok_or(StoreError::Unauthorized)
    }
}
