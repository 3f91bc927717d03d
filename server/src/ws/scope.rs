//! Server (scope) subscriptions: which live sessions see which server's traffic.

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;

use crate::store::ScopeId;
use crate::ws::session::SessionId;

/// scope id -> subscribed session ids. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct ScopeIndex {
    scopes: Arc<DashMap<ScopeId, HashSet<SessionId>>>,
}

impl ScopeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, session_id: &SessionId, scope_ids: &[ScopeId]) {
        for scope_id in scope_ids {
            self.scopes
                .entry(*scope_id)
                .or_default()
                .insert(session_id.clone());
        }
        tracing::debug!(
            session_id = %session_id,
            scopes = scope_ids.len(),
            "Session subscribed"
        );
    }

    /// Remove the session from each scope, pruning scopes left empty.
    pub fn unsubscribe(&self, session_id: &SessionId, scope_ids: &[ScopeId]) {
        for scope_id in scope_ids {
            let now_empty = match self.scopes.get_mut(scope_id) {
                Some(mut members) => {
                    members.remove(session_id);
                    members.is_empty()
                }
                None => false,
            };
            if now_empty {
                self.scopes.remove_if(scope_id, |_, members| members.is_empty());
            }
        }
        tracing::debug!(session_id = %session_id, "Session unsubscribed");
    }

    /// Snapshot of the sessions subscribed to `scope_id`.
    pub fn members_of(&self, scope_id: ScopeId) -> Vec<SessionId> {
        self.scopes
            .get(&scope_id)
            .map(|members| members.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_subscribed(&self, scope_id: ScopeId, session_id: &SessionId) -> bool {
        self.scopes
            .get(&scope_id)
            .is_some_and(|members| members.contains(session_id))
    }

    /// Number of scopes with at least one subscriber.
    pub fn scope_count(&self) -> usize {
        self.scopes.len()
    }
}
