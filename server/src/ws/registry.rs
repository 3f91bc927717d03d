//! Live session registry and addressed delivery.
//!
//! Owns every live [`Session`] by id, keeps one session per user, and keeps
//! the [`ScopeIndex`] in step with registration: a session is subscribed
//! before its loops start and unsubscribed before its transport is closed.

use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::store::{ScopeId, UserId};
use crate::ws::scope::ScopeIndex;
use crate::ws::session::{
    IntakeReceiver, IntakeSender, Session, SessionError, SessionId, SessionSettings,
};
use crate::ws::transport::{CloseStatus, Transport};

struct RegistryInner {
    sessions: DashMap<SessionId, Arc<Session>>,
    users: DashMap<UserId, SessionId>,
    scopes: ScopeIndex,
    intake: IntakeSender,
    settings: SessionSettings,
}

/// Handle to the process-wide registry. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    /// Build the registry and the shared intake queue its sessions feed.
    /// The receiver belongs to the single dispatcher.
    pub fn new(
        settings: SessionSettings,
        intake_capacity: usize,
        scopes: ScopeIndex,
    ) -> (Self, IntakeReceiver) {
        let (intake, intake_rx) = mpsc::channel(intake_capacity.max(1));
        let registry = Self {
            inner: Arc::new(RegistryInner {
                sessions: DashMap::new(),
                users: DashMap::new(),
                scopes,
                intake,
                settings,
            }),
        };
        (registry, intake_rx)
    }

    pub fn scopes(&self) -> &ScopeIndex {
        &self.inner.scopes
    }

    /// Register a connection for `user_id`, replacing any session the user
    /// already has, and start its loops.
    pub async fn register(
        &self,
        user_id: UserId,
        transport: Arc<dyn Transport>,
        scope_ids: Vec<ScopeId>,
    ) -> SessionId {
        let id = SessionId::generate();
        let session = Session::new(
            id.clone(),
            user_id,
            scope_ids,
            transport,
            &self.inner.settings,
        );

        self.inner.sessions.insert(id.clone(), Arc::clone(&session));
        let previous = self.inner.users.insert(user_id, id.clone());
        self.inner.scopes.subscribe(&id, session.scopes());

        session.start(self.inner.intake.clone());
        self.spawn_reaper(Arc::clone(&session));

        tracing::info!(
            session_id = %id,
            user_id = user_id,
            sessions = self.len(),
            "Session registered"
        );

        if let Some(previous) = previous {
            tracing::info!(
                session_id = %previous,
                user_id = user_id,
                "Replacing previous session for user"
            );
            self.deregister_with(&previous, CloseStatus::GoingAway).await;
        }

        id
    }

    /// Remove a session and close it. Returns false if it was not registered.
    pub async fn deregister(&self, id: &SessionId) -> bool {
        self.deregister_with(id, CloseStatus::Normal).await
    }

    async fn deregister_with(&self, id: &SessionId, status: CloseStatus) -> bool {
        let Some((_, session)) = self.inner.sessions.remove(id) else {
            tracing::debug!(session_id = %id, "Deregister of unknown session");
            return false;
        };

        self.inner
            .users
            .remove_if(&session.user_id(), |_, current| current == id);
        self.inner.scopes.unsubscribe(id, session.scopes());

        // No map guard is held past this point.
        match session.close(status).await {
            Ok(()) => {}
            Err(SessionError::AlreadyClosed) => {
                tracing::debug!(session_id = %id, "Session was already closed");
            }
            Err(e) => {
                tracing::debug!(session_id = %id, error = %e, "Session close failed");
            }
        }

        tracing::info!(
            session_id = %id,
            sessions = self.len(),
            "Session deregistered"
        );
        true
    }

    /// Deregister the session once it closes on its own.
    fn spawn_reaper(&self, session: Arc<Session>) {
        let registry = self.clone();
        tokio::spawn(async move {
            session.closed().await;
            registry.deregister(session.id()).await;
        });
    }

    /// Non-blocking delivery. A full or closed queue drops the frame.
    pub fn send_to(&self, id: &SessionId, frame: Bytes) -> bool {
        let Some(session) = self
            .inner
            .sessions
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
        else {
            tracing::debug!(session_id = %id, "Send to unknown session");
            return false;
        };

        match session.enqueue(frame) {
            Ok(()) => true,
            Err(SessionError::QueueFull) => {
                tracing::warn!(session_id = %id, "Outbound queue full, dropping message");
                false
            }
            Err(e) => {
                tracing::debug!(session_id = %id, error = %e, "Dropping message");
                false
            }
        }
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.inner.sessions.contains_key(id)
    }

    pub fn session_of_user(&self, user_id: UserId) -> Option<SessionId> {
        self.inner.users.get(&user_id).map(|entry| entry.value().clone())
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.inner.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.inner.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.sessions.is_empty()
    }

    /// Close every session. Used at shutdown.
    pub async fn close_all(&self) {
        let ids: Vec<SessionId> = self
            .inner
            .sessions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let count = ids.len();
        for id in ids {
            self.deregister_with(&id, CloseStatus::GoingAway).await;
        }
        tracing::info!(sessions = count, "Closed all sessions");
    }
}
