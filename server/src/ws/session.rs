//! One live connection and its two I/O loops.
//!
//! The read loop forwards decoded frames to the shared intake queue; the
//! write loop drains this session's bounded outbound queue into the
//! transport. Both loops end in [`Session::close`], which only the first
//! caller gets to run.

use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::store::{ScopeId, UserId};
use crate::ws::transport::{CloseStatus, Frame, Transport, TransportError};

/// Opaque, unique per connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(String);

impl SessionId {
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A raw inbound payload waiting for the dispatcher.
#[derive(Debug, Clone)]
pub struct IncomingFrame {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub payload: Bytes,
}

pub type IntakeSender = mpsc::Sender<IncomingFrame>;
pub type IntakeReceiver = mpsc::Receiver<IncomingFrame>;

#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Frames buffered per recipient before delivery starts dropping.
    pub outbound_capacity: usize,
    /// Upper bound on a single transport write.
    pub write_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            outbound_capacity: 64,
            write_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session already closed")]
    AlreadyClosed,

    #[error("outbound queue full")]
    QueueFull,

    #[error("outbound queue closed")]
    Closed,
}

pub struct Session {
    id: SessionId,
    user_id: UserId,
    /// Membership snapshot taken at connect time.
    scopes: Vec<ScopeId>,
    transport: Arc<dyn Transport>,
    outbound: Mutex<Option<mpsc::Sender<Bytes>>>,
    /// Taken by `start`; `None` afterwards.
    outbound_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
    cancel: CancellationToken,
    closed: AtomicBool,
    write_timeout: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Session {
    pub fn new(
        id: SessionId,
        user_id: UserId,
        scopes: Vec<ScopeId>,
        transport: Arc<dyn Transport>,
        settings: &SessionSettings,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(settings.outbound_capacity.max(1));
        Arc::new(Self {
            id,
            user_id,
            scopes,
            transport,
            outbound: Mutex::new(Some(tx)),
            outbound_rx: Mutex::new(Some(rx)),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            write_timeout: settings.write_timeout,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn scopes(&self) -> &[ScopeId] {
        &self.scopes
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Spawn the read and write loops. Only the first call has an effect.
    pub fn start(self: &Arc<Self>, intake: IntakeSender) {
        let Some(outbound_rx) = lock(&self.outbound_rx).take() else {
            return;
        };
        let reader = tokio::spawn(Arc::clone(self).read_loop(intake));
        let writer = tokio::spawn(Arc::clone(self).write_loop(outbound_rx));
        lock(&self.tasks).extend([reader, writer]);
    }

    /// Resolves once the session has started closing.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    /// True once both loops have exited (or were never started).
    pub fn tasks_finished(&self) -> bool {
        lock(&self.tasks).iter().all(|task| task.is_finished())
    }

    /// Non-blocking enqueue onto the outbound queue.
    pub fn enqueue(&self, frame: Bytes) -> Result<(), SessionError> {
        let outbound = lock(&self.outbound);
        let Some(tx) = outbound.as_ref() else {
            return Err(SessionError::Closed);
        };
        tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SessionError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SessionError::Closed,
        })
    }

    /// Tear the session down. Later callers get `AlreadyClosed`.
    ///
    /// A session that ends itself closes its transport here first; the
    /// registry reaper removes it afterwards, and `enqueue` returns `Closed`
    /// in between.
    pub async fn close(&self, status: CloseStatus) -> Result<(), SessionError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(SessionError::AlreadyClosed);
        }

        self.cancel.cancel();
        // Dropping the sender closes the outbound queue.
        lock(&self.outbound).take();

        if let Err(e) = self.transport.close(status, status.reason()).await {
            tracing::debug!(session_id = %self.id, error = %e, "Transport close failed");
        }

        tracing::info!(
            session_id = %self.id,
            user_id = self.user_id,
            status = status.code(),
            "Session closed"
        );
        Ok(())
    }

    async fn finish(&self, status: CloseStatus) {
        if self.close(status).await.is_err() {
            tracing::trace!(session_id = %self.id, "Session already closed by the other loop");
        }
    }

    async fn read_loop(self: Arc<Self>, intake: IntakeSender) {
        loop {
            let result = tokio::select! {
                _ = self.cancel.cancelled() => Err(TransportError::Cancelled),
                read = self.transport.read() => read,
            };

            match result {
                Ok(Frame::Text(payload) | Frame::Binary(payload)) => {
                    tracing::debug!(
                        session_id = %self.id,
                        bytes = payload.len(),
                        "Frame received"
                    );
                    let frame = IncomingFrame {
                        session_id: self.id.clone(),
                        user_id: self.user_id,
                        payload,
                    };
                    // Blocks while the intake queue is full.
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            self.finish(CloseStatus::Normal).await;
                            return;
                        }
                        sent = intake.send(frame) => {
                            if sent.is_err() {
                                tracing::warn!(session_id = %self.id, "Intake queue closed");
                                self.finish(CloseStatus::GoingAway).await;
                                return;
                            }
                        }
                    }
                }
                Ok(Frame::Control) => {}
                Err(TransportError::Cancelled) => {
                    tracing::debug!(session_id = %self.id, "Read cancelled");
                    self.finish(CloseStatus::Normal).await;
                    return;
                }
                Err(TransportError::Closed) => {
                    tracing::info!(session_id = %self.id, "Peer closed connection");
                    self.finish(CloseStatus::Normal).await;
                    return;
                }
                Err(e) => {
                    tracing::warn!(session_id = %self.id, error = %e, "Read error");
                    self.finish(CloseStatus::Abnormal).await;
                    return;
                }
            }
        }
    }

    async fn write_loop(self: Arc<Self>, mut outbound: mpsc::Receiver<Bytes>) {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                next = outbound.recv() => match next {
                    Some(frame) => {
                        let written = timeout(self.write_timeout, self.transport.write(Frame::Text(frame)))
                            .await
                            .unwrap_or(Err(TransportError::Timeout));
                        if let Err(e) = written {
                            tracing::warn!(session_id = %self.id, error = %e, "Write error");
                            self.finish(CloseStatus::Abnormal).await;
                            return;
                        }
                    }
                    None => {
                        self.finish(CloseStatus::Normal).await;
                        return;
                    }
                },
            }
        }
    }
}
