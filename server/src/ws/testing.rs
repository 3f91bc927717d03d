//! In-memory transport double for unit tests.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use super::transport::{CloseStatus, Frame, Transport, TransportError};

pub(crate) struct ChannelTransport {
    inbound: AsyncMutex<mpsc::UnboundedReceiver<Result<Frame, TransportError>>>,
    written: mpsc::UnboundedSender<Bytes>,
    closes: Arc<Mutex<Vec<CloseStatus>>>,
    fail_writes: Arc<AtomicBool>,
    stall_writes: Arc<AtomicBool>,
}

/// Test-side handle: feeds reads, observes writes and closes.
pub(crate) struct TransportProbe {
    inbound: mpsc::UnboundedSender<Result<Frame, TransportError>>,
    written: mpsc::UnboundedReceiver<Bytes>,
    closes: Arc<Mutex<Vec<CloseStatus>>>,
    fail_writes: Arc<AtomicBool>,
    stall_writes: Arc<AtomicBool>,
}

pub(crate) fn channel_transport() -> (ChannelTransport, TransportProbe) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
    let (written_tx, written_rx) = mpsc::unbounded_channel();
    let closes = Arc::new(Mutex::new(Vec::new()));
    let fail_writes = Arc::new(AtomicBool::new(false));
    let stall_writes = Arc::new(AtomicBool::new(false));
    (
        ChannelTransport {
            inbound: AsyncMutex::new(inbound_rx),
            written: written_tx,
            closes: closes.clone(),
            fail_writes: fail_writes.clone(),
            stall_writes: stall_writes.clone(),
        },
        TransportProbe {
            inbound: inbound_tx,
            written: written_rx,
            closes,
            fail_writes,
            stall_writes,
        },
    )
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn read(&self) -> Result<Frame, TransportError> {
        match self.inbound.lock().await.recv().await {
            Some(result) => result,
            None => Err(TransportError::Closed),
        }
    }

    async fn write(&self, frame: Frame) -> Result<(), TransportError> {
        if self.stall_writes.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::Io("write refused".into()));
        }
        if let Frame::Text(data) | Frame::Binary(data) = frame {
            let _ = self.written.send(data);
        }
        Ok(())
    }

    async fn close(&self, status: CloseStatus, _reason: &str) -> Result<(), TransportError> {
        self.closes.lock().unwrap().push(status);
        Ok(())
    }
}

impl TransportProbe {
    pub(crate) fn push_text(&self, text: &str) {
        self.push_frame(Frame::Text(Bytes::copy_from_slice(text.as_bytes())));
    }

    pub(crate) fn push_frame(&self, frame: Frame) {
        let _ = self.inbound.send(Ok(frame));
    }

    pub(crate) fn push_error(&self, error: TransportError) {
        let _ = self.inbound.send(Err(error));
    }

    pub(crate) fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    pub(crate) fn stall_writes(&self) {
        self.stall_writes.store(true, Ordering::SeqCst);
    }

    /// Next frame written by the session, or `None` after one second.
    pub(crate) async fn next_written(&mut self) -> Option<Bytes> {
        tokio::time::timeout(Duration::from_secs(1), self.written.recv())
            .await
            .ok()
            .flatten()
    }

    /// Assert nothing is written within a short window.
    pub(crate) async fn assert_nothing_written(&mut self) {
        let next = tokio::time::timeout(Duration::from_millis(100), self.written.recv()).await;
        assert!(!matches!(next, Ok(Some(_))), "unexpected write: {:?}", next);
    }

    pub(crate) fn closes(&self) -> Vec<CloseStatus> {
        self.closes.lock().unwrap().clone()
    }

    pub(crate) fn close_count(&self) -> usize {
        self.closes.lock().unwrap().len()
    }

    pub(crate) async fn wait_for_close(&self) {
        for _ in 0..100 {
            if self.close_count() > 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("transport was never closed");
    }
}
