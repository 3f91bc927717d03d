//! Duplex transport abstraction for realtime sessions.
//!
//! A [`Transport`] is shared by a session's read and write loops, so every
//! method takes `&self`. The WebSocket implementation splits the socket into
//! sink and stream halves with their own locks, so a pending read never
//! blocks a write or a close.

use async_trait::async_trait;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::Mutex;

/// WebSocket close status used when a session ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseStatus {
    Normal,
    GoingAway,
    Abnormal,
    InternalError,
}

impl CloseStatus {
    /// RFC 6455 status code.
    pub fn code(self) -> u16 {
        match self {
            Self::Normal => 1000,
            Self::GoingAway => 1001,
            Self::Abnormal => 1006,
            Self::InternalError => 1011,
        }
    }

    /// Code to put in a close frame. 1006 is reserved and must not be sent.
    pub fn wire_code(self) -> u16 {
        match self {
            Self::Abnormal => Self::InternalError.code(),
            other => other.code(),
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Self::Normal => "",
            Self::GoingAway => "Session replaced or server shutting down",
            Self::Abnormal => "Connection error",
            Self::InternalError => "Internal error",
        }
    }
}

/// A single frame read from or written to a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(Bytes),
    Binary(Bytes),
    /// Ping/pong traffic; answered by the WebSocket layer itself.
    Control,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed by peer")]
    Closed,

    #[error("read cancelled")]
    Cancelled,

    #[error("transport error: {0}")]
    Io(String),

    #[error("write timed out")]
    Timeout,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Wait for the next frame. Must be cancel-safe.
    async fn read(&self) -> Result<Frame, TransportError>;

    async fn write(&self, frame: Frame) -> Result<(), TransportError>;

    async fn close(&self, status: CloseStatus, reason: &str) -> Result<(), TransportError>;
}

/// Transport over an upgraded axum WebSocket.
pub struct WebSocketTransport {
    sink: Mutex<SplitSink<WebSocket, Message>>,
    stream: Mutex<SplitStream<WebSocket>>,
}

impl WebSocketTransport {
    pub fn new(socket: WebSocket) -> Self {
        let (sink, stream) = socket.split();
        Self {
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn read(&self) -> Result<Frame, TransportError> {
        let mut stream = self.stream.lock().await;
        match stream.next().await {
            Some(Ok(message)) => frame_from_message(message),
            Some(Err(e)) => Err(TransportError::Io(e.to_string())),
            None => Err(TransportError::Closed),
        }
    }

    async fn write(&self, frame: Frame) -> Result<(), TransportError> {
        let Some(message) = message_from_frame(frame)? else {
            return Ok(());
        };
        self.sink
            .lock()
            .await
            .send(message)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }

    async fn close(&self, status: CloseStatus, reason: &str) -> Result<(), TransportError> {
        let frame = CloseFrame {
            code: status.wire_code(),
            reason: reason.to_string().into(),
        };
        let mut sink = self.sink.lock().await;
        sink.send(Message::Close(Some(frame)))
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        sink.close()
            .await
            .map_err(|e| TransportError::Io(e.to_string()))
    }
}

/// Text payloads share the socket's buffer; no copy either way.
fn frame_from_message(message: Message) -> Result<Frame, TransportError> {
    match message {
        Message::Text(text) => Ok(Frame::Text(Bytes::from(text))),
        Message::Binary(data) => Ok(Frame::Binary(data)),
        Message::Ping(_) | Message::Pong(_) => Ok(Frame::Control),
        Message::Close(frame) => {
            tracing::debug!(reason = ?frame, "Peer sent close frame");
            Err(TransportError::Closed)
        }
    }
}

fn message_from_frame(frame: Frame) -> Result<Option<Message>, TransportError> {
    match frame {
        Frame::Text(data) => {
            let text = Utf8Bytes::try_from(data)
                .map_err(|e| TransportError::Io(format!("text frame is not UTF-8: {e}")))?;
            Ok(Some(Message::Text(text)))
        }
        Frame::Binary(data) => Ok(Some(Message::Binary(data))),
        Frame::Control => Ok(None),
    }
}
