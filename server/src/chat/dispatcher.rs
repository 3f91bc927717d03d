//! Single consumer of the intake queue.
//!
//! Each inbound frame is decoded, validated, persisted, read back and fanned
//! out to every session subscribed to the message's server. A failure at any
//! step discards that one frame; the loop keeps going.

use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::store::{ChannelId, MessageStore, StoreError};
use crate::ws::protocol::{self, ProtocolError};
use crate::ws::registry::ConnectionRegistry;
use crate::ws::session::{IncomingFrame, IntakeReceiver};

/// Longest accepted chat message, in bytes.
pub const MAX_MESSAGE_LEN: usize = 1000;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("invalid channel id: {0}")]
    InvalidChannel(i64),

    #[error("message too long: {0} bytes")]
    MessageTooLong(usize),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("failed to encode outbound message: {0}")]
    Encode(serde_json::Error),
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Delivery {
    /// Sessions subscribed to the message's server.
    pub recipients: usize,
    /// Recipients whose outbound queue accepted the frame.
    pub delivered: usize,
}

pub struct Dispatcher {
    registry: ConnectionRegistry,
    store: Arc<dyn MessageStore>,
}

impl Dispatcher {
    pub fn new(registry: ConnectionRegistry, store: Arc<dyn MessageStore>) -> Self {
        Self { registry, store }
    }

    /// Drain the intake queue until it closes or `shutdown` fires.
    pub async fn run(self, mut intake: IntakeReceiver, shutdown: CancellationToken) {
        tracing::info!("Dispatcher started");
        loop {
            let frame = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = intake.recv() => match next {
                    Some(frame) => frame,
                    None => break,
                },
            };

            match self.dispatch(&frame).await {
                Ok(delivery) => {
                    tracing::debug!(
                        session_id = %frame.session_id,
                        recipients = delivery.recipients,
                        delivered = delivery.delivered,
                        "Message fanned out"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        session_id = %frame.session_id,
                        user_id = frame.user_id,
                        error = %e,
                        "Discarding inbound frame"
                    );
                }
            }
        }
        tracing::info!("Dispatcher stopped");
    }

    /// Process one inbound frame end to end.
    pub async fn dispatch(&self, frame: &IncomingFrame) -> Result<Delivery, DispatchError> {
        let event = protocol::decode_channel_message(&frame.payload)?;

        if event.channel_id <= 0 {
            return Err(DispatchError::InvalidChannel(event.channel_id));
        }
        if event.message.len() > MAX_MESSAGE_LEN {
            return Err(DispatchError::MessageTooLong(event.message.len()));
        }
        let channel_id = event.channel_id as ChannelId;

        let message_id = self
            .store
            .add_message(channel_id, frame.user_id, &event.message)
            .await?;
        let record = self.store.get_message(message_id).await?;
        let outbound = protocol::encode_server_message(&record).map_err(DispatchError::Encode)?;

        let members = self.registry.scopes().members_of(record.server_id);
        let mut delivery = Delivery {
            recipients: members.len(),
            delivered: 0,
        };
        for session_id in &members {
            // Bytes clones share the buffer.
            if self.registry.send_to(session_id, outbound.clone()) {
                delivery.delivered += 1;
            }
        }

        tracing::info!(
            message_id = record.message_id,
            channel_id = record.channel_id,
            server_id = record.server_id,
            user_id = record.user_id,
            recipients = delivery.recipients,
            delivered = delivery.delivered,
            "Channel message delivered"
        );
        Ok(delivery)
    }
}
