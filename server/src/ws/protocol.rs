//! JSON wire envelopes for the realtime channel.
//!
//! Inbound frames carry `{"message_type": "channel_message", "payload": {...}}`;
//! the server answers every subscriber with a `"message"` envelope built from
//! the persisted record.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::{ChannelId, MessageId, MessageRecord, ScopeId, UserId};

pub const CHANNEL_MESSAGE: &str = "channel_message";
pub const MESSAGE: &str = "message";

/// Unix `date` layout, e.g. `Mon Jan  2 15:04:05 UTC 2006`.
pub const DATE_FORMAT: &str = "%a %b %e %H:%M:%S %Z %Y";

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("unexpected message type: {0}")]
    UnexpectedType(String),
}

#[derive(Debug, Deserialize)]
pub struct InboundEnvelope {
    pub message_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// A chat message submitted by a client. Missing fields decode as zero
/// values and are caught by validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ChannelMessageEvent {
    #[serde(default)]
    pub channel_id: i64,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMessage {
    pub userid: UserId,
    pub messageid: MessageId,
    pub channelid: ChannelId,
    pub serverid: ScopeId,
    pub message: String,
    pub date: String,
}

impl From<&MessageRecord> for ServerMessage {
    fn from(record: &MessageRecord) -> Self {
        Self {
            userid: record.user_id,
            messageid: record.message_id,
            channelid: record.channel_id,
            serverid: record.server_id,
            message: record.contents.clone(),
            date: format_date(&record.timestamp),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OutgoingEnvelope {
    pub message_type: String,
    pub payload: ServerMessage,
}

pub fn format_date(timestamp: &DateTime<Utc>) -> String {
    timestamp.format(DATE_FORMAT).to_string()
}

pub fn decode_channel_message(data: &[u8]) -> Result<ChannelMessageEvent, ProtocolError> {
    let envelope: InboundEnvelope = serde_json::from_slice(data)?;
    if envelope.message_type != CHANNEL_MESSAGE {
        return Err(ProtocolError::UnexpectedType(envelope.message_type));
    }
    if envelope.payload.is_null() {
        return Ok(ChannelMessageEvent::default());
    }
    Ok(serde_json::from_value(envelope.payload)?)
}

pub fn encode_server_message(record: &MessageRecord) -> Result<Bytes, serde_json::Error> {
    let envelope = OutgoingEnvelope {
        message_type: MESSAGE.to_string(),
        payload: ServerMessage::from(record),
    };
    serde_json::to_vec(&envelope).map(Bytes::from)
}
