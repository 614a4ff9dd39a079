//! Message envelope shared by calls, replies and notifications.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Protocol version
pub const PROTOCOL_VERSION: &str = "0.1.0";

/// Message header - present on every message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Unique message ID for correlation
    pub msg_id: Uuid,
    /// Session ID (identifies the peer)
    pub session: Uuid,
    /// Message type (e.g., "request", "reply", "notification")
    pub msg_type: String,
    /// Protocol version
    pub version: String,
    /// Timestamp when message was created
    pub timestamp: DateTime<Utc>,
}

impl MessageHeader {
    pub fn new(session: Uuid, msg_type: impl Into<String>) -> Self {
        Self {
            msg_id: Uuid::new_v4(),
            session,
            msg_type: msg_type.into(),
            version: PROTOCOL_VERSION.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Generic message envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message<T> {
    pub header: MessageHeader,
    /// Reference to the message this is replying to (if any)
    pub parent_header: Option<MessageHeader>,
    /// The actual content
    pub content: T,
}

impl<T> Message<T> {
    pub fn new(session: Uuid, msg_type: impl Into<String>, content: T) -> Self {
        Self {
            header: MessageHeader::new(session, msg_type),
            parent_header: None,
            content,
        }
    }

    pub fn reply(parent: &MessageHeader, msg_type: impl Into<String>, content: T) -> Self {
        Self {
            header: MessageHeader::new(parent.session, msg_type),
            parent_header: Some(parent.clone()),
            content,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_links_parent() {
        let session = Uuid::new_v4();
        let call = Message::new(session, "request", ());
        let reply = Message::reply(&call.header, "reply", 7u32);

        assert_eq!(reply.header.session, session);
        let parent = reply.parent_header.expect("reply carries parent");
        assert_eq!(parent.msg_id, call.header.msg_id);
        assert_eq!(reply.header.version, PROTOCOL_VERSION);
    }
}
