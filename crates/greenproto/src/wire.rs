//! Wire format for the line-oriented transport.
//!
//! One JSON document per line. A frame is a call, a reply or a
//! notification, each wrapped in the usual [`Message`] envelope.

use anyhow::{Context, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::envelope::Message;
use crate::session::{Notification, Reply, Request};

/// Anything that crosses the transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    Call(Message<Request>),
    Reply(Message<Reply>),
    Notification(Message<Notification>),
}

/// Wire format for serializing frames
pub trait WireFormat {
    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>>;
    fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T>;
}

/// Newline-terminated JSON
pub struct JsonLines;

impl WireFormat for JsonLines {
    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(value).context("failed to serialize frame to JSON")?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
        let trimmed = data.strip_suffix(b"\n").unwrap_or(data);
        serde_json::from_slice(trimmed).context("failed to deserialize JSON frame")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Scope;
    use uuid::Uuid;

    #[test]
    fn test_call_frame_is_one_line() {
        let msg = Message::new(
            Uuid::new_v4(),
            "request",
            Request::KillApp {
                scope: Scope::Studio,
                id: 4,
            },
        );
        let bytes = JsonLines::encode(&Frame::Call(msg)).unwrap();

        assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 1);
        assert_eq!(bytes.last(), Some(&b'\n'));

        let decoded: Frame = JsonLines::decode(&bytes).unwrap();
        match decoded {
            Frame::Call(m) => assert_eq!(m.content, Request::KillApp { scope: Scope::Studio, id: 4 }),
            other => panic!("wrong frame: {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let result: Result<Frame> = JsonLines::decode(b"{not json}\n");
        assert!(result.is_err());
    }
}
