//! Frame types for the Tandem live protocol.
//!
//! Frames are the fundamental unit of communication on a live connection.
//! Each frame is serialized using MessagePack for efficient binary encoding.

use serde::{Deserialize, Serialize};

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum FrameType {
    Connect = 0x01,
    Connected = 0x02,
    Join = 0x03,
    Leave = 0x04,
    Publish = 0x05,
    Event = 0x06,
    Ack = 0x07,
    Error = 0x08,
    Ping = 0x09,
    Pong = 0x0A,
}

impl From<FrameType> for u8 {
    fn from(ft: FrameType) -> u8 {
        ft as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(FrameType::Connect),
            0x02 => Ok(FrameType::Connected),
            0x03 => Ok(FrameType::Join),
            0x04 => Ok(FrameType::Leave),
            0x05 => Ok(FrameType::Publish),
            0x06 => Ok(FrameType::Event),
            0x07 => Ok(FrameType::Ack),
            0x08 => Ok(FrameType::Error),
            0x09 => Ok(FrameType::Ping),
            0x0A => Ok(FrameType::Pong),
            _ => Err("Invalid frame type"),
        }
    }
}

/// A protocol frame.
///
/// Client-originated frames carry a request `id` where an acknowledgment is
/// expected; the server answers with `Ack` or `Error` echoing that id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Initial handshake. Must be the first frame on a connection.
    #[serde(rename = "connect")]
    Connect {
        /// Protocol version.
        version: u8,
        /// Bearer credential; the connection is rejected without a valid one.
        token: String,
    },

    /// Handshake accepted.
    #[serde(rename = "connected")]
    Connected {
        /// Unique connection identifier.
        connection_id: String,
        /// Authenticated principal.
        principal_id: String,
        /// Negotiated protocol version.
        version: u8,
        /// Recommended heartbeat interval in milliseconds.
        heartbeat: u32,
    },

    /// Join a channel (conversation, workshop or swap room).
    #[serde(rename = "join")]
    Join {
        /// Request ID for acknowledgment.
        id: u64,
        /// Channel name to join.
        channel: String,
    },

    /// Leave a channel.
    #[serde(rename = "leave")]
    Leave {
        /// Request ID for acknowledgment.
        id: u64,
        /// Channel name to leave.
        channel: String,
    },

    /// Publish an ephemeral event to a channel (typing, read pings,
    /// call signaling). The payload is relayed opaquely.
    #[serde(rename = "publish")]
    Publish {
        /// Optional request ID for acknowledgment.
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        /// Target channel.
        channel: String,
        /// Event name.
        event: String,
        /// Event payload.
        payload: serde_json::Value,
        /// Skip the publishing connection on delivery.
        #[serde(default)]
        exclude_self: bool,
    },

    /// Server push of a live event to a joined channel.
    #[serde(rename = "event")]
    Event {
        /// Source channel.
        channel: String,
        /// Event name.
        event: String,
        /// Event payload.
        payload: serde_json::Value,
    },

    /// Acknowledgment of a request.
    #[serde(rename = "ack")]
    Ack {
        /// ID of the acknowledged request.
        id: u64,
    },

    /// Error response.
    #[serde(rename = "error")]
    Error {
        /// ID of the failed request (0 if not applicable).
        id: u64,
        /// Error code.
        code: u16,
        /// Human-readable error message.
        message: String,
    },

    /// Keepalive ping.
    #[serde(rename = "ping")]
    Ping {
        /// Optional timestamp.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },

    /// Keepalive pong.
    #[serde(rename = "pong")]
    Pong {
        /// Echoed timestamp from ping.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<u64>,
    },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Connect { .. } => FrameType::Connect,
            Frame::Connected { .. } => FrameType::Connected,
            Frame::Join { .. } => FrameType::Join,
            Frame::Leave { .. } => FrameType::Leave,
            Frame::Publish { .. } => FrameType::Publish,
            Frame::Event { .. } => FrameType::Event,
            Frame::Ack { .. } => FrameType::Ack,
            Frame::Error { .. } => FrameType::Error,
            Frame::Ping { .. } => FrameType::Ping,
            Frame::Pong { .. } => FrameType::Pong,
        }
    }

    /// Create a new Connect frame.
    #[must_use]
    pub fn connect(version: u8, token: impl Into<String>) -> Self {
        Frame::Connect {
            version,
            token: token.into(),
        }
    }

    /// Create a new Connected frame.
    #[must_use]
    pub fn connected(
        connection_id: impl Into<String>,
        principal_id: impl Into<String>,
        version: u8,
        heartbeat: u32,
    ) -> Self {
        Frame::Connected {
            connection_id: connection_id.into(),
            principal_id: principal_id.into(),
            version,
            heartbeat,
        }
    }

    /// Create a new Join frame.
    #[must_use]
    pub fn join(id: u64, channel: impl Into<String>) -> Self {
        Frame::Join {
            id,
            channel: channel.into(),
        }
    }

    /// Create a new Leave frame.
    #[must_use]
    pub fn leave(id: u64, channel: impl Into<String>) -> Self {
        Frame::Leave {
            id,
            channel: channel.into(),
        }
    }

    /// Create a new Publish frame.
    #[must_use]
    pub fn publish(
        channel: impl Into<String>,
        event: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Frame::Publish {
            id: None,
            channel: channel.into(),
            event: event.into(),
            payload,
            exclude_self: false,
        }
    }

    /// Create a new server Event frame.
    #[must_use]
    pub fn event(
        channel: impl Into<String>,
        event: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Frame::Event {
            channel: channel.into(),
            event: event.into(),
            payload,
        }
    }

    /// Create a new Ack frame.
    #[must_use]
    pub fn ack(id: u64) -> Self {
        Frame::Ack { id }
    }

    /// Create a new Error frame.
    #[must_use]
    pub fn error(id: u64, code: u16, message: impl Into<String>) -> Self {
        Frame::Error {
            id,
            code,
            message: message.into(),
        }
    }

    /// Create a new Ping frame.
    #[must_use]
    pub fn ping(timestamp: Option<u64>) -> Self {
        Frame::Ping { timestamp }
    }

    /// Create a new Pong frame.
    #[must_use]
    pub fn pong(timestamp: Option<u64>) -> Self {
        Frame::Pong { timestamp }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_type() {
        let join = Frame::join(1, "conversation:7");
        assert_eq!(join.frame_type(), FrameType::Join);

        let publish = Frame::publish("conversation:7", "userTyping", json!({}));
        assert_eq!(publish.frame_type(), FrameType::Publish);
    }

    #[test]
    fn test_frame_type_conversion() {
        for raw in 0x01..=0x0A {
            let ft = FrameType::try_from(raw).unwrap();
            assert_eq!(u8::from(ft), raw);
        }
        assert!(FrameType::try_from(0x0B).is_err());
    }

    #[test]
    fn test_connected_frame() {
        let frame = Frame::connected("conn-1", "alice", 1, 30_000);
        match frame {
            Frame::Connected {
                principal_id,
                heartbeat,
                ..
            } => {
                assert_eq!(principal_id, "alice");
                assert_eq!(heartbeat, 30_000);
            }
            other => panic!("Expected Connected, got {other:?}"),
        }
    }
}
