//! # tandem-protocol
//!
//! Wire protocol for the Tandem live layer.
//!
//! Clients and the server exchange [`Frame`]s over a WebSocket. Frames are
//! MessagePack-encoded with a 4-byte big-endian length prefix so partial
//! reads can be reassembled by the streaming decoder in [`codec`].
//!
//! The handshake is authenticated: the first client frame must be
//! [`Frame::Connect`] carrying a bearer credential, and the server answers
//! [`Frame::Connected`] only after verification.

pub mod codec;
pub mod frames;

pub use codec::{FrameCodec, ProtocolError, MAX_FRAME_SIZE};
pub use frames::{Frame, FrameType};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;
