//! Identifiers and small value types of the multipath transport.

use std::fmt;

/// Stream identifier. Client-initiated streams are odd, server-initiated even.
pub type StreamId = u32;

/// Path identifier, carried in a single byte on the wire.
pub type PathId = u8;

/// Number of bytes.
pub type ByteCount = u64;

/// Packet number within one path's number space.
pub type PacketNumber = u64;

/// Stream carrying the cryptographic handshake.
pub const CRYPTO_STREAM_ID: StreamId = 1;

/// Stream carrying compressed request/response headers.
pub const HEADER_STREAM_ID: StreamId = 3;

/// Pseudo stream at the top of the dependency tree.
pub const ROOT_STREAM_ID: StreamId = 0;

/// Path the connection was established on.
pub const INITIAL_PATH_ID: PathId = 0;

/// Weight given to streams whose priority was never signalled.
pub const DEFAULT_STREAM_WEIGHT: u8 = 128;

/// Weight given to peer-opened streams before their priority arrives.
pub const REMOTE_STREAM_WEIGHT: u8 = u8::MAX;

/// Streams allowed per connection unless negotiated otherwise.
pub const MAX_STREAMS_PER_CONNECTION: u32 = 100;

/// How far below the highest peer stream id an incoming id may fall before
/// it is treated as a protocol violation rather than an already-closed stream.
pub const MAX_NEW_STREAM_ID_DELTA: StreamId = 4 * MAX_STREAMS_PER_CONNECTION;

/// Largest packet this endpoint assembles.
pub const MAX_PACKET_SIZE: ByteCount = 1350;

/// Returns true for the crypto and header streams, which bypass flow control
/// and priority-based path selection.
pub fn is_control_stream(id: StreamId) -> bool {
    id == CRYPTO_STREAM_ID || id == HEADER_STREAM_ID
}

/// Which side of the connection this endpoint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Perspective {
    Client,
    Server,
}

impl Perspective {
    /// First stream id this side allocates for locally opened streams.
    pub fn first_local_stream(self) -> StreamId {
        match self {
            Perspective::Client => 1,
            Perspective::Server => 2,
        }
    }

    /// First stream id the peer is expected to open.
    pub fn first_remote_stream(self) -> StreamId {
        match self {
            Perspective::Client => 2,
            Perspective::Server => 1,
        }
    }

    /// Whether `id` has the parity of streams opened by this side.
    pub fn is_local_stream(self, id: StreamId) -> bool {
        match self {
            Perspective::Client => id % 2 == 1,
            Perspective::Server => id % 2 == 0,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Perspective::Client => Perspective::Server,
            Perspective::Server => Perspective::Client,
        }
    }
}

impl fmt::Display for Perspective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Perspective::Client => write!(f, "client"),
            Perspective::Server => write!(f, "server"),
        }
    }
}

/// Protection level a packet was sent with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EncryptionLevel {
    Unencrypted,
    Secure,
    ForwardSecure,
}

/// RFC 7540 style stream priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority {
    /// Relative share among siblings.
    pub weight: u8,
    /// Parent stream; 0 is the root.
    pub dependency: StreamId,
    /// Whether the stream becomes the sole child of its parent.
    pub exclusive: bool,
}

impl Priority {
    pub fn new(weight: u8, dependency: StreamId, exclusive: bool) -> Self {
        Self {
            weight,
            dependency,
            exclusive,
        }
    }

    /// Priority used for streams opened by the peer.
    pub fn remote() -> Self {
        Self::new(REMOTE_STREAM_WEIGHT, ROOT_STREAM_ID, false)
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::new(DEFAULT_STREAM_WEIGHT, ROOT_STREAM_ID, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_streams() {
        assert!(is_control_stream(1));
        assert!(is_control_stream(3));
        assert!(!is_control_stream(0));
        assert!(!is_control_stream(5));
    }

    #[test]
    fn parity_follows_perspective() {
        assert!(Perspective::Client.is_local_stream(5));
        assert!(!Perspective::Client.is_local_stream(4));
        assert!(Perspective::Server.is_local_stream(2));
        assert!(!Perspective::Server.is_local_stream(7));
        assert_eq!(Perspective::Server.first_remote_stream(), 1);
        assert_eq!(Perspective::Client.first_remote_stream(), 2);
        assert_eq!(Perspective::Client.opposite(), Perspective::Server);
    }

    #[test]
    fn remote_priority_is_heaviest() {
        let p = Priority::remote();
        assert_eq!(p.weight, 255);
        assert_eq!(p.dependency, ROOT_STREAM_ID);
        assert!(!p.exclusive);
        assert_eq!(Priority::default().weight, DEFAULT_STREAM_WEIGHT);
    }
}
