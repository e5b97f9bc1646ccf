//! Shared vocabulary for the mpquic crates: identifiers, perspectives,
//! priorities and endpoint parsing.

mod endpoint;
pub mod protocol;

pub use endpoint::{
    parse_host_port, resolve_host_port, AddressFamily, AddressKind, ConfigError, HostPort,
};
pub use protocol::{
    is_control_stream, ByteCount, EncryptionLevel, PacketNumber, PathId, Perspective, Priority,
    StreamId, CRYPTO_STREAM_ID, DEFAULT_STREAM_WEIGHT, HEADER_STREAM_ID, INITIAL_PATH_ID,
    MAX_NEW_STREAM_ID_DELTA, MAX_PACKET_SIZE, MAX_STREAMS_PER_CONNECTION, REMOTE_STREAM_WEIGHT,
    ROOT_STREAM_ID,
};

/// Port the path advisor listens on unless told otherwise.
pub const DEFAULT_ADVISOR_PORT: u16 = 5555;
