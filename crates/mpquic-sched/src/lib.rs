//! Stream scheduling and packetization for multipath QUIC.
//!
//! Streams are ordered by an HTTP/2 style priority tree, placed on paths by
//! the [`PathScheduler`] and cut into packets per path by the
//! [`PacketPacker`]. Congestion control and the socket stay outside this
//! crate behind [`PathController`] and [`PacketSender`].

pub mod advisor;
pub mod config;
pub mod error;
pub mod flowcontrol;
pub mod frame;
pub mod framer;
pub mod packer;
pub mod path;
pub mod priority_tree;
pub mod scheduler;
pub mod session;
pub mod stream;
pub mod stream_to_path;
pub mod streams_map;

#[cfg(test)]
mod testutil;

pub use advisor::{AdvisorRequest, AdvisorResponse, PathAdvisor, PathStats, TcpAdvisor};
pub use config::{Config, PathPolicy};
pub use error::{AdvisorError, Error};
pub use flowcontrol::{FlowController, WindowFlowController};
pub use packer::PacketPacker;
pub use path::{Path, PathController, PathSet};
pub use priority_tree::PriorityTree;
pub use scheduler::PathScheduler;
pub use session::{PacketSender, Session};
pub use stream::Stream;
pub use streams_map::StreamsMap;

/// Result type for scheduler operations.
pub type Result<T> = std::result::Result<T, Error>;
