//! Per-connection state shared by the scheduler, the framer and the
//! application.
//!
//! Locks are always taken in the order packer, paths, ledger, streams map.
//! No lock is held across an await.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mpquic_core::{EncryptionLevel, PathId, Perspective, Priority, StreamId, CRYPTO_STREAM_ID};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::config::Config;
use crate::error::Error;
use crate::flowcontrol::FlowController;
use crate::frame::{ClosePathFrame, PackedPacket, PathsFrame, WindowUpdateFrame};
use crate::framer::StreamFramer;
use crate::packer::PacketPacker;
use crate::path::{Path, PathSet};
use crate::stream::Stream;
use crate::stream_to_path::StreamToPath;
use crate::streams_map::{NewStreamFn, StreamsMap};

/// RTT announced for a path that looks dead.
const FAILED_PATH_RTT: Duration = Duration::from_secs(3600);

/// Hands finished packets to the network.
pub trait PacketSender: Send + Sync {
    fn send(&self, path: PathId, packet: &PackedPacket) -> Result<(), Error>;
}

pub struct Session {
    perspective: Perspective,
    config: Config,
    streams: Arc<StreamsMap>,
    flow: Arc<dyn FlowController>,
    packer: Mutex<PacketPacker>,
    paths: RwLock<PathSet>,
    stream_to_path: Mutex<StreamToPath>,
    sender: Box<dyn PacketSender>,
    handshake_complete: AtomicBool,
    peer_blocked: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("perspective", &self.perspective)
            .field("policy", &self.config.policy)
            .field("streams", &self.streams)
            .field("paths", &*self.paths.read())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session and its crypto stream. Clients open the crypto
    /// stream as their first stream, servers as if the peer opened it.
    pub fn new(
        perspective: Perspective,
        config: Config,
        flow: Arc<dyn FlowController>,
        sender: Box<dyn PacketSender>,
    ) -> Result<Self, Error> {
        let register = Arc::clone(&flow);
        let new_stream: NewStreamFn = Box::new(move |id, priority| {
            register.new_stream(id, !mpquic_core::is_control_stream(id));
            Arc::new(Stream::new(id, priority))
        });
        let streams = Arc::new(StreamsMap::new(perspective, &config, new_stream));
        match perspective {
            Perspective::Client => {
                streams.open_stream(Priority::default())?;
            }
            Perspective::Server => {
                streams.get_or_open(CRYPTO_STREAM_ID)?;
            }
        }

        let framer = StreamFramer::new(Arc::clone(&streams), Arc::clone(&flow), config.policy);
        let packer = PacketPacker::new(perspective, config.max_packet_size, framer);
        Ok(Self {
            perspective,
            streams,
            flow,
            packer: Mutex::new(packer),
            paths: RwLock::new(PathSet::new()),
            stream_to_path: Mutex::new(StreamToPath::new()),
            sender,
            handshake_complete: AtomicBool::new(false),
            peer_blocked: AtomicBool::new(false),
            config,
        })
    }

    pub fn perspective(&self) -> Perspective {
        self.perspective
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn streams(&self) -> &Arc<StreamsMap> {
        &self.streams
    }

    pub fn flow(&self) -> &Arc<dyn FlowController> {
        &self.flow
    }

    pub(crate) fn packer(&self) -> &Mutex<PacketPacker> {
        &self.packer
    }

    pub(crate) fn paths(&self) -> &RwLock<PathSet> {
        &self.paths
    }

    pub(crate) fn stream_to_path(&self) -> &Mutex<StreamToPath> {
        &self.stream_to_path
    }

    /// Run `f` against the path set.
    pub fn with_paths<R>(&self, f: impl FnOnce(&PathSet) -> R) -> R {
        f(&self.paths.read())
    }

    /// Run `f` against one path.
    pub fn with_path_mut<R>(&self, id: PathId, f: impl FnOnce(&mut Path) -> R) -> Result<R, Error> {
        let mut paths = self.paths.write();
        let path = paths.get_mut(id).ok_or(Error::UnknownPath(id))?;
        Ok(f(path))
    }

    /// Paths `stream` is assigned to.
    pub fn paths_of_stream(&self, stream: StreamId) -> Result<Vec<PathId>, Error> {
        self.stream_to_path
            .lock()
            .get(stream)
            .map(|paths| paths.to_vec())
    }

    pub fn add_path(&self, path: Path) {
        info!(
            path_id = path.id(),
            local_addr = ?path.local_addr(),
            perspective = %self.perspective,
            "path added"
        );
        self.paths.write().insert(path);
    }

    /// Remove a path, forget its stream assignments and tell the peer.
    pub fn close_path(&self, id: PathId) -> Result<(), Error> {
        let path = self.paths.write().remove(id).ok_or(Error::UnknownPath(id))?;
        {
            let mut ledger = self.stream_to_path.lock();
            for &stream in path.stream_ids() {
                if let Err(err) = ledger.delete_one(stream, id) {
                    debug!(stream_id = stream, path_id = id, %err, "stale assignment");
                }
            }
        }
        self.streams.forget_path(id);
        let mut packer = self.packer.lock();
        packer.forget_path(id);
        packer
            .framer_mut()
            .add_close_path_frame_for_transmission(ClosePathFrame {
                path_id: id,
                largest_acked: path.least_unacked().saturating_sub(1),
            });
        info!(path_id = id, streams = path.stream_ids().len(), "path closed");
        Ok(())
    }

    /// Announce a local address to the peer.
    pub fn advertise_address(&self, addr: SocketAddr) {
        self.packer
            .lock()
            .framer_mut()
            .add_address_for_transmission(addr);
    }

    pub fn open_stream(&self, priority: Priority) -> Result<Arc<Stream>, Error> {
        self.streams.open_stream(priority)
    }

    pub async fn open_stream_sync(&self, priority: Priority) -> Result<Arc<Stream>, Error> {
        self.streams.open_stream_sync(priority).await
    }

    pub async fn accept_stream(&self) -> Result<Arc<Stream>, Error> {
        self.streams.accept_stream().await
    }

    /// Stream `id`, opened if the peer uses it for the first time.
    pub fn get_or_open_stream(&self, id: StreamId) -> Result<Option<Arc<Stream>>, Error> {
        self.streams.get_or_open(id)
    }

    /// Drop a finished stream from every structure that refers to it.
    pub fn remove_stream(&self, id: StreamId) -> Result<(), Error> {
        let assigned = self.stream_to_path.lock().delete(id).unwrap_or_default();
        if !assigned.is_empty() {
            let mut paths = self.paths.write();
            for path in assigned {
                if let Some(pos) = paths.get_mut(path).and_then(|p| p.unassign_stream(id)) {
                    self.streams.stream_left_path(path, pos);
                }
            }
        }
        self.streams.remove(id)?;
        self.flow.remove_stream(id);
        Ok(())
    }

    pub fn window_update_frames(&self, force: bool) -> Vec<WindowUpdateFrame> {
        self.flow.window_updates(force)
    }

    /// Record `packet` with its path's controller and put it on the wire.
    pub fn send_packed_packet(&self, packet: &PackedPacket) -> Result<(), Error> {
        {
            let mut paths = self.paths.write();
            let path = paths
                .get_mut(packet.path_id)
                .ok_or(Error::UnknownPath(packet.path_id))?;
            path.on_packet_sent(packet);
        }
        self.sender.send(packet.path_id, packet)
    }

    /// Build a PATHS frame from the current path set and queue it.
    pub fn schedule_paths_frame(&self) {
        let frame = {
            let paths = self.paths.read();
            let mut frame = PathsFrame {
                max_num_paths: u8::MAX,
                path_ids: Vec::with_capacity(paths.len()),
                remote_rtts: Vec::with_capacity(paths.len()),
                addrs: Vec::new(),
            };
            for &id in paths.open_paths() {
                let Some(path) = paths.get(id) else {
                    continue;
                };
                frame.path_ids.push(id);
                frame.remote_rtts.push(if path.potentially_failed() {
                    FAILED_PATH_RTT
                } else {
                    path.smoothed_rtt()
                });
                if self.perspective == Perspective::Client {
                    frame.addrs.extend(path.local_addr());
                }
            }
            frame
        };
        debug!(paths = ?frame.path_ids, "scheduling PATHS frame");
        self.packer
            .lock()
            .framer_mut()
            .add_paths_frame_for_transmission(frame);
    }

    /// Switch to forward-secure packets.
    pub fn set_handshake_complete(&self) {
        self.handshake_complete.store(true, Ordering::Release);
        self.packer
            .lock()
            .set_encryption_level(EncryptionLevel::ForwardSecure);
        info!(perspective = %self.perspective, "handshake complete");
    }

    pub fn handshake_complete(&self) -> bool {
        self.handshake_complete.load(Ordering::Acquire)
    }

    /// The peer reported being flow control blocked; the next flush
    /// announces every window that moved.
    pub fn set_peer_blocked(&self) {
        self.peer_blocked.store(true, Ordering::Release);
    }

    pub(crate) fn take_peer_blocked(&self) -> bool {
        self.peer_blocked.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn peer_blocked(&self) -> bool {
        self.peer_blocked.load(Ordering::Acquire)
    }

    /// Fail every stream and wake tasks waiting to open or accept one.
    pub fn close_with_error(&self, err: Error) {
        info!(%err, "closing session");
        self.streams.close_with_error(err);
    }
}
