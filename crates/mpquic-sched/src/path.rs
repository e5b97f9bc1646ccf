//! Paths of a multipath connection.
//!
//! A [`Path`] pairs the scheduler's view of a path (assigned streams, the
//! potentially-failed flag) with a [`PathController`], the congestion, loss
//! and RTT machinery that lives outside this crate.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use mpquic_core::{PacketNumber, PathId, StreamId};

use crate::frame::{AckFrame, PackedPacket, RetransmittablePacket, StopWaitingFrame};

/// Congestion control, ACK handling and loss detection of one path.
pub trait PathController: Send + Sync {
    /// Whether the congestion window has room for another packet.
    fn sending_allowed(&self) -> bool;

    /// Next packet declared lost, if any.
    fn dequeue_packet_for_retransmission(&mut self) -> Option<RetransmittablePacket>;

    fn least_unacked(&self) -> PacketNumber;

    /// Packets sent, retransmitted and lost so far.
    fn statistics(&self) -> (u64, u64, u64);

    fn smoothed_rtt(&self) -> Duration;

    /// Bandwidth estimate in bits per second.
    fn bandwidth(&self) -> u64;

    /// Whether the next packet must be retransmittable so the peer keeps
    /// acknowledging.
    fn should_send_retransmittable(&mut self) -> bool;

    fn stop_waiting_frame(&mut self, force: bool) -> Option<StopWaitingFrame>;

    /// Pending ACK for packets received on this path.
    fn ack_frame(&mut self) -> Option<AckFrame>;

    fn on_packet_sent(&mut self, packet: &PackedPacket);
}

pub struct Path {
    id: PathId,
    pub(crate) stream_ids: Vec<StreamId>,
    potentially_failed: bool,
    local_addr: Option<SocketAddr>,
    least_unacked: PacketNumber,
    controller: Box<dyn PathController>,
}

impl std::fmt::Debug for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Path")
            .field("id", &self.id)
            .field("stream_ids", &self.stream_ids)
            .field("potentially_failed", &self.potentially_failed)
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

impl Path {
    pub fn new(id: PathId, controller: Box<dyn PathController>) -> Self {
        Self {
            id,
            stream_ids: Vec::new(),
            potentially_failed: false,
            local_addr: None,
            least_unacked: 0,
            controller,
        }
    }

    pub fn with_local_addr(mut self, addr: SocketAddr) -> Self {
        self.local_addr = Some(addr);
        self
    }

    pub fn id(&self) -> PathId {
        self.id
    }

    /// Streams assigned to this path, in assignment order.
    pub fn stream_ids(&self) -> &[StreamId] {
        &self.stream_ids
    }

    pub fn has_stream(&self, id: StreamId) -> bool {
        self.stream_ids.contains(&id)
    }

    pub(crate) fn assign_stream(&mut self, id: StreamId) {
        if !self.has_stream(id) {
            self.stream_ids.push(id);
        }
    }

    /// Drop `id` from the path and return the position it held.
    pub(crate) fn unassign_stream(&mut self, id: StreamId) -> Option<usize> {
        let pos = self.stream_ids.iter().position(|&s| s == id)?;
        self.stream_ids.remove(pos);
        Some(pos)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn potentially_failed(&self) -> bool {
        self.potentially_failed
    }

    pub fn set_potentially_failed(&mut self, failed: bool) {
        self.potentially_failed = failed;
    }

    pub fn sending_allowed(&self) -> bool {
        self.controller.sending_allowed()
    }

    pub fn smoothed_rtt(&self) -> Duration {
        self.controller.smoothed_rtt()
    }

    pub fn bandwidth(&self) -> u64 {
        self.controller.bandwidth()
    }

    pub fn statistics(&self) -> (u64, u64, u64) {
        self.controller.statistics()
    }

    pub fn least_unacked(&self) -> PacketNumber {
        self.least_unacked
    }

    /// Refresh the cached least-unacked packet number from the controller.
    pub fn update_least_unacked(&mut self) {
        self.least_unacked = self.controller.least_unacked();
    }

    pub fn dequeue_packet_for_retransmission(&mut self) -> Option<RetransmittablePacket> {
        self.controller.dequeue_packet_for_retransmission()
    }

    pub fn should_send_retransmittable(&mut self) -> bool {
        self.controller.should_send_retransmittable()
    }

    pub fn stop_waiting_frame(&mut self, force: bool) -> Option<StopWaitingFrame> {
        self.controller.stop_waiting_frame(force)
    }

    pub fn ack_frame(&mut self) -> Option<AckFrame> {
        self.controller.ack_frame()
    }

    pub fn on_packet_sent(&mut self, packet: &PackedPacket) {
        self.controller.on_packet_sent(packet);
    }
}

/// All paths of a connection.
///
/// `open_paths` keeps the order paths were added in; the send loop rotates
/// over it with a cursor that is reduced modulo its current length on every
/// use, so removals never leave the cursor out of range.
#[derive(Debug, Default)]
pub struct PathSet {
    paths: BTreeMap<PathId, Path>,
    open_paths: Vec<PathId>,
}

impl PathSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a path, replacing any previous path with the same id.
    pub fn insert(&mut self, path: Path) {
        let id = path.id();
        if self.paths.insert(id, path).is_none() {
            self.open_paths.push(id);
        }
    }

    pub fn remove(&mut self, id: PathId) -> Option<Path> {
        self.open_paths.retain(|&p| p != id);
        self.paths.remove(&id)
    }

    pub fn get(&self, id: PathId) -> Option<&Path> {
        self.paths.get(&id)
    }

    pub fn get_mut(&mut self, id: PathId) -> Option<&mut Path> {
        self.paths.get_mut(&id)
    }

    pub fn contains(&self, id: PathId) -> bool {
        self.paths.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Paths in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Path> {
        self.paths.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Path> {
        self.paths.values_mut()
    }

    pub fn ids(&self) -> Vec<PathId> {
        self.paths.keys().copied().collect()
    }

    /// Paths in the order they were opened.
    pub fn open_paths(&self) -> &[PathId] {
        &self.open_paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::ScriptedController;

    fn path(id: PathId) -> Path {
        Path::new(id, Box::new(ScriptedController::new(10, 8_000_000, 4)))
    }

    #[test]
    fn stream_assignment_is_unique() {
        let mut p = path(1);
        p.assign_stream(5);
        p.assign_stream(5);
        p.assign_stream(7);
        assert_eq!(p.stream_ids(), &[5, 7]);
        assert_eq!(p.unassign_stream(5), Some(0));
        assert_eq!(p.stream_ids(), &[7]);
        assert!(!p.has_stream(5));
        assert_eq!(p.unassign_stream(5), None);
    }

    #[test]
    fn open_order_survives_removal() {
        let mut set = PathSet::new();
        set.insert(path(0));
        set.insert(path(3));
        set.insert(path(1));
        assert_eq!(set.open_paths(), &[0, 3, 1]);
        assert_eq!(set.ids(), vec![0, 1, 3]);

        assert!(set.remove(3).is_some());
        assert_eq!(set.open_paths(), &[0, 1]);
        assert!(set.remove(3).is_none());
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn replacing_a_path_keeps_one_entry() {
        let mut set = PathSet::new();
        set.insert(path(1));
        set.insert(path(1));
        assert_eq!(set.open_paths(), &[1]);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn least_unacked_is_refreshed_on_demand() {
        let mut controller = ScriptedController::new(10, 8_000_000, 4);
        controller.least_unacked = 17;
        let mut p = Path::new(2, Box::new(controller));
        assert_eq!(p.least_unacked(), 0);
        p.update_least_unacked();
        assert_eq!(p.least_unacked(), 17);
    }
}
