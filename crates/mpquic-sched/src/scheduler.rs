//! Stream to path assignment and the per-connection send loop.
//!
//! Every send opportunity starts with an assignment pass that places new
//! streams on paths, then visits the paths round-robin. Each path sends
//! lost data first, then fresh data of the streams assigned to it, until
//! its congestion window is full or it has nothing left. Paths that did
//! not get to send flush their ACKs and window updates at the end.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use mpquic_core::{
    is_control_stream, ByteCount, EncryptionLevel, PathId, Perspective, StreamId,
    CRYPTO_STREAM_ID, HEADER_STREAM_ID, INITIAL_PATH_ID,
};
use tracing::{debug, info, trace, warn};

use crate::advisor::{AdvisorRequest, PathAdvisor, PathStats, TcpAdvisor};
use crate::config::{Config, PathPolicy};
use crate::error::Error;
use crate::frame::{Frame, RetransmittablePacket, WindowUpdateFrame};
use crate::path::{Path, PathSet};
use crate::session::Session;
use crate::stream::Stream;
use crate::streams_map::StreamsMap;

const MEGABIT: f64 = 1_048_576.0;

// Bits below which a volume counts as fully distributed.
const VOLUME_EPSILON: f64 = 1e-6;

/// Outcome of trying to place one stream.
#[derive(Debug, Clone, PartialEq)]
enum Placement {
    /// Not ready yet; look at the next stream.
    Skip,
    /// No path can take the stream now; stop assigning this round.
    Stall,
    /// Paths and the bytes budgeted on each.
    Assign(Vec<(PathId, f64)>),
}

/// Scheduling state of one connection.
pub struct PathScheduler {
    policy: PathPolicy,
    min_paths_for_distribution: usize,
    advisor: Option<Arc<dyn PathAdvisor>>,
    /// Packets sent per path.
    quotas: HashMap<PathId, u64>,
    /// Data streams assigned per path.
    numstreams: HashMap<PathId, u64>,
    round_robin_index_path: usize,
    // Streams whose placement failed after their size was read; the tree
    // does not hand them out again.
    deferred: Vec<StreamId>,
}

impl std::fmt::Debug for PathScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathScheduler")
            .field("policy", &self.policy)
            .field("advisor", &self.advisor.is_some())
            .field("quotas", &self.quotas)
            .field("numstreams", &self.numstreams)
            .field("round_robin_index_path", &self.round_robin_index_path)
            .finish_non_exhaustive()
    }
}

impl PathScheduler {
    /// A scheduler for `config`, talking to the configured advisor if any.
    pub fn new(config: &Config) -> Result<Self, Error> {
        let advisor = TcpAdvisor::from_config(config)?.map(|a| Arc::new(a) as Arc<dyn PathAdvisor>);
        Ok(Self {
            policy: config.policy,
            min_paths_for_distribution: config.min_paths_for_distribution,
            advisor,
            quotas: HashMap::new(),
            numstreams: HashMap::new(),
            round_robin_index_path: 0,
            deferred: Vec::new(),
        })
    }

    /// Use `advisor` instead of the configured one.
    pub fn with_advisor(mut self, advisor: Arc<dyn PathAdvisor>) -> Self {
        self.advisor = Some(advisor);
        self
    }

    pub fn policy(&self) -> PathPolicy {
        self.policy
    }

    /// Packets sent on `path` so far.
    pub fn quota(&self, path: PathId) -> u64 {
        self.quotas.get(&path).copied().unwrap_or(0)
    }

    /// Data streams assigned to `path` so far.
    pub fn num_streams(&self, path: PathId) -> u64 {
        self.numstreams.get(&path).copied().unwrap_or(0)
    }

    /// Place new streams on paths. Returns false when a stream could not be
    /// placed; pending ACKs and window updates have been flushed then.
    pub async fn assign_streams(&mut self, s: &Session) -> Result<bool, Error> {
        s.streams().sort_by_priority();

        // Control streams follow the fastest path.
        for id in [CRYPTO_STREAM_ID, HEADER_STREAM_ID] {
            let Some(stream) = s.streams().get(id) else {
                continue;
            };
            let best = {
                let paths = s.paths().read();
                self.find_path_low_latency(&paths)
            };
            let Some(best) = best else {
                debug!(stream_id = id, "no path for control stream");
                self.stall(s)?;
                return Ok(false);
            };
            self.follow_path(s, &stream, best);
        }

        let order = self.assignment_order(s);
        for (i, &id) in order.iter().enumerate() {
            if is_control_stream(id) || s.stream_to_path().lock().contains(id) {
                continue;
            }
            let Some(stream) = s.streams().get(id) else {
                continue;
            };
            match self.place(s, &stream).await? {
                Placement::Skip => {
                    if stream.checksize() {
                        self.defer(id);
                    }
                }
                Placement::Stall => {
                    debug!(stream_id = id, "no path for stream, deferring");
                    for &rest in &order[i..] {
                        if s.streams().get(rest).is_some_and(|st| st.checksize()) {
                            self.defer(rest);
                        }
                    }
                    self.stall(s)?;
                    return Ok(false);
                }
                Placement::Assign(volumes) => {
                    let mut placed = false;
                    for (path, volume) in volumes {
                        placed |= self.assign(s, &stream, path, volume);
                    }
                    if !placed {
                        self.defer(id);
                    }
                }
            }
        }
        Ok(true)
    }

    // The tree's priority order plus streams deferred earlier, heaviest
    // first.
    fn assignment_order(&mut self, s: &Session) -> Vec<StreamId> {
        let mut order = s.streams().priority_order();
        for id in std::mem::take(&mut self.deferred) {
            if !order.contains(&id) {
                order.push(id);
            }
        }
        order.sort_by_key(|&id| Reverse(s.streams().get(id).map_or(0, |s| s.weight())));
        order
    }

    fn defer(&mut self, id: StreamId) {
        if !self.deferred.contains(&id) {
            self.deferred.push(id);
        }
    }

    async fn place(&self, s: &Session, stream: &Arc<Stream>) -> Result<Placement, Error> {
        if s.perspective() == Perspective::Client {
            let best = {
                let paths = s.paths().read();
                self.find_path_low_latency(&paths)
            };
            return Ok(match best {
                Some(path) => Placement::Assign(vec![(path, f64::INFINITY)]),
                None => Placement::Stall,
            });
        }

        if s.paths().read().len() < self.min_paths_for_distribution {
            return Ok(Placement::Skip);
        }

        match self.policy {
            PathPolicy::SinglePath => {
                let choice = {
                    let paths = s.paths().read();
                    self.choose_path(&paths, s.streams(), stream)
                };
                Ok(match choice {
                    Some(path) => Placement::Assign(vec![(path, f64::INFINITY)]),
                    None if stream.checksize() => Placement::Stall,
                    None => Placement::Skip,
                })
            }
            PathPolicy::MultiPath => match &self.advisor {
                Some(advisor) => self.choose_paths_rl(s, stream, advisor.as_ref()).await,
                None => {
                    let volumes = {
                        let paths = s.paths().read();
                        self.distribute_volume(&paths, s.streams(), stream)
                    };
                    Ok(match volumes {
                        None => Placement::Skip,
                        Some(v) if v.is_empty() => Placement::Stall,
                        Some(v) => Placement::Assign(v),
                    })
                }
            },
        }
    }

    // Record that `stream` is sent on `path` with `volume` bytes budgeted.
    // Assigning a known pair changes nothing.
    fn assign(&mut self, s: &Session, stream: &Stream, path_id: PathId, volume: f64) -> bool {
        let id = stream.id();
        let mut paths = s.paths().write();
        let Some(path) = paths.get_mut(path_id) else {
            warn!(stream_id = id, path_id, "cannot assign stream to unknown path");
            return false;
        };
        let mut ledger = s.stream_to_path().lock();
        if ledger.find(id, path_id) {
            return true;
        }
        ledger.add(id, path_id);
        path.assign_stream(id);
        stream.set_path_volume(path_id, volume);
        if !is_control_stream(id) {
            *self.numstreams.entry(path_id).or_default() += 1;
        }
        info!(
            stream_id = id,
            size = stream.size(),
            weight = stream.weight(),
            path_id,
            rtt_ms = path.smoothed_rtt().as_millis() as u64,
            volume,
            "assigned stream to path"
        );
        true
    }

    // Move a control stream to `best` unless it is there already.
    fn follow_path(&mut self, s: &Session, stream: &Stream, best: PathId) {
        let id = stream.id();
        let mut paths = s.paths().write();
        let mut ledger = s.stream_to_path().lock();
        if ledger.get(id).is_ok_and(|p| p.len() == 1 && p[0] == best) {
            return;
        }
        let previous = ledger.delete(id).unwrap_or_default();
        for &old in &previous {
            if let Some(pos) = paths.get_mut(old).and_then(|p| p.unassign_stream(id)) {
                s.streams().stream_left_path(old, pos);
            }
        }
        ledger.add(id, best);
        if let Some(path) = paths.get_mut(best) {
            path.assign_stream(id);
        }
        stream.set_path_volume(best, f64::INFINITY);
        debug!(stream_id = id, from = ?previous, to = best, "control stream follows fastest path");
    }

    fn stall(&mut self, s: &Session) -> Result<(), Error> {
        let window_updates = s.window_update_frames(false);
        self.ack_remaining_paths(s, window_updates)
    }

    /// The usable path with the lowest smoothed RTT. The initial path is
    /// only used while it is the only one. Unprobed paths lose against
    /// probed ones and among themselves the one that sent less wins.
    pub fn find_path_low_latency(&self, paths: &PathSet) -> Option<PathId> {
        if paths.len() <= 1 {
            return initial_path_if_allowed(paths);
        }
        self.lowest_latency(usable_paths(paths))
    }

    /// Like [`PathScheduler::find_path_low_latency`], restricted to the
    /// paths carrying the fewest data streams.
    pub fn find_path_by_stream_quota(&self, paths: &PathSet) -> Option<PathId> {
        if paths.len() <= 1 {
            return initial_path_if_allowed(paths);
        }
        let least_loaded = self.check_path_quota(paths);
        self.lowest_latency(usable_paths(paths).filter(|p| least_loaded.contains(&p.id())))
    }

    // Non-initial paths with the lowest stream count.
    fn check_path_quota(&self, paths: &PathSet) -> Vec<PathId> {
        let loads: Vec<(PathId, u64)> = paths
            .ids()
            .into_iter()
            .filter(|&id| id != INITIAL_PATH_ID)
            .map(|id| (id, self.num_streams(id)))
            .collect();
        let Some(min) = loads.iter().map(|&(_, n)| n).min() else {
            return Vec::new();
        };
        loads
            .into_iter()
            .filter(|&(_, n)| n == min)
            .map(|(id, _)| id)
            .collect()
    }

    fn lowest_latency<'a>(&self, candidates: impl Iterator<Item = &'a Path>) -> Option<PathId> {
        let mut best: Option<(PathId, Duration, u64)> = None;
        for path in candidates {
            let rtt = path.smoothed_rtt();
            let quota = self.quota(path.id());
            let better = match best {
                None => true,
                Some((_, best_rtt, best_quota)) => match (rtt.is_zero(), best_rtt.is_zero()) {
                    (true, false) => false,
                    (false, true) => true,
                    (true, true) => quota < best_quota,
                    (false, false) => rtt < best_rtt,
                },
            };
            if better {
                best = Some((path.id(), rtt, quota));
            }
        }
        best.map(|(id, ..)| id)
    }

    /// The path on which `stream` would complete first, given its weighted
    /// share of each path's bandwidth. `None` until the stream's size is
    /// known. Without any bandwidth estimate the least loaded path wins.
    pub fn choose_path(&self, paths: &PathSet, streams: &StreamsMap, stream: &Stream) -> Option<PathId> {
        if paths.len() <= 1 {
            return initial_path_if_allowed(paths);
        }
        let size = stream.detect_size()?;
        let weight = f64::from(stream.weight());

        let mut best: Option<(PathId, f64)> = None;
        for path in usable_paths(paths) {
            let others = weight_on_path(path, streams);
            let time = completion_time(size, weight, others, path.bandwidth(), path.smoothed_rtt());
            trace!(
                stream_id = stream.id(),
                path_id = path.id(),
                weight_on_path = others,
                estimated_s = time,
                "completion time estimate"
            );
            if best.map_or(true, |(_, t)| time < t) {
                best = Some((path.id(), time));
            }
        }
        match best {
            Some((_, time)) if time.is_infinite() => self.find_path_by_stream_quota(paths),
            other => other.map(|(id, _)| id),
        }
    }

    /// Split `stream` over the usable paths so that it finishes on all of
    /// them at about the same time. Faster paths are filled until their
    /// one-way delay matches the next path's, the rest is shared by
    /// bandwidth. Returns bytes per path; `None` until the size is known.
    pub fn distribute_volume(
        &self,
        paths: &PathSet,
        streams: &StreamsMap,
        stream: &Stream,
    ) -> Option<Vec<(PathId, f64)>> {
        let size = stream.detect_size()?;
        if paths.len() <= 1 {
            return Some(
                initial_path_if_allowed(paths)
                    .map(|id| vec![(id, size as f64)])
                    .unwrap_or_default(),
            );
        }

        let weight = f64::from(stream.weight());
        let mut lanes: Vec<Lane> = usable_paths(paths)
            .map(|path| {
                let others = weight_on_path(path, streams);
                let share = if weight + others > 0.0 {
                    weight / (weight + others)
                } else {
                    0.0
                };
                Lane {
                    id: path.id(),
                    bandwidth: share * path.bandwidth() as f64,
                    owd: path.smoothed_rtt().as_secs_f64() / 2.0,
                    volume: 0.0,
                }
            })
            .collect();
        if lanes.is_empty() {
            return Some(Vec::new());
        }
        lanes.sort_by(|a, b| a.owd.total_cmp(&b.owd));

        let mut volume = size as f64 * 8.0;
        for i in 0..lanes.len() - 1 {
            let owd_gap = lanes[i + 1].owd - lanes[i].owd;
            if owd_gap == 0.0 {
                break;
            }
            let bandwidth_sum: f64 = lanes[..=i].iter().map(|l| l.bandwidth).sum();
            let gap = owd_gap * bandwidth_sum;
            if volume > gap {
                for lane in &mut lanes[..=i] {
                    let step = owd_gap * lane.bandwidth;
                    lane.volume += step;
                    volume -= step;
                }
            } else {
                for lane in &mut lanes[..=i] {
                    lane.volume += volume * lane.bandwidth / bandwidth_sum;
                }
                volume = 0.0;
                break;
            }
        }

        if volume > VOLUME_EPSILON {
            let all: f64 = lanes.iter().map(|l| l.bandwidth).sum();
            if all > 0.0 {
                for lane in &mut lanes {
                    lane.volume += volume * lane.bandwidth / all;
                }
            } else {
                lanes[0].volume += volume;
            }
        }

        for lane in &lanes {
            trace!(
                stream_id = stream.id(),
                path_id = lane.id,
                bits = lane.volume,
                finish_s = lane.volume / lane.bandwidth + lane.owd,
                "volume distribution"
            );
        }
        Some(
            lanes
                .into_iter()
                .filter(|l| l.volume > VOLUME_EPSILON)
                .map(|l| (l.id, l.volume / 8.0))
                .collect(),
        )
    }

    // Ask the advisor to pick between the first two usable paths. The whole
    // stream goes to the chosen one.
    async fn choose_paths_rl(
        &self,
        s: &Session,
        stream: &Stream,
        advisor: &dyn PathAdvisor,
    ) -> Result<Placement, Error> {
        let Some(size) = stream.detect_size() else {
            return Ok(Placement::Skip);
        };
        let request = {
            let paths = s.paths().read();
            if paths.len() <= 1 {
                return Ok(match initial_path_if_allowed(&paths) {
                    Some(id) => Placement::Assign(vec![(id, size as f64)]),
                    None => Placement::Stall,
                });
            }
            let available: Vec<&Path> = usable_paths(&paths).collect();
            if available.len() < 2 {
                return Ok(Placement::Stall);
            }
            AdvisorRequest {
                stream_id: stream.id(),
                request_path: stream.request_path(),
                path1: PathStats::of(available[0]),
                path2: PathStats::of(available[1]),
            }
        };

        match advisor.choose_path(&request).await {
            Ok(path) => Ok(Placement::Assign(vec![(path, size as f64)])),
            Err(err) => {
                warn!(stream_id = stream.id(), %err, "path advisor unavailable");
                Ok(Placement::Stall)
            }
        }
    }

    /// Send as much as the paths allow.
    pub async fn send_packets(&mut self, s: &Session) -> Result<(), Error> {
        self.assign_streams(s).await?;

        let mut window_updates = s.window_update_frames(false);
        {
            let mut packer = s.packer().lock();
            for &frame in &window_updates {
                packer.queue_control_frame(Frame::WindowUpdate(frame), None);
            }
        }

        let open_paths = s.paths().read().open_paths().to_vec();
        let n = open_paths.len();
        if n == 0 {
            return Ok(());
        }
        let start = self.round_robin_index_path % n;

        loop {
            let mut has_windows = false;
            let mut path_sent = false;

            for i in 0..n {
                let path_id = open_paths[(i + start) % n];
                self.round_robin_index_path = (self.round_robin_index_path + 1) % n;

                let stream_ids = {
                    let mut paths = s.paths().write();
                    let Some(path) = paths.get_mut(path_id) else {
                        continue;
                    };
                    path.update_least_unacked();
                    path.stream_ids().to_vec()
                };

                // One packet per assigned stream keeps the paths fair.
                for _ in 0..stream_ids.len() {
                    let allowed = s
                        .paths()
                        .read()
                        .get(path_id)
                        .is_some_and(Path::sending_allowed);
                    has_windows |= allowed;
                    if !allowed {
                        trace!(path_id, "congestion window full");
                        break;
                    }

                    if let Some(packet) = self.get_retransmission_of_path(s, path_id) {
                        self.retransmit_handshake_packet(s, path_id, &packet)?;
                    }
                    let has_stream_retransmission =
                        s.packer().lock().framer().has_frames_for_retransmission();
                    queue_ack(s, path_id, has_stream_retransmission);
                    s.packer().lock().drain_framer_control_frames(path_id);

                    let sent = self.perform_packet_sending(s, path_id, &stream_ids, &window_updates)?;
                    window_updates.clear();
                    path_sent |= sent;
                    if !sent {
                        break;
                    }
                }
            }

            if !path_sent || !has_windows {
                return self.ack_remaining_paths(s, window_updates);
            }
        }
    }

    // Hand lost frames of `path_id` to the framer and the packer. A lost
    // handshake packet is returned for immediate resending instead, unless
    // the handshake is over.
    fn get_retransmission_of_path(&mut self, s: &Session, path_id: PathId) -> Option<RetransmittablePacket> {
        let mut schedule_paths = false;
        let handshake = loop {
            let Some(packet) = s
                .with_path_mut(path_id, |p| p.dequeue_packet_for_retransmission())
                .ok()
                .flatten()
            else {
                break None;
            };
            if packet.encryption_level != EncryptionLevel::ForwardSecure {
                if s.handshake_complete() {
                    continue;
                }
                debug!(path_id, number = packet.number, "dequeued handshake retransmission");
                break Some(packet);
            }
            trace!(path_id, number = packet.number, "dequeued retransmission");

            let mut packer = s.packer().lock();
            for frame in packet.frames_for_retransmission() {
                match frame {
                    Frame::Stream(f) => packer.framer_mut().add_frame_for_retransmission(f.clone()),
                    // Only while no later update superseded it.
                    Frame::WindowUpdate(f) => {
                        let current = s.flow().receive_window(f.stream_id);
                        if current.is_ok_and(|offset| f.byte_offset >= offset) {
                            packer.queue_control_frame(frame.clone(), Some(path_id));
                        }
                    }
                    Frame::Paths(_) => schedule_paths = true,
                    other => packer.queue_control_frame(other.clone(), Some(path_id)),
                }
            }
        };
        if schedule_paths {
            s.schedule_paths_frame();
        }
        handshake
    }

    fn retransmit_handshake_packet(
        &mut self,
        s: &Session,
        path_id: PathId,
        lost: &RetransmittablePacket,
    ) -> Result<(), Error> {
        let stop_waiting = s.with_path_mut(path_id, |p| p.stop_waiting_frame(true))?;
        let packet = {
            let mut packer = s.packer().lock();
            if let Some(frame) = stop_waiting {
                packer.queue_control_frame(Frame::StopWaiting(frame), Some(path_id));
            }
            packer.pack_handshake_retransmission(lost, path_id)
        };
        if let Some(packet) = packet {
            info!(path_id, lost = lost.number, number = packet.number, "retransmitting handshake packet");
            s.send_packed_packet(&packet)?;
        }
        Ok(())
    }

    fn perform_packet_sending(
        &mut self,
        s: &Session,
        path_id: PathId,
        stream_ids: &[StreamId],
        window_updates: &[WindowUpdateFrame],
    ) -> Result<bool, Error> {
        let Ok(ping) = s.with_path_mut(path_id, |p| p.should_send_retransmittable()) else {
            return Ok(false);
        };
        let packet = {
            let mut packer = s.packer().lock();
            if ping {
                packer.queue_control_frame(Frame::Ping, Some(path_id));
            }
            packer.pack_packet_of_path(path_id, stream_ids)?
        };
        let Some(packet) = packet else {
            return Ok(false);
        };
        s.send_packed_packet(&packet)?;

        // Window updates go out twice.
        if !window_updates.is_empty() {
            let mut packer = s.packer().lock();
            for &frame in window_updates {
                packer.queue_control_frame(Frame::WindowUpdate(frame), Some(path_id));
            }
        }
        *self.quotas.entry(path_id).or_default() += 1;

        for stream_id in packet.fin_streams() {
            s.with_paths(|paths| {
                for path in paths.iter() {
                    let (sent, retransmitted, lost) = path.statistics();
                    info!(
                        stream_id,
                        path_id = path.id(),
                        sent,
                        retransmitted,
                        lost,
                        rtt_ms = path.smoothed_rtt().as_millis() as u64,
                        "stream finished"
                    );
                }
            });
        }
        Ok(true)
    }

    // Send pending ACKs and window updates on every path, in their own
    // packets if need be.
    fn ack_remaining_paths(
        &mut self,
        s: &Session,
        window_updates: Vec<WindowUpdateFrame>,
    ) -> Result<(), Error> {
        let window_updates = if window_updates.is_empty() {
            s.window_update_frames(s.peer_blocked())
        } else {
            window_updates
        };

        let ids = s.paths().read().ids();
        for path_id in ids {
            let Ok(ack) = s.with_path_mut(path_id, |p| p.ack_frame()) else {
                continue;
            };
            if !window_updates.is_empty() {
                let mut packer = s.packer().lock();
                for &frame in &window_updates {
                    packer.queue_control_frame(Frame::WindowUpdate(frame), Some(path_id));
                }
            }
            if ack.is_none() && (window_updates.is_empty() || path_id == INITIAL_PATH_ID) {
                continue;
            }

            let stop_waiting = s
                .with_path_mut(path_id, |p| p.stop_waiting_frame(false))
                .ok()
                .flatten();
            let packet = {
                let mut packer = s.packer().lock();
                if let Some(frame) = stop_waiting {
                    packer.queue_control_frame(Frame::StopWaiting(frame), Some(path_id));
                }
                match ack {
                    Some(ack) => {
                        packer.queue_control_frame(Frame::Ack(ack), Some(path_id));
                        packer.pack_ack_packet(path_id)
                    }
                    None => packer.pack_packet_of_path(path_id, &[])?,
                }
            };
            if let Some(packet) = packet {
                trace!(path_id, frames = packet.frames.len(), "flushing ACK and window updates");
                s.send_packed_packet(&packet)?;
            }
        }
        s.take_peer_blocked();
        Ok(())
    }
}

struct Lane {
    id: PathId,
    /// Bits per second available to the stream.
    bandwidth: f64,
    /// One-way delay in seconds.
    owd: f64,
    /// Bits assigned.
    volume: f64,
}

fn initial_path_if_allowed(paths: &PathSet) -> Option<PathId> {
    paths
        .get(INITIAL_PATH_ID)
        .filter(|p| p.sending_allowed())
        .map(Path::id)
}

// Paths that may take a new stream when there is a choice.
fn usable_paths(paths: &PathSet) -> impl Iterator<Item = &Path> {
    paths
        .iter()
        .filter(|p| p.sending_allowed() && !p.potentially_failed() && p.id() != INITIAL_PATH_ID)
}

// Sum of the weights of the data streams already on `path`.
fn weight_on_path(path: &Path, streams: &StreamsMap) -> f64 {
    path.stream_ids()
        .iter()
        .filter(|&&id| !is_control_stream(id))
        .filter_map(|&id| streams.get(id))
        .map(|s| f64::from(s.weight()))
        .sum()
}

// Seconds until `size` bytes arrive using the stream's weighted share of
// `bandwidth` (bits per second).
fn completion_time(size: ByteCount, weight: f64, others: f64, bandwidth: u64, srtt: Duration) -> f64 {
    let share = weight / (weight + others) * bandwidth as f64 / MEGABIT;
    if share.is_nan() || share <= 0.0 {
        return f64::INFINITY;
    }
    size as f64 * 8.0 / (share * MEGABIT) + srtt.as_secs_f64() / 2.0
}

fn queue_ack(s: &Session, path_id: PathId, has_stream_retransmission: bool) {
    let Ok((ack, stop_waiting)) = s.with_path_mut(path_id, |p| {
        let ack = p.ack_frame();
        let stop_waiting = if ack.is_some() || has_stream_retransmission {
            p.stop_waiting_frame(has_stream_retransmission)
        } else {
            None
        };
        (ack, stop_waiting)
    }) else {
        return;
    };
    let mut packer = s.packer().lock();
    if let Some(ack) = ack {
        packer.queue_control_frame(Frame::Ack(ack), Some(path_id));
    }
    if let Some(frame) = stop_waiting {
        packer.queue_control_frame(Frame::StopWaiting(frame), Some(path_id));
    }
}
