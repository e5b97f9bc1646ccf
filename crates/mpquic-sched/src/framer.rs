//! Turns stream send buffers into STREAM frames.
//!
//! Lost data always goes out before fresh data. Fresh data is limited by
//! the byte budget, the stream's flow control window and the connection
//! window; exhausting either window queues a BLOCKED frame. The crypto
//! stream bypasses all of this and is handed to the packer separately.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use mpquic_core::{ByteCount, PathId, StreamId, CRYPTO_STREAM_ID};
use tracing::{debug, trace};

use crate::config::PathPolicy;
use crate::error::Error;
use crate::flowcontrol::FlowController;
use crate::frame::{
    maybe_split_off_frame, AddAddressFrame, BlockedFrame, ClosePathFrame, PathsFrame, StreamFrame,
};
use crate::stream::Stream;
use crate::streams_map::StreamsMap;

/// How the streams of one path share a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PathIteration {
    /// One stream per packet, drawn with probability proportional to weight.
    #[default]
    Proportional,
    /// Streams take turns, several per packet if they fit.
    RoundRobin,
}

pub struct StreamFramer {
    streams: Arc<StreamsMap>,
    flow: Arc<dyn FlowController>,
    policy: PathPolicy,
    iteration: PathIteration,

    retransmission_queue: Vec<StreamFrame>,
    blocked_frame_queue: VecDeque<BlockedFrame>,
    add_address_frame_queue: VecDeque<AddAddressFrame>,
    close_path_frame_queue: VecDeque<ClosePathFrame>,
    paths_frame: Option<PathsFrame>,
}

// Restricts fresh data on a path to the volume budgeted there.
#[derive(Clone, Copy)]
struct VolumeGate {
    path: PathId,
    enforce: bool,
}

impl StreamFramer {
    pub fn new(streams: Arc<StreamsMap>, flow: Arc<dyn FlowController>, policy: PathPolicy) -> Self {
        Self {
            streams,
            flow,
            policy,
            iteration: PathIteration::default(),
            retransmission_queue: Vec::new(),
            blocked_frame_queue: VecDeque::new(),
            add_address_frame_queue: VecDeque::new(),
            close_path_frame_queue: VecDeque::new(),
            paths_frame: None,
        }
    }

    pub fn with_iteration(mut self, iteration: PathIteration) -> Self {
        self.iteration = iteration;
        self
    }

    pub fn add_frame_for_retransmission(&mut self, frame: StreamFrame) {
        self.retransmission_queue.push(frame);
    }

    pub fn has_frames_for_retransmission(&self) -> bool {
        !self.retransmission_queue.is_empty()
    }

    /// Frames for the whole connection, streams visited round-robin.
    pub fn pop_stream_frames(&mut self, max_len: ByteCount) -> Result<Vec<StreamFrame>, Error> {
        let (mut frames, used) = self.pop_retransmissions(max_len, |_| true);
        let budget = max_len.saturating_sub(used);
        let streams = Arc::clone(&self.streams);
        let mut fresh = FreshFrames::new(budget);
        streams.round_robin_iterate(|s| fresh.pop(self, s, None))?;
        frames.extend(fresh.frames);
        Ok(frames)
    }

    /// Frames for the streams assigned to one path.
    pub fn pop_stream_frames_of_path(
        &mut self,
        max_len: ByteCount,
        path: PathId,
        stream_ids: &[StreamId],
    ) -> Result<Vec<StreamFrame>, Error> {
        let (mut frames, used) = self.pop_retransmissions(max_len, |id| stream_ids.contains(&id));
        let budget = max_len.saturating_sub(used);
        let gate = VolumeGate {
            path,
            enforce: self.policy == PathPolicy::MultiPath,
        };
        let streams = Arc::clone(&self.streams);
        let mut fresh = FreshFrames::new(budget);
        match self.iteration {
            PathIteration::Proportional => {
                streams.per_path_proportional(stream_ids, |s| fresh.pop(self, s, Some(gate)))?
            }
            PathIteration::RoundRobin => streams
                .per_path_round_robin(path, stream_ids, |s| fresh.pop(self, s, Some(gate)))?,
        }
        frames.extend(fresh.frames);
        Ok(frames)
    }

    /// Frames of a single stream.
    pub fn pop_stream_frames_of_one_stream(
        &mut self,
        max_len: ByteCount,
        stream_id: StreamId,
    ) -> Result<Vec<StreamFrame>, Error> {
        let (mut frames, used) = self.pop_retransmissions(max_len, |id| id == stream_id);
        let budget = max_len.saturating_sub(used);
        let mut fresh = FreshFrames::new(budget);
        if let Some(stream) = self.streams.get(stream_id) {
            fresh.pop(self, &stream, None)?;
        }
        frames.extend(fresh.frames);
        Ok(frames)
    }

    // Takes queued retransmissions accepted by `filter`, in queue order,
    // splitting the first one that does not fit.
    fn pop_retransmissions(
        &mut self,
        max_len: ByteCount,
        filter: impl Fn(StreamId) -> bool,
    ) -> (Vec<StreamFrame>, ByteCount) {
        let mut out = Vec::new();
        let mut current_len = 0;
        let mut i = 0;
        while i < self.retransmission_queue.len() {
            if !filter(self.retransmission_queue[i].stream_id) {
                i += 1;
                continue;
            }
            let frame = &mut self.retransmission_queue[i];
            frame.data_len_present = true;
            let header_len = frame.min_length();
            if current_len + header_len >= max_len {
                break;
            }
            current_len += header_len;

            if let Some(split) = maybe_split_off_frame(frame, max_len - current_len) {
                current_len += split.data_len();
                self.account_retransmission(&split);
                out.push(split);
                break;
            }
            let frame = self.retransmission_queue.remove(i);
            current_len += frame.data_len();
            self.account_retransmission(&frame);
            out.push(frame);
        }
        (out, current_len)
    }

    fn account_retransmission(&self, frame: &StreamFrame) {
        if let Err(err) = self.flow.add_bytes_retrans(frame.stream_id, frame.data_len()) {
            trace!(stream_id = frame.stream_id, %err, "retransmission for untracked stream");
        }
    }

    fn queue_blocked(&mut self, stream_id: StreamId) {
        let frame = BlockedFrame { stream_id };
        if !self.blocked_frame_queue.contains(&frame) {
            debug!(stream_id, "flow control blocked");
            self.blocked_frame_queue.push_back(frame);
        }
    }

    pub fn pop_blocked_frame(&mut self) -> Option<BlockedFrame> {
        self.blocked_frame_queue.pop_front()
    }

    pub fn add_address_for_transmission(&mut self, addr: SocketAddr) {
        self.add_address_frame_queue
            .push_back(AddAddressFrame { addr });
    }

    pub fn pop_add_address_frame(&mut self) -> Option<AddAddressFrame> {
        self.add_address_frame_queue.pop_front()
    }

    /// Replace the pending PATHS frame; only the latest view matters.
    pub fn add_paths_frame_for_transmission(&mut self, frame: PathsFrame) {
        self.paths_frame = Some(frame);
    }

    pub fn pop_paths_frame(&mut self) -> Option<PathsFrame> {
        self.paths_frame.take()
    }

    pub fn add_close_path_frame_for_transmission(&mut self, frame: ClosePathFrame) {
        self.close_path_frame_queue.push_back(frame);
    }

    pub fn pop_close_path_frame(&mut self) -> Option<ClosePathFrame> {
        self.close_path_frame_queue.pop_front()
    }

    pub fn has_crypto_stream_frame(&self) -> bool {
        self.streams
            .get(CRYPTO_STREAM_ID)
            .is_some_and(|s| s.len_of_data_for_writing() > 0)
    }

    /// Handshake data. Not subject to flow control.
    pub fn pop_crypto_stream_frame(&mut self, max_len: ByteCount) -> Option<StreamFrame> {
        let stream = self.streams.get(CRYPTO_STREAM_ID)?;
        if stream.len_of_data_for_writing() == 0 {
            return None;
        }
        let mut frame = StreamFrame {
            stream_id: CRYPTO_STREAM_ID,
            offset: stream.write_offset(),
            ..StreamFrame::default()
        };
        let header_len = frame.min_length();
        frame.data = stream.get_data_for_writing(max_len.checked_sub(header_len)?)?;
        Some(frame)
    }
}

// Accumulates fresh frames for one call within a byte budget.
struct FreshFrames {
    max_bytes: ByteCount,
    current_len: ByteCount,
    frames: Vec<StreamFrame>,
}

impl FreshFrames {
    fn new(max_bytes: ByteCount) -> Self {
        Self {
            max_bytes,
            current_len: 0,
            frames: Vec::new(),
        }
    }

    // Returns whether iteration should go on to the next stream.
    fn pop(
        &mut self,
        framer: &mut StreamFramer,
        stream: &Stream,
        gate: Option<VolumeGate>,
    ) -> Result<bool, Error> {
        let id = stream.id();
        if id == CRYPTO_STREAM_ID {
            return Ok(true);
        }

        let mut frame = StreamFrame {
            stream_id: id,
            offset: stream.write_offset(),
            data_len_present: true,
            ..StreamFrame::default()
        };
        let header_len = frame.min_length();
        if self.current_len + header_len > self.max_bytes {
            // Another stream might still fit, but that is rare enough.
            return Ok(false);
        }
        let mut max_len = self.max_bytes - self.current_len - header_len;

        let pending = stream.len_of_data_for_writing();
        let mut send_window = 0;
        if pending != 0 {
            send_window = framer.flow.send_window_size(id)?;
            max_len = max_len.min(send_window);
        }
        if max_len == 0 {
            return Ok(true);
        }

        let mut data = None;
        if pending != 0 && admitted(stream, gate, pending, max_len) {
            data = stream.get_data_for_writing(max_len);
        }
        let fin = stream.should_send_fin();
        if data.is_none() && !fin {
            return Ok(true);
        }
        if fin {
            frame.fin = true;
            stream.sent_fin();
        }
        frame.data = data.unwrap_or_default();
        let data_len = frame.data_len();
        framer.flow.add_bytes_sent(id, data_len)?;

        if data_len > 0 && framer.flow.remaining_connection_window_size() == 0 {
            framer.queue_blocked(0);
        } else if !frame.fin && pending != 0 && send_window == data_len {
            framer.queue_blocked(id);
        }

        if let Some(gate) = gate {
            stream.consume_path_volume(gate.path, data_len);
            trace!(
                stream_id = id,
                path_id = gate.path,
                volume = stream.path_volume(gate.path),
                "popped stream data on path"
            );
        }

        self.current_len += header_len + data_len;
        self.frames.push(frame);
        Ok(self.current_len != self.max_bytes)
    }
}

// Under the multipath policy a stream only sends on a path while it has
// volume budgeted there, except for its final piece of data. Control
// streams are exempt.
fn admitted(stream: &Stream, gate: Option<VolumeGate>, pending: ByteCount, max_len: ByteCount) -> bool {
    match gate {
        Some(gate) if gate.enforce && !mpquic_core::is_control_stream(stream.id()) => {
            stream.path_volume(gate.path) > 0.0 || pending < max_len
        }
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use mpquic_core::{Perspective, Priority};

    use super::*;
    use crate::flowcontrol::WindowFlowController;
    use crate::testutil::streams_map;

    struct Fixture {
        streams: Arc<StreamsMap>,
        flow: Arc<WindowFlowController>,
        framer: StreamFramer,
    }

    fn fixture(policy: PathPolicy, stream_window: ByteCount, connection_window: ByteCount) -> Fixture {
        let flow = Arc::new(WindowFlowController::new(stream_window, connection_window));
        let streams = streams_map(Perspective::Server, Arc::clone(&flow));
        let framer = StreamFramer::new(Arc::clone(&streams), flow.clone(), policy);
        Fixture {
            streams,
            flow,
            framer,
        }
    }

    fn open_with(f: &Fixture, data: &[u8]) -> Arc<Stream> {
        let s = f.streams.open_stream(Priority::default()).unwrap();
        s.write(data).unwrap();
        s
    }

    fn retrans(id: StreamId, offset: ByteCount, data: &'static [u8]) -> StreamFrame {
        StreamFrame {
            stream_id: id,
            offset,
            data: Bytes::from_static(data),
            ..StreamFrame::default()
        }
    }

    #[test]
    fn retransmissions_go_first() {
        let mut f = fixture(PathPolicy::SinglePath, 1000, 1000);
        let s = open_with(&f, b"fresh");
        f.framer.add_frame_for_retransmission(retrans(s.id(), 0, b"old"));
        let frames = f.framer.pop_stream_frames(1000).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].data.as_ref(), b"old");
        assert!(frames[0].data_len_present);
        assert_eq!(frames[1].data.as_ref(), b"fresh");
        assert!(!f.framer.has_frames_for_retransmission());
    }

    #[test]
    fn oversized_retransmission_is_split() {
        let mut f = fixture(PathPolicy::SinglePath, 1000, 1000);
        let s = open_with(&f, b"");
        f.framer
            .add_frame_for_retransmission(retrans(s.id(), 0, b"0123456789"));
        let header = retrans(s.id(), 0, b"").min_length() + 2;
        let frames = f.framer.pop_stream_frames(header + 4).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].data.as_ref(), b"0123");
        assert_eq!(frames[0].offset, 0);

        let rest = f.framer.pop_stream_frames(1000).unwrap();
        assert_eq!(rest[0].data.as_ref(), b"456789");
        assert_eq!(rest[0].offset, 4);
        assert_eq!(f.flow.bytes_retransmitted(s.id()), Some(10));
    }

    #[test]
    fn path_retransmissions_are_filtered() {
        let mut f = fixture(PathPolicy::SinglePath, 1000, 1000);
        let a = open_with(&f, b"");
        let b = open_with(&f, b"");
        f.framer.add_frame_for_retransmission(retrans(a.id(), 0, b"aa"));
        f.framer.add_frame_for_retransmission(retrans(b.id(), 0, b"bb"));
        let frames = f
            .framer
            .pop_stream_frames_of_path(1000, 2, &[b.id()])
            .unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].stream_id, b.id());
        assert!(f.framer.has_frames_for_retransmission());
    }

    #[test]
    fn fin_rides_on_last_frame() {
        let mut f = fixture(PathPolicy::SinglePath, 1000, 1000);
        let s = open_with(&f, b"bye");
        s.close();
        let frames = f.framer.pop_stream_frames(1000).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].fin);
        assert!(s.finished_write_and_sent_fin());
        assert!(f.framer.pop_stream_frames(1000).unwrap().is_empty());
    }

    #[test]
    fn frames_never_exceed_windows() {
        let mut f = fixture(PathPolicy::SinglePath, 5, 1000);
        let s = open_with(&f, b"0123456789");
        let frames = f.framer.pop_stream_frames(1000).unwrap();
        assert_eq!(frames[0].data_len(), 5);
        assert_eq!(
            f.framer.pop_blocked_frame(),
            Some(BlockedFrame { stream_id: s.id() })
        );
        assert!(f.framer.pop_stream_frames(1000).unwrap().is_empty());
    }

    #[test]
    fn one_connection_blocked_per_exhaustion() {
        let mut f = fixture(PathPolicy::SinglePath, 100, 8);
        let a = open_with(&f, b"aaaaaa");
        let b = open_with(&f, b"bbbbbb");
        let frames = f.framer.pop_stream_frames(1000).unwrap();
        let sent: ByteCount = frames.iter().map(|fr| fr.data_len()).sum();
        assert_eq!(sent, 8);
        assert_eq!(f.framer.pop_blocked_frame(), Some(BlockedFrame { stream_id: 0 }));
        assert_eq!(f.framer.pop_blocked_frame(), None);

        a.close();
        b.close();
        f.framer.pop_stream_frames(1000).unwrap();
        assert_eq!(f.framer.pop_blocked_frame(), None);
    }

    #[test]
    fn multipath_volume_limits_fresh_data() {
        let mut f = fixture(PathPolicy::MultiPath, 10_000, 10_000);
        let s = open_with(&f, &[7; 3000]);
        s.set_path_volume(1, 1000.0);
        let first = f.framer.pop_stream_frames_of_path(1200, 1, &[s.id()]).unwrap();
        assert_eq!(first.len(), 1);
        let sent = first[0].data_len();
        assert!(sent > 1000);
        assert!(s.path_volume(1) < 0.0);

        // No volume left and more than one packet of data pending.
        let second = f.framer.pop_stream_frames_of_path(1200, 1, &[s.id()]).unwrap();
        assert!(second.is_empty());

        // The last piece goes out regardless.
        let tail = f.framer.pop_stream_frames_of_path(3000, 1, &[s.id()]).unwrap();
        assert_eq!(tail[0].data_len(), 3000 - sent);
    }

    #[test]
    fn single_path_ignores_volume() {
        let mut f = fixture(PathPolicy::SinglePath, 10_000, 10_000);
        let s = open_with(&f, &[7; 3000]);
        let frames = f.framer.pop_stream_frames_of_path(1200, 1, &[s.id()]).unwrap();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn one_stream_is_served_per_path() {
        let mut f = fixture(PathPolicy::SinglePath, 1000, 1000);
        let a = open_with(&f, b"a");
        let b = open_with(&f, b"b");
        let frames = f
            .framer
            .pop_stream_frames_of_path(1000, 1, &[a.id(), b.id()])
            .unwrap();
        assert_eq!(frames.len(), 1);

        let mut f = fixture(PathPolicy::SinglePath, 1000, 1000);
        f.framer = f.framer.with_iteration(PathIteration::RoundRobin);
        let a = open_with(&f, b"a");
        let b = open_with(&f, b"b");
        let frames = f
            .framer
            .pop_stream_frames_of_path(1000, 1, &[a.id(), b.id()])
            .unwrap();
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn crypto_stream_bypasses_flow_control() {
        let mut f = fixture(PathPolicy::SinglePath, 1, 1);
        let crypto = f.streams.get_or_open(1).unwrap().unwrap();
        crypto.write(b"client hello").unwrap();
        assert!(f.framer.has_crypto_stream_frame());
        // Regular popping skips it.
        assert!(f.framer.pop_stream_frames(1000).unwrap().is_empty());
        let frame = f.framer.pop_crypto_stream_frame(1000).unwrap();
        assert_eq!(frame.data.as_ref(), b"client hello");
        assert!(!f.framer.has_crypto_stream_frame());
    }

    #[test]
    fn control_frame_queues_are_fifo() {
        let mut f = fixture(PathPolicy::SinglePath, 1000, 1000);
        let a: SocketAddr = "10.0.0.1:443".parse().unwrap();
        let b: SocketAddr = "[2001:db8::1]:443".parse().unwrap();
        f.framer.add_address_for_transmission(a);
        f.framer.add_address_for_transmission(b);
        assert_eq!(f.framer.pop_add_address_frame().unwrap().addr, a);
        assert_eq!(f.framer.pop_add_address_frame().unwrap().addr, b);
        assert!(f.framer.pop_add_address_frame().is_none());

        f.framer.add_close_path_frame_for_transmission(ClosePathFrame {
            path_id: 2,
            largest_acked: 9,
        });
        assert_eq!(f.framer.pop_close_path_frame().unwrap().path_id, 2);
        assert!(f.framer.pop_close_path_frame().is_none());

        let frame = PathsFrame {
            max_num_paths: 255,
            path_ids: vec![0, 1],
            remote_rtts: vec![Default::default(); 2],
            addrs: Vec::new(),
        };
        f.framer.add_paths_frame_for_transmission(frame.clone());
        assert_eq!(f.framer.pop_paths_frame(), Some(frame));
        assert!(f.framer.pop_paths_frame().is_none());
    }

    #[test]
    fn one_stream_pop() {
        let mut f = fixture(PathPolicy::SinglePath, 1000, 1000);
        let a = open_with(&f, b"aaa");
        let b = open_with(&f, b"bbb");
        let frames = f.framer.pop_stream_frames_of_one_stream(1000, b.id()).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].stream_id, b.id());
        assert_eq!(a.len_of_data_for_writing(), 3);
    }
}
