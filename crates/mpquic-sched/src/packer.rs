//! Assembles frames into packets for one path at a time.

use std::collections::{HashMap, VecDeque};

use mpquic_core::{ByteCount, EncryptionLevel, PacketNumber, PathId, Perspective, StreamId, CRYPTO_STREAM_ID};
use tracing::trace;

use crate::error::Error;
use crate::frame::{Frame, PackedPacket, RetransmittablePacket};
use crate::framer::StreamFramer;

/// Public header plus AEAD tag, reserved in every packet.
pub const PACKET_OVERHEAD: ByteCount = 28;

pub struct PacketPacker {
    perspective: Perspective,
    max_packet_size: ByteCount,
    encryption_level: EncryptionLevel,
    framer: StreamFramer,
    control_frames: VecDeque<Frame>,
    path_control_frames: HashMap<PathId, VecDeque<Frame>>,
    packet_numbers: HashMap<PathId, PacketNumber>,
}

impl PacketPacker {
    pub fn new(perspective: Perspective, max_packet_size: ByteCount, framer: StreamFramer) -> Self {
        Self {
            perspective,
            max_packet_size,
            encryption_level: EncryptionLevel::Unencrypted,
            framer,
            control_frames: VecDeque::new(),
            path_control_frames: HashMap::new(),
            packet_numbers: HashMap::new(),
        }
    }

    pub fn perspective(&self) -> Perspective {
        self.perspective
    }

    pub fn framer(&self) -> &StreamFramer {
        &self.framer
    }

    pub fn framer_mut(&mut self) -> &mut StreamFramer {
        &mut self.framer
    }

    pub fn encryption_level(&self) -> EncryptionLevel {
        self.encryption_level
    }

    pub fn set_encryption_level(&mut self, level: EncryptionLevel) {
        self.encryption_level = level;
    }

    /// Queue a frame for the next packet on `path`, or on any path when
    /// `path` is `None`.
    pub fn queue_control_frame(&mut self, frame: Frame, path: Option<PathId>) {
        match path {
            Some(path) => self.path_control_frames.entry(path).or_default().push_back(frame),
            None => self.control_frames.push_back(frame),
        }
    }

    /// Move the framer's pending CLOSE_PATH, ADD_ADDRESS and PATHS frames
    /// onto `path`.
    pub fn drain_framer_control_frames(&mut self, path: PathId) {
        let queue = self.path_control_frames.entry(path).or_default();
        while let Some(frame) = self.framer.pop_close_path_frame() {
            queue.push_back(Frame::ClosePath(frame));
        }
        while let Some(frame) = self.framer.pop_add_address_frame() {
            queue.push_back(Frame::AddAddress(frame));
        }
        if let Some(frame) = self.framer.pop_paths_frame() {
            queue.push_back(Frame::Paths(frame));
        }
    }

    /// Drop the queues of a closed path.
    pub fn forget_path(&mut self, path: PathId) {
        self.path_control_frames.remove(&path);
    }

    fn payload_budget(&self) -> ByteCount {
        self.max_packet_size.saturating_sub(PACKET_OVERHEAD)
    }

    /// A packet for `path` carrying queued control frames, BLOCKED frames,
    /// handshake data if the path carries the crypto stream, and stream
    /// data of `stream_ids`. `None` when there is nothing to send.
    pub fn pack_packet_of_path(
        &mut self,
        path: PathId,
        stream_ids: &[StreamId],
    ) -> Result<Option<PackedPacket>, Error> {
        let budget = self.payload_budget();
        let mut frames = Vec::new();
        let mut len = 0;

        if let Some(queue) = self.path_control_frames.get_mut(&path) {
            take_fitting(queue, budget, &mut frames, &mut len);
        }
        take_fitting(&mut self.control_frames, budget, &mut frames, &mut len);

        while let Some(blocked) = self.framer.pop_blocked_frame() {
            let frame = Frame::Blocked(blocked);
            if len + frame.length() > budget {
                // Goes out with the next packet on any path.
                self.control_frames.push_front(frame);
                break;
            }
            len += frame.length();
            frames.push(frame);
        }

        if stream_ids.contains(&CRYPTO_STREAM_ID) {
            if let Some(frame) = self.framer.pop_crypto_stream_frame(budget - len) {
                len += frame.len();
                frames.push(Frame::Stream(frame));
            }
        }

        for frame in self
            .framer
            .pop_stream_frames_of_path(budget - len, path, stream_ids)?
        {
            len += frame.len();
            frames.push(Frame::Stream(frame));
        }

        // A lone STOP_WAITING is dropped; the path produces a fresh one.
        if frames.iter().all(|f| matches!(f, Frame::StopWaiting(_))) {
            return Ok(None);
        }
        Ok(Some(self.seal(path, self.encryption_level, frames, len)))
    }

    /// A packet with only the ACK and STOP_WAITING frames queued on `path`.
    pub fn pack_ack_packet(&mut self, path: PathId) -> Option<PackedPacket> {
        let queue = self.path_control_frames.get_mut(&path)?;
        let mut frames = Vec::new();
        queue.retain(|frame| {
            let ack_only = matches!(frame, Frame::Ack(_) | Frame::StopWaiting(_));
            if ack_only {
                frames.push(frame.clone());
            }
            !ack_only
        });
        if frames.is_empty() {
            return None;
        }
        let len = frames.iter().map(Frame::length).sum();
        Some(self.seal(path, self.encryption_level, frames, len))
    }

    /// Resend a lost handshake packet at the encryption level it was sent at,
    /// preceded by the STOP_WAITING frame queued for the path.
    pub fn pack_handshake_retransmission(
        &mut self,
        packet: &RetransmittablePacket,
        path: PathId,
    ) -> Option<PackedPacket> {
        let mut frames = Vec::new();
        if let Some(queue) = self.path_control_frames.get_mut(&path) {
            if let Some(pos) = queue.iter().position(|f| matches!(f, Frame::StopWaiting(_))) {
                frames.extend(queue.remove(pos));
            }
        }
        frames.extend(packet.frames_for_retransmission().cloned());
        if frames.iter().all(|f| !f.is_retransmittable()) {
            return None;
        }
        let len = frames.iter().map(Frame::length).sum();
        Some(self.seal(path, packet.encryption_level, frames, len))
    }

    fn seal(
        &mut self,
        path: PathId,
        encryption_level: EncryptionLevel,
        frames: Vec<Frame>,
        payload_len: ByteCount,
    ) -> PackedPacket {
        let next = self.packet_numbers.entry(path).or_insert(1);
        let number = *next;
        *next += 1;
        trace!(path_id = path, number, frames = frames.len(), "packed packet");
        PackedPacket {
            path_id: path,
            number,
            encryption_level,
            frames,
            length: payload_len + PACKET_OVERHEAD,
        }
    }
}

// Pops frames off the front of `queue` while they fit.
fn take_fitting(
    queue: &mut VecDeque<Frame>,
    budget: ByteCount,
    frames: &mut Vec<Frame>,
    len: &mut ByteCount,
) {
    while let Some(frame) = queue.front() {
        if *len + frame.length() > budget {
            break;
        }
        *len += frame.length();
        frames.extend(queue.pop_front());
    }
}
