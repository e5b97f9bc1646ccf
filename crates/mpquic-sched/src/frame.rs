//! Frames and packets as the scheduler sees them.
//!
//! Wire encoding lives elsewhere; these types only carry what the scheduler
//! needs, plus a length estimate that matches the encoded size closely
//! enough to fill packets.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use mpquic_core::{ByteCount, EncryptionLevel, PacketNumber, PathId, StreamId};

/// Data of one stream.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamFrame {
    pub stream_id: StreamId,
    pub offset: ByteCount,
    pub data: Bytes,
    pub fin: bool,
    pub data_len_present: bool,
}

impl StreamFrame {
    /// Header length: type byte, stream id, offset and optional data length.
    pub fn min_length(&self) -> ByteCount {
        let len_field = if self.data_len_present { 2 } else { 0 };
        1 + stream_id_len(self.stream_id) + offset_len(self.offset) + len_field
    }

    pub fn data_len(&self) -> ByteCount {
        self.data.len() as ByteCount
    }

    pub fn len(&self) -> ByteCount {
        self.min_length() + self.data_len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && !self.fin
    }
}

fn stream_id_len(id: StreamId) -> ByteCount {
    match id {
        0..=0xff => 1,
        0x100..=0xffff => 2,
        0x1_0000..=0xff_ffff => 3,
        _ => 4,
    }
}

fn offset_len(offset: ByteCount) -> ByteCount {
    match offset {
        0 => 0,
        1..=0xffff => 2,
        0x1_0000..=0xff_ffff => 3,
        0x100_0000..=0xffff_ffff => 4,
        0x1_0000_0000..=0xff_ffff_ffff => 5,
        0x100_0000_0000..=0xffff_ffff_ffff => 6,
        0x1_0000_0000_0000..=0xff_ffff_ffff_ffff => 7,
        _ => 8,
    }
}

/// Split the first `n` data bytes off `frame` into a new frame. `frame`
/// keeps the remainder (and its FIN) with its offset moved forward.
/// Returns `None` when the whole frame fits in `n`.
pub fn maybe_split_off_frame(frame: &mut StreamFrame, n: ByteCount) -> Option<StreamFrame> {
    if n >= frame.data_len() {
        return None;
    }
    let head = frame.data.split_to(n as usize);
    let split = StreamFrame {
        stream_id: frame.stream_id,
        offset: frame.offset,
        data: head,
        fin: false,
        data_len_present: frame.data_len_present,
    };
    frame.offset += n;
    Some(split)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckFrame {
    pub path_id: PathId,
    pub largest_acked: PacketNumber,
    pub lowest_acked: PacketNumber,
    pub delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopWaitingFrame {
    pub path_id: PathId,
    pub least_unacked: PacketNumber,
}

/// Raises a flow control limit. Stream 0 means the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowUpdateFrame {
    pub stream_id: StreamId,
    pub byte_offset: ByteCount,
}

/// Sender is flow control blocked. Stream 0 means the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockedFrame {
    pub stream_id: StreamId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddAddressFrame {
    pub addr: SocketAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClosePathFrame {
    pub path_id: PathId,
    pub largest_acked: PacketNumber,
}

/// Advertises the paths of the connection and their RTTs. Clients also
/// list their local addresses so the server can open matching paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathsFrame {
    pub max_num_paths: u8,
    pub path_ids: Vec<PathId>,
    pub remote_rtts: Vec<Duration>,
    pub addrs: Vec<SocketAddr>,
}

impl PathsFrame {
    pub fn min_length(&self) -> ByteCount {
        let addr_bytes: usize = self
            .addrs
            .iter()
            .map(|a| if a.is_ipv4() { 6 } else { 18 })
            .sum();
        (3 + 3 * self.path_ids.len() + addr_bytes) as ByteCount
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Stream(StreamFrame),
    Ack(AckFrame),
    StopWaiting(StopWaitingFrame),
    WindowUpdate(WindowUpdateFrame),
    Blocked(BlockedFrame),
    AddAddress(AddAddressFrame),
    ClosePath(ClosePathFrame),
    Paths(PathsFrame),
    Ping,
}

impl Frame {
    /// Estimated encoded length.
    pub fn length(&self) -> ByteCount {
        match self {
            Frame::Stream(f) => f.len(),
            Frame::Ack(_) => 1 + 1 + 6 + 2 + 1 + 6,
            Frame::StopWaiting(_) => 1 + 6,
            Frame::WindowUpdate(_) => 1 + 4 + 8,
            Frame::Blocked(_) => 1 + 4,
            Frame::AddAddress(f) => {
                if f.addr.is_ipv4() {
                    1 + 1 + 4 + 2
                } else {
                    1 + 1 + 16 + 2
                }
            }
            Frame::ClosePath(_) => 1 + 1 + 6,
            Frame::Paths(f) => f.min_length(),
            Frame::Ping => 1,
        }
    }

    /// Whether loss of this frame requires sending it again.
    pub fn is_retransmittable(&self) -> bool {
        !matches!(self, Frame::Ack(_) | Frame::StopWaiting(_))
    }
}

/// A packet ready to hand to the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedPacket {
    pub path_id: PathId,
    pub number: PacketNumber,
    pub encryption_level: EncryptionLevel,
    pub frames: Vec<Frame>,
    pub length: ByteCount,
}

impl PackedPacket {
    pub fn is_retransmittable(&self) -> bool {
        self.frames.iter().any(Frame::is_retransmittable)
    }

    /// Stream frames carrying a FIN.
    pub fn fin_streams(&self) -> impl Iterator<Item = StreamId> + '_ {
        self.frames.iter().filter_map(|f| match f {
            Frame::Stream(sf) if sf.fin => Some(sf.stream_id),
            _ => None,
        })
    }
}

/// A sent packet the loss detector gave back for retransmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetransmittablePacket {
    pub number: PacketNumber,
    pub encryption_level: EncryptionLevel,
    pub frames: Vec<Frame>,
}

impl RetransmittablePacket {
    pub fn frames_for_retransmission(&self) -> impl Iterator<Item = &Frame> {
        self.frames.iter().filter(|f| f.is_retransmittable())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: StreamId, offset: ByteCount, data: &'static [u8]) -> StreamFrame {
        StreamFrame {
            stream_id: id,
            offset,
            data: Bytes::from_static(data),
            fin: true,
            data_len_present: true,
        }
    }

    #[test]
    fn header_length_grows_with_ids() {
        assert_eq!(frame(5, 0, b"").min_length(), 1 + 1 + 0 + 2);
        assert_eq!(frame(0x1234, 0x10, b"").min_length(), 1 + 2 + 2 + 2);
        assert_eq!(frame(0x12_3456, 0x1_0000_0000, b"").min_length(), 1 + 3 + 5 + 2);
        let mut f = frame(5, 0, b"abc");
        f.data_len_present = false;
        assert_eq!(f.len(), 2 + 3);
    }

    #[test]
    fn split_keeps_remainder_and_fin() {
        let mut f = frame(5, 100, b"abcdef");
        let head = maybe_split_off_frame(&mut f, 2).unwrap();
        assert_eq!(head.data.as_ref(), b"ab");
        assert_eq!(head.offset, 100);
        assert!(!head.fin);
        assert_eq!(f.data.as_ref(), b"cdef");
        assert_eq!(f.offset, 102);
        assert!(f.fin);
    }

    #[test]
    fn no_split_when_frame_fits() {
        let mut f = frame(5, 0, b"abc");
        assert!(maybe_split_off_frame(&mut f, 3).is_none());
        assert!(maybe_split_off_frame(&mut f, 10).is_none());
        assert_eq!(f.data_len(), 3);
    }

    #[test]
    fn acks_are_not_retransmitted() {
        let packet = RetransmittablePacket {
            number: 7,
            encryption_level: EncryptionLevel::ForwardSecure,
            frames: vec![
                Frame::Ack(AckFrame {
                    path_id: 1,
                    largest_acked: 3,
                    lowest_acked: 1,
                    delay: Duration::ZERO,
                }),
                Frame::StopWaiting(StopWaitingFrame {
                    path_id: 1,
                    least_unacked: 2,
                }),
                Frame::Ping,
            ],
        };
        let kept: Vec<_> = packet.frames_for_retransmission().collect();
        assert_eq!(kept, vec![&Frame::Ping]);
    }
}
