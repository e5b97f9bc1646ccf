//! Doubles shared by the unit tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mpquic_core::{PacketNumber, PathId, Perspective};
use parking_lot::Mutex;

use crate::advisor::{AdvisorRequest, PathAdvisor};
use crate::config::Config;
use crate::error::{AdvisorError, Error};
use crate::flowcontrol::{FlowController, WindowFlowController};
use crate::frame::{AckFrame, PackedPacket, RetransmittablePacket, StopWaitingFrame};
use crate::path::{Path, PathController};
use crate::session::{PacketSender, Session};
use crate::stream::Stream;
use crate::streams_map::{NewStreamFn, StreamsMap};

/// A path controller whose measurements are set by the test.
#[derive(Debug, Clone)]
pub struct ScriptedController {
    pub path_id: PathId,
    pub rtt: Duration,
    pub bandwidth: u64,
    /// Congestion window in packets.
    pub cwnd: u64,
    pub in_flight: u64,
    pub sent: u64,
    pub retransmitted: u64,
    pub lost: u64,
    pub least_unacked: PacketNumber,
    pub pending_ack: Option<AckFrame>,
    pub retransmissions: VecDeque<RetransmittablePacket>,
    pub ping: bool,
}

impl ScriptedController {
    pub fn new(rtt_ms: u64, bandwidth_bps: u64, cwnd: u64) -> Self {
        Self {
            path_id: 0,
            rtt: Duration::from_millis(rtt_ms),
            bandwidth: bandwidth_bps,
            cwnd,
            in_flight: 0,
            sent: 0,
            retransmitted: 0,
            lost: 0,
            least_unacked: 0,
            pending_ack: None,
            retransmissions: VecDeque::new(),
            ping: false,
        }
    }
}

impl PathController for ScriptedController {
    fn sending_allowed(&self) -> bool {
        self.in_flight < self.cwnd
    }

    fn dequeue_packet_for_retransmission(&mut self) -> Option<RetransmittablePacket> {
        let packet = self.retransmissions.pop_front()?;
        self.retransmitted += 1;
        Some(packet)
    }

    fn least_unacked(&self) -> PacketNumber {
        self.least_unacked
    }

    fn statistics(&self) -> (u64, u64, u64) {
        (self.sent, self.retransmitted, self.lost)
    }

    fn smoothed_rtt(&self) -> Duration {
        self.rtt
    }

    fn bandwidth(&self) -> u64 {
        self.bandwidth
    }

    fn should_send_retransmittable(&mut self) -> bool {
        std::mem::take(&mut self.ping)
    }

    fn stop_waiting_frame(&mut self, force: bool) -> Option<StopWaitingFrame> {
        force.then_some(StopWaitingFrame {
            path_id: self.path_id,
            least_unacked: self.least_unacked,
        })
    }

    fn ack_frame(&mut self) -> Option<AckFrame> {
        self.pending_ack.take()
    }

    fn on_packet_sent(&mut self, packet: &PackedPacket) {
        self.sent += 1;
        if packet.is_retransmittable() {
            self.in_flight += 1;
        }
    }
}

pub fn path(id: PathId, controller: ScriptedController) -> Path {
    Path::new(
        id,
        Box::new(ScriptedController {
            path_id: id,
            ..controller
        }),
    )
}

/// Keeps every packet handed to the socket.
#[derive(Debug, Clone, Default)]
pub struct RecordingSender {
    pub packets: Arc<Mutex<Vec<PackedPacket>>>,
}

impl RecordingSender {
    pub fn sent(&self) -> Vec<PackedPacket> {
        self.packets.lock().clone()
    }

    pub fn take(&self) -> Vec<PackedPacket> {
        std::mem::take(&mut *self.packets.lock())
    }
}

impl PacketSender for RecordingSender {
    fn send(&self, _path: PathId, packet: &PackedPacket) -> Result<(), Error> {
        self.packets.lock().push(packet.clone());
        Ok(())
    }
}

/// Advisor answering every request with the same path, or failing while
/// it has none.
#[derive(Debug, Default)]
pub struct FixedAdvisor {
    pub choice: Mutex<Option<PathId>>,
    pub requests: Mutex<Vec<AdvisorRequest>>,
}

impl FixedAdvisor {
    pub fn new(choice: Option<PathId>) -> Self {
        Self {
            choice: Mutex::new(choice),
            requests: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl PathAdvisor for FixedAdvisor {
    async fn choose_path(&self, request: &AdvisorRequest) -> Result<PathId, AdvisorError> {
        self.requests.lock().push(request.clone());
        let choice = *self.choice.lock();
        choice.ok_or(AdvisorError::NoReply(Duration::from_millis(1)))
    }
}

/// A session over the given paths with generous flow control windows.
pub fn session(
    perspective: Perspective,
    config: Config,
    paths: Vec<Path>,
) -> (Session, RecordingSender) {
    let sender = RecordingSender::default();
    let flow = Arc::new(WindowFlowController::new(1 << 20, 1 << 20));
    let session = Session::new(
        perspective,
        config.with_seed(7),
        flow,
        Box::new(sender.clone()),
    )
    .expect("session");
    for p in paths {
        session.add_path(p);
    }
    (session, sender)
}

/// A streams map registering every stream with `flow`.
pub fn streams_map(perspective: Perspective, flow: Arc<WindowFlowController>) -> Arc<StreamsMap> {
    let new_stream: NewStreamFn = Box::new(move |id, priority| {
        flow.new_stream(id, !mpquic_core::is_control_stream(id));
        Arc::new(Stream::new(id, priority))
    });
    Arc::new(StreamsMap::new(
        perspective,
        &Config::default().with_seed(1),
        new_stream,
    ))
}
