//! Discrete-time simulation of a multipath connection.
//!
//! Each synthetic path is a link with a fixed bandwidth, a base RTT with
//! normally distributed jitter, a congestion window in packets and a random
//! loss rate. The driver advances a virtual clock in fixed ticks, delivers
//! due acknowledgements, then lets the scheduler send.

use std::collections::{HashMap, VecDeque};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use mpquic_core::{PacketNumber, PathId, Perspective, Priority, StreamId, ROOT_STREAM_ID};
use mpquic_sched::frame::{AckFrame, Frame, PackedPacket, RetransmittablePacket, StopWaitingFrame};
use mpquic_sched::{
    Config, Error, PacketSender, Path, PathController, PathPolicy, PathScheduler, Session, Stream,
    WindowFlowController,
};
use parking_lot::Mutex;
use rand::prelude::*;
use rand_distr::{Distribution, Normal};
use serde::Serialize;
use tracing::{debug, info, warn};

const STREAM_WINDOW: u64 = 16 << 20;
const CONNECTION_WINDOW: u64 = 64 << 20;
const MIN_RTT_S: f64 = 0.0005;

/// One synthetic path, written `rtt_ms:mbps:cwnd[:loss]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PathSpec {
    pub rtt: Duration,
    pub bandwidth_bps: u64,
    /// Congestion window in packets.
    pub cwnd: u64,
    /// Probability that a packet is lost.
    pub loss: f64,
}

impl FromStr for PathSpec {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = input.split(':').collect();
        if !(3..=4).contains(&parts.len()) {
            return Err(format!("expected rtt_ms:mbps:cwnd[:loss], got {input}"));
        }
        let rtt_ms: f64 = parts[0]
            .parse()
            .map_err(|_| format!("invalid RTT in {input}"))?;
        let mbps: f64 = parts[1]
            .parse()
            .map_err(|_| format!("invalid bandwidth in {input}"))?;
        let cwnd: u64 = parts[2]
            .parse()
            .map_err(|_| format!("invalid congestion window in {input}"))?;
        let loss: f64 = match parts.get(3) {
            Some(p) => p.parse().map_err(|_| format!("invalid loss rate in {input}"))?,
            None => 0.0,
        };
        if rtt_ms < 0.0 || mbps <= 0.0 || cwnd == 0 || !(0.0..1.0).contains(&loss) {
            return Err(format!("out of range values in {input}"));
        }
        Ok(Self {
            rtt: Duration::from_secs_f64(rtt_ms / 1000.0),
            bandwidth_bps: (mbps * 1_000_000.0) as u64,
            cwnd,
            loss,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Scenario {
    pub perspective: Perspective,
    pub policy: PathPolicy,
    /// The first path is the initial path.
    pub paths: Vec<PathSpec>,
    pub jitter: Duration,
    pub streams: usize,
    pub stream_bytes: usize,
    /// Stream weights, reused round-robin.
    pub weights: Vec<u8>,
    pub tick: Duration,
    pub max_time: Duration,
    pub advisor: Option<String>,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            perspective: Perspective::Server,
            policy: PathPolicy::SinglePath,
            paths: Vec::new(),
            jitter: Duration::ZERO,
            streams: 4,
            stream_bytes: 256 * 1024,
            weights: vec![mpquic_core::DEFAULT_STREAM_WEIGHT],
            tick: Duration::from_millis(1),
            max_time: Duration::from_secs(60),
            advisor: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamReport {
    pub id: StreamId,
    pub weight: u8,
    pub bytes: usize,
    pub paths: Vec<PathId>,
    /// Arrival of the last byte, in seconds.
    pub finish_s: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PathReport {
    pub id: PathId,
    pub rtt_ms: f64,
    pub mbps: f64,
    pub packets: u64,
    pub retransmitted: u64,
    pub lost: u64,
    pub streams: u64,
    pub smoothed_rtt_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run: usize,
    pub seed: u64,
    pub policy: String,
    pub perspective: String,
    /// Time until every stream arrived, `None` if the run timed out.
    pub completion_s: Option<f64>,
    pub streams: Vec<StreamReport>,
    pub paths: Vec<PathReport>,
}

struct InFlight {
    number: PacketNumber,
    due: f64,
    lost: bool,
    rtt_sample: f64,
    streams: Vec<StreamId>,
    packet: RetransmittablePacket,
}

struct Link {
    id: PathId,
    spec: PathSpec,
    jitter: Option<Normal<f64>>,
    rng: StdRng,
    now: f64,
    link_free_at: f64,
    srtt: Option<f64>,
    in_flight: Vec<InFlight>,
    retransmissions: VecDeque<RetransmittablePacket>,
    largest_sent: PacketNumber,
    sent: u64,
    retransmitted: u64,
    lost: u64,
    arrivals: Vec<(StreamId, f64)>,
}

impl Link {
    fn new(id: PathId, spec: PathSpec, jitter: Option<Normal<f64>>, seed: u64) -> Self {
        Self {
            id,
            spec,
            jitter,
            rng: StdRng::seed_from_u64(seed),
            now: 0.0,
            link_free_at: 0.0,
            srtt: None,
            in_flight: Vec::new(),
            retransmissions: VecDeque::new(),
            largest_sent: 0,
            sent: 0,
            retransmitted: 0,
            lost: 0,
            arrivals: Vec::new(),
        }
    }

    // Deliver acknowledgements and loss signals due by `now`.
    fn advance(&mut self, now: f64) {
        self.now = now;
        let (due, pending): (Vec<InFlight>, Vec<InFlight>) =
            std::mem::take(&mut self.in_flight).into_iter().partition(|p| p.due <= now);
        self.in_flight = pending;
        for packet in due {
            if packet.lost {
                self.lost += 1;
                debug!(path_id = self.id, number = packet.number, "packet lost");
                self.retransmissions.push_back(packet.packet);
                continue;
            }
            self.srtt = Some(match self.srtt {
                None => packet.rtt_sample,
                Some(srtt) => 0.875 * srtt + 0.125 * packet.rtt_sample,
            });
            let arrival = packet.due - packet.rtt_sample / 2.0;
            self.arrivals
                .extend(packet.streams.iter().map(|&id| (id, arrival)));
        }
    }

    fn idle(&self) -> bool {
        self.in_flight.is_empty() && self.retransmissions.is_empty()
    }

    fn rtt_sample(&mut self) -> f64 {
        let base = self.spec.rtt.as_secs_f64();
        let jitter = match &self.jitter {
            Some(normal) => normal.sample(&mut self.rng),
            None => 0.0,
        };
        (base + jitter).max(MIN_RTT_S)
    }
}

/// [`PathController`] backed by a simulated link.
struct SimController(Arc<Mutex<Link>>);

impl PathController for SimController {
    fn sending_allowed(&self) -> bool {
        let link = self.0.lock();
        (link.in_flight.len() as u64) < link.spec.cwnd && link.link_free_at <= link.now
    }

    fn dequeue_packet_for_retransmission(&mut self) -> Option<RetransmittablePacket> {
        let mut link = self.0.lock();
        let packet = link.retransmissions.pop_front()?;
        link.retransmitted += 1;
        Some(packet)
    }

    fn least_unacked(&self) -> PacketNumber {
        let link = self.0.lock();
        link.in_flight
            .iter()
            .map(|p| p.number)
            .min()
            .unwrap_or(link.largest_sent + 1)
    }

    fn statistics(&self) -> (u64, u64, u64) {
        let link = self.0.lock();
        (link.sent, link.retransmitted, link.lost)
    }

    fn smoothed_rtt(&self) -> Duration {
        Duration::from_secs_f64(self.0.lock().srtt.unwrap_or(0.0))
    }

    fn bandwidth(&self) -> u64 {
        self.0.lock().spec.bandwidth_bps
    }

    fn should_send_retransmittable(&mut self) -> bool {
        false
    }

    fn stop_waiting_frame(&mut self, force: bool) -> Option<StopWaitingFrame> {
        if !force {
            return None;
        }
        let least_unacked = self.least_unacked();
        Some(StopWaitingFrame {
            path_id: self.0.lock().id,
            least_unacked,
        })
    }

    fn ack_frame(&mut self) -> Option<AckFrame> {
        None
    }

    fn on_packet_sent(&mut self, packet: &PackedPacket) {
        let mut link = self.0.lock();
        link.sent += 1;
        link.largest_sent = link.largest_sent.max(packet.number);
        if !packet.is_retransmittable() {
            return;
        }
        let serialization = packet.length as f64 * 8.0 / link.spec.bandwidth_bps as f64;
        link.link_free_at = link.link_free_at.max(link.now) + serialization;
        let rtt_sample = link.rtt_sample();
        let loss = link.spec.loss;
        let lost = loss > 0.0 && link.rng.gen_bool(loss);
        let streams = packet
            .frames
            .iter()
            .filter_map(|f| match f {
                Frame::Stream(sf) if sf.data_len() > 0 || sf.fin => Some(sf.stream_id),
                _ => None,
            })
            .collect();
        let due = link.link_free_at + rtt_sample;
        link.in_flight.push(InFlight {
            number: packet.number,
            due,
            lost,
            rtt_sample,
            streams,
            packet: RetransmittablePacket {
                number: packet.number,
                encryption_level: packet.encryption_level,
                frames: packet.frames.clone(),
            },
        });
    }
}

// Packets already reached the link through the controller.
struct Wire;

impl PacketSender for Wire {
    fn send(&self, _path: PathId, _packet: &PackedPacket) -> Result<(), Error> {
        Ok(())
    }
}

/// Run `scenario` once with `seed`.
pub async fn simulate(scenario: &Scenario, run: usize, seed: u64) -> Result<RunReport, Error> {
    if scenario.paths.is_empty() {
        return Err(Error::Config("at least one path is required".into()));
    }
    let jitter = if scenario.jitter.is_zero() {
        None
    } else {
        Some(
            Normal::new(0.0, scenario.jitter.as_secs_f64())
                .map_err(|err| Error::Config(err.to_string()))?,
        )
    };

    let mut config = Config::default().with_policy(scenario.policy).with_seed(seed);
    if let Some(advisor) = &scenario.advisor {
        config = config.with_advisor(advisor)?;
    }
    let flow = Arc::new(WindowFlowController::new(STREAM_WINDOW, CONNECTION_WINDOW));
    let session = Session::new(scenario.perspective, config, flow, Box::new(Wire))?;
    session.set_handshake_complete();

    let mut links = Vec::with_capacity(scenario.paths.len());
    for (i, spec) in scenario.paths.iter().enumerate() {
        let id = i as PathId;
        let link = Arc::new(Mutex::new(Link::new(
            id,
            *spec,
            jitter,
            seed.wrapping_add(u64::from(id) + 1),
        )));
        session.add_path(Path::new(id, Box::new(SimController(Arc::clone(&link)))));
        links.push(link);
    }

    if scenario.perspective == Perspective::Client {
        // Data streams must not land on the header stream.
        session.open_stream(Priority::default())?;
    }
    let streams = open_streams(&session, scenario)?;
    let mut scheduler = PathScheduler::new(session.config())?;

    let tick = scenario.tick.as_secs_f64();
    let max_time = scenario.max_time.as_secs_f64();
    let mut arrivals: HashMap<StreamId, f64> = HashMap::new();
    let mut now = 0.0;
    let completed = loop {
        let mut idle = true;
        for link in &links {
            let mut link = link.lock();
            link.advance(now);
            idle &= link.idle();
            for (id, at) in link.arrivals.drain(..) {
                let last = arrivals.entry(id).or_insert(at);
                *last = last.max(at);
            }
        }
        if idle && streams.iter().all(|s| s.finished_write_and_sent_fin()) {
            break true;
        }
        if now > max_time {
            warn!(run, seed, now, "simulation timed out");
            break false;
        }
        scheduler.send_packets(&session).await?;
        now += tick;
    };

    let stream_reports: Vec<StreamReport> = streams
        .iter()
        .map(|s| StreamReport {
            id: s.id(),
            weight: s.weight(),
            bytes: scenario.stream_bytes,
            paths: session.paths_of_stream(s.id()).unwrap_or_default(),
            finish_s: arrivals.get(&s.id()).copied(),
        })
        .collect();
    let completion_s = if completed {
        stream_reports.iter().filter_map(|s| s.finish_s).reduce(f64::max)
    } else {
        None
    };
    let path_reports = links
        .iter()
        .map(|link| {
            let link = link.lock();
            PathReport {
                id: link.id,
                rtt_ms: link.spec.rtt.as_secs_f64() * 1000.0,
                mbps: link.spec.bandwidth_bps as f64 / 1_000_000.0,
                packets: link.sent,
                retransmitted: link.retransmitted,
                lost: link.lost,
                streams: scheduler.num_streams(link.id),
                smoothed_rtt_ms: link.srtt.unwrap_or(0.0) * 1000.0,
            }
        })
        .collect();

    info!(run, seed, completion_s = ?completion_s, "simulation finished");
    Ok(RunReport {
        run,
        seed,
        policy: format!("{:?}", scenario.policy),
        perspective: scenario.perspective.to_string(),
        completion_s,
        streams: stream_reports,
        paths: path_reports,
    })
}

fn open_streams(session: &Session, scenario: &Scenario) -> Result<Vec<Arc<Stream>>, Error> {
    let payload = vec![0x5a; scenario.stream_bytes];
    let mut streams = Vec::with_capacity(scenario.streams);
    for i in 0..scenario.streams {
        let weight = if scenario.weights.is_empty() {
            mpquic_core::DEFAULT_STREAM_WEIGHT
        } else {
            scenario.weights[i % scenario.weights.len()]
        };
        let stream = session.open_stream(Priority::new(weight, ROOT_STREAM_ID, false))?;
        stream.set_request_path(format!("/object/{i}"));
        stream.write(&payload)?;
        stream.close();
        streams.push(stream);
    }
    Ok(streams)
}
