use std::net::SocketAddr;
use std::time::Instant;

use clap::ValueEnum;
use mpquic_core::PathId;
use mpquic_sched::{AdvisorRequest, AdvisorResponse, PathStats};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("invalid listen address: {0}")]
    Address(#[from] mpquic_core::ConfigError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// How the advisor picks between the two offered paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Rule {
    /// The path with the lower smoothed RTT; unprobed paths lose.
    LowestRtt,
    /// The path expected to deliver a reference object first, given its
    /// bandwidth, loss rate and one-way delay.
    CompletionTime,
}

#[derive(Debug, Clone, Copy)]
pub struct Policy {
    pub rule: Rule,
    /// Object size in bytes used by [`Rule::CompletionTime`].
    pub object_size: u64,
}

impl Policy {
    pub fn choose(&self, request: &AdvisorRequest) -> PathId {
        let (a, b) = (&request.path1, &request.path2);
        let first = match self.rule {
            Rule::LowestRtt => match (a.smoothed_rtt > 0.0, b.smoothed_rtt > 0.0) {
                (true, false) => true,
                (false, true) => false,
                _ => a.smoothed_rtt <= b.smoothed_rtt,
            },
            Rule::CompletionTime => {
                completion_time(a, self.object_size) <= completion_time(b, self.object_size)
            }
        };
        if first {
            a.path_id
        } else {
            b.path_id
        }
    }
}

// Seconds until `size` bytes arrive over `path`, infinite without a
// bandwidth estimate.
fn completion_time(path: &PathStats, size: u64) -> f64 {
    let loss_rate = if path.packets == 0 {
        0.0
    } else {
        (path.losses as f64 / path.packets as f64).min(1.0)
    };
    let goodput = path.bandwidth as f64 * (1.0 - loss_rate);
    if goodput <= 0.0 {
        return f64::INFINITY;
    }
    size as f64 * 8.0 / goodput + path.smoothed_rtt / 2.0
}

/// Answer advisor requests on `listener` until it fails.
pub async fn serve(listener: TcpListener, policy: Policy) -> Result<(), ServiceError> {
    info!(addr = %listener.local_addr()?, rule = ?policy.rule, "path advisor listening");
    loop {
        let (socket, peer) = listener.accept().await?;
        debug!(%peer, "scheduler connected");
        tokio::spawn(async move {
            if let Err(err) = handle_connection(socket, peer, policy).await {
                warn!(%peer, %err, "connection failed");
            }
        });
    }
}

async fn handle_connection(
    socket: TcpStream,
    peer: SocketAddr,
    policy: Policy,
) -> Result<(), ServiceError> {
    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let started = Instant::now();
        let request: AdvisorRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                warn!(%peer, %err, "ignoring malformed request");
                continue;
            }
        };
        let response = AdvisorResponse {
            stream_id: request.stream_id,
            path_id: policy.choose(&request),
        };
        let Ok(mut reply) = serde_json::to_string(&response) else {
            continue;
        };
        reply.push('\n');
        writer.write_all(reply.as_bytes()).await?;
        info!(
            stream_id = request.stream_id,
            request_path = %request.request_path,
            path_id = response.path_id,
            elapsed_us = started.elapsed().as_micros() as u64,
            "advised path"
        );
    }
    debug!(%peer, "scheduler disconnected");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use mpquic_sched::{PathAdvisor, TcpAdvisor};

    use super::*;

    fn stats(path_id: PathId, rtt: f64, bandwidth: u64, packets: u64, losses: u64) -> PathStats {
        PathStats {
            path_id,
            bandwidth,
            smoothed_rtt: rtt,
            packets,
            retransmissions: losses,
            losses,
        }
    }

    fn request(path1: PathStats, path2: PathStats) -> AdvisorRequest {
        AdvisorRequest {
            stream_id: 5,
            request_path: "/index.html".to_string(),
            path1,
            path2,
        }
    }

    #[test]
    fn lowest_rtt_prefers_probed_paths() {
        let policy = Policy {
            rule: Rule::LowestRtt,
            object_size: 0,
        };
        let req = request(stats(1, 0.040, 1, 0, 0), stats(2, 0.020, 1, 0, 0));
        assert_eq!(policy.choose(&req), 2);
        let req = request(stats(1, 0.0, 1, 0, 0), stats(2, 0.300, 1, 0, 0));
        assert_eq!(policy.choose(&req), 2);
        let req = request(stats(1, 0.010, 1, 0, 0), stats(2, 0.010, 1, 0, 0));
        assert_eq!(policy.choose(&req), 1);
    }

    #[test]
    fn completion_time_weighs_bandwidth_and_loss() {
        let policy = Policy {
            rule: Rule::CompletionTime,
            object_size: 1_000_000,
        };
        // 0.8 s + 50 ms against 0.4 s + 150 ms.
        let req = request(stats(1, 0.100, 10_000_000, 100, 0), stats(2, 0.300, 20_000_000, 100, 0));
        assert_eq!(policy.choose(&req), 2);
        // Half the packets lost doubles the transfer time on path 2.
        let req = request(stats(1, 0.100, 10_000_000, 100, 0), stats(2, 0.300, 20_000_000, 100, 50));
        assert_eq!(policy.choose(&req), 1);
        let req = request(stats(1, 0.100, 0, 0, 0), stats(2, 0.300, 1_000, 0, 0));
        assert_eq!(policy.choose(&req), 2);
    }

    #[tokio::test]
    async fn answers_the_scheduler_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(
            listener,
            Policy {
                rule: Rule::LowestRtt,
                object_size: 0,
            },
        ));

        let advisor = TcpAdvisor::new(addr, Duration::from_secs(2), Duration::from_millis(10));
        let req = request(stats(1, 0.030, 1, 0, 0), stats(2, 0.015, 1, 0, 0));
        assert_eq!(advisor.choose_path(&req).await.unwrap(), 2);
        let req = request(stats(3, 0.005, 1, 0, 0), stats(2, 0.015, 1, 0, 0));
        assert_eq!(advisor.choose_path(&req).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(
            listener,
            Policy {
                rule: Rule::LowestRtt,
                object_size: 0,
            },
        ));

        let socket = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = socket.into_split();
        let req = serde_json::to_string(&request(stats(1, 0.030, 1, 0, 0), stats(2, 0.015, 1, 0, 0)))
            .unwrap();
        writer
            .write_all(format!("not json\n\n{req}\n").as_bytes())
            .await
            .unwrap();
        let mut lines = BufReader::new(reader).lines();
        let reply = lines.next_line().await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(value["StreamID"], 5);
        assert_eq!(value["PathID"], 2);
    }
}
