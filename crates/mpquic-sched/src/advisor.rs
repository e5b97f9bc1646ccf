//! The external path advisor.
//!
//! The multipath scheduler asks the advisor which of two candidate paths a
//! new stream should use. [`TcpAdvisor`] talks to an advisor service over
//! TCP, one JSON object per line in each direction.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use mpquic_core::{resolve_host_port, PathId, StreamId};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::config::Config;
use crate::error::{AdvisorError, Error};
use crate::path::Path;

/// Live statistics of one candidate path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathStats {
    #[serde(rename = "PathID")]
    pub path_id: PathId,
    /// Bits per second.
    #[serde(rename = "Bandwidth")]
    pub bandwidth: u64,
    /// Seconds.
    #[serde(rename = "SmoothedRTT")]
    pub smoothed_rtt: f64,
    #[serde(rename = "Packets")]
    pub packets: u64,
    #[serde(rename = "Retransmissions")]
    pub retransmissions: u64,
    #[serde(rename = "Losses")]
    pub losses: u64,
}

impl PathStats {
    pub fn of(path: &Path) -> Self {
        let (packets, retransmissions, losses) = path.statistics();
        Self {
            path_id: path.id(),
            bandwidth: path.bandwidth(),
            smoothed_rtt: path.smoothed_rtt().as_secs_f64(),
            packets,
            retransmissions,
            losses,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvisorRequest {
    #[serde(rename = "StreamID")]
    pub stream_id: StreamId,
    /// Resource the stream fetches.
    #[serde(rename = "RequestPath")]
    pub request_path: String,
    #[serde(rename = "Path1")]
    pub path1: PathStats,
    #[serde(rename = "Path2")]
    pub path2: PathStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvisorResponse {
    #[serde(rename = "StreamID")]
    pub stream_id: StreamId,
    #[serde(rename = "PathID")]
    pub path_id: PathId,
}

/// Picks one of the two paths of a request.
#[async_trait]
pub trait PathAdvisor: Send + Sync {
    async fn choose_path(&self, request: &AdvisorRequest) -> Result<PathId, AdvisorError>;
}

/// Advisor reached over a TCP connection.
///
/// The connection is opened on first use and dropped after any failure, so
/// the next request starts from a fresh connection. Connecting is retried
/// every poll interval; the whole exchange, connecting included, is bounded
/// by the timeout.
#[derive(Debug)]
pub struct TcpAdvisor {
    addr: SocketAddr,
    timeout: Duration,
    poll_interval: Duration,
    conn: Mutex<Option<BufReader<TcpStream>>>,
}

impl TcpAdvisor {
    pub fn new(addr: SocketAddr, timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            addr,
            timeout,
            poll_interval,
            conn: Mutex::new(None),
        }
    }

    /// The advisor configured in `config`, if any.
    pub fn from_config(config: &Config) -> Result<Option<Self>, Error> {
        let Some(endpoint) = &config.advisor_endpoint else {
            return Ok(None);
        };
        let addr = resolve_host_port(endpoint).map_err(|e| Error::Config(e.to_string()))?;
        Ok(Some(Self::new(
            addr,
            config.advisor_timeout,
            config.advisor_poll_interval,
        )))
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn connect(&self) -> BufReader<TcpStream> {
        loop {
            match TcpStream::connect(self.addr).await {
                Ok(stream) => {
                    if let Err(err) = stream.set_nodelay(true) {
                        trace!(%err, "set_nodelay failed");
                    }
                    debug!(addr = %self.addr, "connected to path advisor");
                    return BufReader::new(stream);
                }
                Err(err) => {
                    trace!(addr = %self.addr, %err, "path advisor not reachable yet");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    async fn round_trip(
        &self,
        conn: &mut Option<BufReader<TcpStream>>,
        request: &AdvisorRequest,
    ) -> Result<PathId, AdvisorError> {
        if conn.is_none() {
            *conn = Some(self.connect().await);
        }
        let Some(stream) = conn.as_mut() else {
            return Err(AdvisorError::Closed);
        };

        let mut line = serde_json::to_vec(request)?;
        line.push(b'\n');
        stream.get_mut().write_all(&line).await?;

        let mut reply = String::new();
        if stream.read_line(&mut reply).await? == 0 {
            return Err(AdvisorError::Closed);
        }
        let response: AdvisorResponse = serde_json::from_str(reply.trim_end())?;
        if response.stream_id != request.stream_id {
            return Err(AdvisorError::UnexpectedStream {
                expected: request.stream_id,
                got: response.stream_id,
            });
        }
        Ok(response.path_id)
    }
}

#[async_trait]
impl PathAdvisor for TcpAdvisor {
    async fn choose_path(&self, request: &AdvisorRequest) -> Result<PathId, AdvisorError> {
        let started = Instant::now();
        let mut conn = self.conn.lock().await;
        let result = match tokio::time::timeout(self.timeout, self.round_trip(&mut conn, request)).await {
            Ok(result) => result,
            Err(_) => Err(AdvisorError::NoReply(self.timeout)),
        };
        let result = result.and_then(|path| {
            if path == request.path1.path_id || path == request.path2.path_id {
                Ok(path)
            } else {
                Err(AdvisorError::UnknownPath(path))
            }
        });
        match &result {
            Ok(path) => debug!(
                stream_id = request.stream_id,
                path_id = path,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "path advisor replied"
            ),
            Err(err) => {
                warn!(stream_id = request.stream_id, %err, "path advisor failed");
                *conn = None;
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    use super::*;

    fn stats(path_id: PathId, rtt: f64) -> PathStats {
        PathStats {
            path_id,
            bandwidth: 10_000_000,
            smoothed_rtt: rtt,
            packets: 100,
            retransmissions: 2,
            losses: 1,
        }
    }

    fn request(stream_id: StreamId) -> AdvisorRequest {
        AdvisorRequest {
            stream_id,
            request_path: "/index.html".into(),
            path1: stats(1, 0.02),
            path2: stats(2, 0.05),
        }
    }

    fn advisor(addr: SocketAddr, timeout_ms: u64) -> TcpAdvisor {
        TcpAdvisor::new(addr, Duration::from_millis(timeout_ms), Duration::from_millis(5))
    }

    // Accepts one connection and answers each request line with `reply`.
    async fn serve_once(listener: &TcpListener, reply: impl Fn(&serde_json::Value) -> Option<String>) {
        let (socket, _) = listener.accept().await.unwrap();
        let mut socket = BufReader::new(socket);
        let mut line = String::new();
        while socket.read_line(&mut line).await.unwrap() > 0 {
            let value: serde_json::Value = serde_json::from_str(&line).unwrap();
            match reply(&value) {
                Some(out) => socket.get_mut().write_all(out.as_bytes()).await.unwrap(),
                None => return,
            }
            line.clear();
        }
    }

    #[test]
    fn wire_names() {
        let json = serde_json::to_value(request(5)).unwrap();
        assert_eq!(json["StreamID"], 5);
        assert_eq!(json["RequestPath"], "/index.html");
        assert_eq!(json["Path1"]["PathID"], 1);
        assert_eq!(json["Path2"]["SmoothedRTT"], 0.05);
        assert_eq!(json["Path1"]["Bandwidth"], 10_000_000);
        assert_eq!(json["Path1"]["Retransmissions"], 2);
        assert_eq!(json["Path1"]["Losses"], 1);
        assert_eq!(json["Path1"]["Packets"], 100);

        let response: AdvisorResponse = serde_json::from_str(r#"{"StreamID":5,"PathID":2}"#).unwrap();
        assert_eq!(response, AdvisorResponse { stream_id: 5, path_id: 2 });
    }

    #[tokio::test]
    async fn asks_and_reuses_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            serve_once(&listener, |req| {
                let id = req["StreamID"].as_u64().unwrap();
                Some(format!("{{\"StreamID\":{id},\"PathID\":2}}\n"))
            })
            .await;
        });

        let advisor = advisor(addr, 1000);
        assert_eq!(advisor.choose_path(&request(5)).await.unwrap(), 2);
        assert_eq!(advisor.choose_path(&request(7)).await.unwrap(), 2);
        drop(advisor);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn silence_is_no_reply() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_millis(300)).await;
            drop(socket);
        });

        let err = advisor(addr, 50).choose_path(&request(5)).await.unwrap_err();
        assert!(matches!(err, AdvisorError::NoReply(d) if d == Duration::from_millis(50)));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn reply_for_another_stream_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            serve_once(&listener, |_| Some("{\"StreamID\":9,\"PathID\":1}\n".into())).await;
        });

        let err = advisor(addr, 1000).choose_path(&request(5)).await.unwrap_err();
        assert!(matches!(
            err,
            AdvisorError::UnexpectedStream { expected: 5, got: 9 }
        ));
    }

    #[tokio::test]
    async fn path_outside_the_request_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            serve_once(&listener, |_| Some("{\"StreamID\":5,\"PathID\":7}\n".into())).await;
        });

        let err = advisor(addr, 1000).choose_path(&request(5)).await.unwrap_err();
        assert!(matches!(err, AdvisorError::UnknownPath(7)));
    }

    #[tokio::test]
    async fn reconnects_after_the_advisor_hangs_up() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            // Read the request, then hang up without answering.
            serve_once(&listener, |_| None).await;
            serve_once(&listener, |_| Some("{\"StreamID\":5,\"PathID\":1}\n".into())).await;
        });

        let advisor = advisor(addr, 1000);
        let err = advisor.choose_path(&request(5)).await.unwrap_err();
        assert!(matches!(err, AdvisorError::Closed | AdvisorError::Io(_)));
        assert_eq!(advisor.choose_path(&request(5)).await.unwrap(), 1);
        drop(advisor);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn waits_for_the_advisor_to_come_up() {
        // Reserve a port, then release it so the first attempts fail.
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let server = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            let listener = TcpListener::bind(addr).await.unwrap();
            serve_once(&listener, |_| Some("{\"StreamID\":5,\"PathID\":2}\n".into())).await;
        });

        let advisor = advisor(addr, 2000);
        assert_eq!(advisor.choose_path(&request(5)).await.unwrap(), 2);
        drop(advisor);
        server.await.unwrap();
    }

    #[test]
    fn no_endpoint_no_advisor() {
        assert!(TcpAdvisor::from_config(&Config::default()).unwrap().is_none());
        let config = Config::default().with_advisor("127.0.0.1:6000").unwrap();
        let advisor = TcpAdvisor::from_config(&config).unwrap().unwrap();
        assert_eq!(advisor.addr(), "127.0.0.1:6000".parse().unwrap());
    }
}
