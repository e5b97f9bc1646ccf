//! Configuration for the scheduling subsystem of one connection.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use mpquic_core::{
    parse_host_port, AddressKind, ByteCount, HostPort, DEFAULT_ADVISOR_PORT, MAX_PACKET_SIZE,
    MAX_STREAMS_PER_CONNECTION,
};

/// How streams are spread over paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PathPolicy {
    /// Every data stream lives on exactly one path.
    #[default]
    SinglePath,
    /// Data streams may be split across paths by byte volume.
    MultiPath,
}

impl FromStr for PathPolicy {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SinglePath" | "single-path" | "single" => Ok(PathPolicy::SinglePath),
            "MultiPath" | "multi-path" | "multi" => Ok(PathPolicy::MultiPath),
            other => Err(crate::Error::Config(format!(
                "unknown path scheduler {other:?}"
            ))),
        }
    }
}

impl fmt::Display for PathPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathPolicy::SinglePath => write!(f, "SinglePath"),
            PathPolicy::MultiPath => write!(f, "MultiPath"),
        }
    }
}

/// Configuration for the scheduler, framer and streams map.
#[derive(Debug, Clone)]
pub struct Config {
    /// Stream-to-path policy.
    pub policy: PathPolicy,

    /// Where the path advisor listens. Without one the multipath policy
    /// balances volume locally.
    pub advisor_endpoint: Option<HostPort>,

    /// Upper bound for one advisor round trip.
    pub advisor_timeout: Duration,

    /// Delay between connection attempts to the advisor.
    pub advisor_poll_interval: Duration,

    /// Streams the peer may have open at once.
    pub max_incoming_streams: u32,

    /// Streams this side may have open at once.
    pub max_outgoing_streams: u32,

    /// Largest packet assembled.
    pub max_packet_size: ByteCount,

    /// Paths that must exist (initial path included) before data streams
    /// are placed by the server-side heuristics.
    pub min_paths_for_distribution: usize,

    /// Seed for the proportional stream picker.
    pub rng_seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            policy: PathPolicy::SinglePath,
            advisor_endpoint: None,
            advisor_timeout: Duration::from_millis(2500),
            advisor_poll_interval: Duration::from_millis(10),
            max_incoming_streams: MAX_STREAMS_PER_CONNECTION,
            max_outgoing_streams: MAX_STREAMS_PER_CONNECTION,
            max_packet_size: MAX_PACKET_SIZE,
            min_paths_for_distribution: 3,
            rng_seed: None,
        }
    }
}

impl Config {
    /// Create a new config with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the path policy.
    pub fn with_policy(mut self, policy: PathPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the advisor endpoint from a `host[:port]` string.
    pub fn with_advisor(mut self, endpoint: &str) -> Result<Self, crate::Error> {
        let hp = parse_host_port(endpoint, DEFAULT_ADVISOR_PORT, AddressKind::Advisor)
            .map_err(|e| crate::Error::Config(e.to_string()))?;
        self.advisor_endpoint = Some(hp);
        Ok(self)
    }

    /// Set the advisor timeout.
    pub fn with_advisor_timeout(mut self, timeout: Duration) -> Self {
        self.advisor_timeout = timeout;
        self
    }

    /// Set both stream limits.
    pub fn with_max_streams(mut self, incoming: u32, outgoing: u32) -> Self {
        self.max_incoming_streams = incoming;
        self.max_outgoing_streams = outgoing;
        self
    }

    /// Set the packet size.
    pub fn with_max_packet_size(mut self, size: ByteCount) -> Self {
        self.max_packet_size = size;
        self
    }

    /// Seed the proportional stream picker.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_from_str() {
        assert_eq!("SinglePath".parse::<PathPolicy>().unwrap(), PathPolicy::SinglePath);
        assert_eq!("MultiPath".parse::<PathPolicy>().unwrap(), PathPolicy::MultiPath);
        assert_eq!("multi".parse::<PathPolicy>().unwrap(), PathPolicy::MultiPath);
        assert!("roundrobin".parse::<PathPolicy>().is_err());
    }

    #[test]
    fn builder() {
        let config = Config::new()
            .with_policy(PathPolicy::MultiPath)
            .with_advisor("127.0.0.1")
            .unwrap()
            .with_max_streams(4, 8);
        assert_eq!(config.policy, PathPolicy::MultiPath);
        let advisor = config.advisor_endpoint.unwrap();
        assert_eq!(advisor.port, DEFAULT_ADVISOR_PORT);
        assert_eq!(config.max_incoming_streams, 4);
        assert_eq!(config.max_outgoing_streams, 8);
        assert_eq!(config.advisor_timeout, Duration::from_millis(2500));
    }

    #[test]
    fn bad_advisor_endpoint() {
        assert!(Config::new().with_advisor("host:nope").is_err());
    }
}
