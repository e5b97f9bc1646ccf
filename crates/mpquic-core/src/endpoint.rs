use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, ToSocketAddrs};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    V4,
    V6,
}

/// A host name or literal address with a port, as given on a command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
    pub family: AddressFamily,
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.family {
            AddressFamily::V4 => write!(f, "{}:{}", self.host, self.port),
            AddressFamily::V6 => write!(f, "[{}]:{}", self.host, self.port),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConfigError {
    message: String,
}

impl ConfigError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for ConfigError {}

/// What an address is used for; only affects error messages.
#[derive(Debug, Clone, Copy)]
pub enum AddressKind {
    Advisor,
    Listen,
}

impl AddressKind {
    fn label(self) -> &'static str {
        match self {
            AddressKind::Advisor => "advisor",
            AddressKind::Listen => "listen",
        }
    }
}

/// Parses `host`, `host:port`, `[v6]` or `[v6]:port`.
pub fn parse_host_port(
    input: &str,
    default_port: u16,
    kind: AddressKind,
) -> Result<HostPort, ConfigError> {
    let input = input.trim();
    if let Some(rest) = input.strip_prefix('[') {
        let Some(end) = rest.find(']') else {
            return Err(ConfigError::new(format!(
                "Invalid IPv6 {} address (missing closing bracket): {}",
                kind.label(),
                input
            )));
        };
        let host = &rest[..end];
        if host.is_empty() {
            return Err(invalid_address(kind, input));
        }
        let port = match &rest[end + 1..] {
            "" => default_port,
            tail => match tail.strip_prefix(':') {
                Some(port) => parse_port(port, input, kind)?,
                None => return Err(invalid_address(kind, input)),
            },
        };
        return Ok(HostPort {
            host: host.to_string(),
            port,
            family: AddressFamily::V6,
        });
    }

    let (host, port) = match input.split_once(':') {
        Some((host, port)) => (host, parse_port(port, input, kind)?),
        None => (input, default_port),
    };
    if host.is_empty() {
        return Err(invalid_address(kind, input));
    }
    Ok(HostPort {
        host: host.to_string(),
        port,
        family: AddressFamily::V4,
    })
}

/// Resolves to the first socket address of the requested family.
pub fn resolve_host_port(address: &HostPort) -> Result<SocketAddr, ConfigError> {
    match address.family {
        AddressFamily::V4 => {
            if let Ok(ip) = address.host.parse::<Ipv4Addr>() {
                return Ok(SocketAddr::V4(SocketAddrV4::new(ip, address.port)));
            }
        }
        AddressFamily::V6 => {
            if let Ok(ip) = address.host.parse::<Ipv6Addr>() {
                return Ok(SocketAddr::V6(SocketAddrV6::new(ip, address.port, 0, 0)));
            }
        }
    }

    let mut addrs = address
        .to_string()
        .to_socket_addrs()
        .map_err(|_| ConfigError::new(format!("Cannot resolve {}", address.host)))?;
    addrs
        .find(|addr| match address.family {
            AddressFamily::V4 => addr.is_ipv4(),
            AddressFamily::V6 => addr.is_ipv6(),
        })
        .ok_or_else(|| ConfigError::new(format!("No usable address found for {}", address.host)))
}

fn parse_port(port: &str, input: &str, kind: AddressKind) -> Result<u16, ConfigError> {
    if port.is_empty() || !port.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid_port(kind, input));
    }
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(invalid_port(kind, input)),
        Ok(port) => Ok(port),
    }
}

fn invalid_port(kind: AddressKind, input: &str) -> ConfigError {
    ConfigError::new(format!(
        "Invalid port number in {} address: {}",
        kind.label(),
        input
    ))
}

fn invalid_address(kind: AddressKind, input: &str) -> ConfigError {
    ConfigError::new(format!("Invalid {} address: {}", kind.label(), input))
}
