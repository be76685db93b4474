//! Endpoint addresses (`tcp://host:port`)

use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

/// Whether a socket listens on its endpoint or dials it
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Mode {
    Connect,
    Bind,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Mode::Connect => "connect",
            Mode::Bind => "bind",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    #[error("endpoint `{0}` has no scheme, expected tcp://host:port")]
    MissingScheme(String),

    #[error("unsupported transport `{0}`, only tcp is available")]
    UnsupportedScheme(String),

    #[error("endpoint `{0}` has no host")]
    MissingHost(String),

    #[error("endpoint `{0}` has no port")]
    MissingPort(String),

    #[error("invalid port in endpoint `{0}`")]
    InvalidPort(String),

    #[error("cannot resolve `{endpoint}`: {reason}")]
    Resolve { endpoint: String, reason: String },
}

/// Parsed `tcp://host:port` address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `*` binds every interface.
    pub fn is_wildcard(&self) -> bool {
        self.host == "*"
    }

    /// Socket addresses to try, in resolver order.
    pub fn resolve(&self) -> Result<Vec<SocketAddr>, EndpointError> {
        let host = if self.is_wildcard() { "0.0.0.0" } else { self.host.as_str() };

        let addrs: Vec<SocketAddr> = (host, self.port)
            .to_socket_addrs()
            .map_err(|e: io::Error| EndpointError::Resolve {
                endpoint: self.to_string(),
                reason: e.to_string(),
            })?
            .collect();

        if addrs.is_empty() {
            return Err(EndpointError::Resolve {
                endpoint: self.to_string(),
                reason: "no addresses".to_string(),
            });
        }
        Ok(addrs)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((scheme, rest)) = s.split_once("://") else {
            return Err(EndpointError::MissingScheme(s.to_string()));
        };
        if scheme != "tcp" {
            return Err(EndpointError::UnsupportedScheme(scheme.to_string()));
        }

        let Some((host, port)) = rest.rsplit_once(':') else {
            return Err(EndpointError::MissingPort(s.to_string()));
        };
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);

        if host.is_empty() {
            return Err(EndpointError::MissingHost(s.to_string()));
        }
        if port.is_empty() {
            return Err(EndpointError::MissingPort(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| EndpointError::InvalidPort(s.to_string()))?;

        Ok(Self::new(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "tcp://[{}]:{}", self.host, self.port)
        } else {
            write!(f, "tcp://{}:{}", self.host, self.port)
        }
    }
}
