//! Network endpoint value type.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A network endpoint.
///
/// An empty host means "all interfaces". The consensus layer of a node lives
/// on the sibling endpoint one port above the gossip endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    /// Host name or IP. Empty binds every interface.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl Address {
    /// Build an address from already-resolved parts.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `"host:port"`, `":port"` or a bare host (port 0).
    ///
    /// A non-empty host is resolved to one IP, first result wins.
    pub fn parse(input: &str) -> Result<Self> {
        let addr = match input.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| Error::BadAddress(input.to_string()))?;
                Self::new(host, port)
            }
            None => Self::new(input, 0),
        };
        addr.resolve()
    }

    fn resolve(self) -> Result<Self> {
        if self.host.is_empty() {
            return Ok(self);
        }
        let resolved = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|_| Error::UnknownHost(self.host.clone()))?
            .next()
            .ok_or_else(|| Error::UnknownHost(self.host.clone()))?;
        Ok(Self {
            host: resolved.ip().to_string(),
            port: self.port,
        })
    }

    /// The sibling endpoint the consensus layer listens on.
    pub fn consensus_endpoint(&self) -> Self {
        Self {
            host: self.host.clone(),
            port: self.port + 1,
        }
    }

    /// Stable string identity, `"host:port"`.
    pub fn id(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Hex MD5 of [`Address::id`]. Names the per-node consensus directory.
    pub fn hash(&self) -> String {
        format!("{:x}", md5::compute(self.id()))
    }

    /// Socket address for binding or dialling. An empty host maps to
    /// `0.0.0.0`.
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        let host = if self.host.is_empty() {
            "0.0.0.0"
        } else {
            self.host.as_str()
        };
        (host, self.port)
            .to_socket_addrs()
            .map_err(|_| Error::UnknownHost(host.to_string()))?
            .next()
            .ok_or_else(|| Error::UnknownHost(host.to_string()))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
