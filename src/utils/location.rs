//! Server listener location (host:port) value type.

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::utils::MetaError;

use get_size::GetSize;
use serde::{Deserialize, Serialize};

/// A host:port pair naming one listener endpoint of a node.
#[derive(
    Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Hash, Serialize,
    Deserialize, GetSize,
)]
pub struct ServerLocation {
    /// Hostname or dotted-quad address.
    pub host: String,

    /// TCP port.
    pub port: u16,
}

impl ServerLocation {
    /// Creates a location from parts.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ServerLocation {
            host: host.into(),
            port,
        }
    }

    /// A location is valid if it has a non-empty host and a non-zero port.
    pub fn is_valid(&self) -> bool {
        !self.host.is_empty() && self.port != 0
    }

    /// Resolves into a socket address for connecting; only literal IPv4/IPv6
    /// hosts parse here, name resolution is left to the connector.
    pub fn to_socket_addr(&self) -> Result<SocketAddr, MetaError> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}

impl FromStr for ServerLocation {
    type Err = MetaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // rsplit so that IPv6-ish hosts with colons keep their head intact
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| MetaError(format!("invalid location '{}'", s)))?;
        let loc = ServerLocation {
            host: host.into(),
            port: port.parse()?,
        };
        if !loc.is_valid() {
            return Err(MetaError(format!("invalid location '{}'", s)));
        }
        Ok(loc)
    }
}

impl fmt::Display for ServerLocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod location_tests {
    use super::*;

    #[test]
    fn parse_roundtrip() -> Result<(), MetaError> {
        let loc: ServerLocation = "10.0.0.7:20000".parse()?;
        assert_eq!(loc, ServerLocation::new("10.0.0.7", 20000));
        assert_eq!(loc.to_string().parse::<ServerLocation>()?, loc);
        Ok(())
    }

    #[test]
    fn parse_invalid() {
        assert!("noport".parse::<ServerLocation>().is_err());
        assert!(":1234".parse::<ServerLocation>().is_err());
        assert!("host:0".parse::<ServerLocation>().is_err());
        assert!("host:notanum".parse::<ServerLocation>().is_err());
    }
}
