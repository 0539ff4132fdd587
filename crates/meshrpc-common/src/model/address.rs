use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::protocol::RpcError;

/// A resolvable network endpoint.
///
/// Compared by value and used as a map key by the route table, the health
/// tracker and the connection factory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AddressModel {
    pub host: String,
    pub port: u16,
}

impl AddressModel {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for AddressModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for AddressModel {
    type Err = RpcError;

    /// Parses `host:port`. The split happens on the last colon so bracketed
    /// IPv6 literals such as `[::1]:9000` keep their brackets.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| RpcError::Config(format!("Invalid address '{}': missing port", s)))?;
        if host.is_empty() {
            return Err(RpcError::Config(format!("Invalid address '{}': missing host", s)));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| RpcError::Config(format!("Invalid address '{}': {}", s, e)))?;
        Ok(Self::new(host, port))
    }
}
