//! Canonical node addresses.
//!
//! Every node advertises itself with a text address of the form
//! `<class>@<host>:<port>`, e.g. `ChaskiStreamer@127.0.0.1:65432`. The class
//! names the role the node plays on the mesh. Parsing and formatting are
//! total inverses of each other; equality is field-wise (which coincides
//! with string equality of the canonical form).
//!
//! Connect calls additionally accept a leading `*`
//! (`*ChaskiStreamer@...`), which requests pairing on every shared topic as
//! part of the connection handshake. [`ConnectTarget`] carries that flag.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Role class of a node, the first component of its address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeClass {
    Node,
    Streamer,
    Remote,
    Ca,
}

impl NodeClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeClass::Node => "ChaskiNode",
            NodeClass::Streamer => "ChaskiStreamer",
            NodeClass::Remote => "ChaskiRemote",
            NodeClass::Ca => "ChaskiCA",
        }
    }
}

impl fmt::Display for NodeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeClass {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ChaskiNode" => Ok(NodeClass::Node),
            "ChaskiStreamer" => Ok(NodeClass::Streamer),
            "ChaskiRemote" => Ok(NodeClass::Remote),
            "ChaskiCA" => Ok(NodeClass::Ca),
            other => Err(AddressParseError::UnknownClass(other.to_string())),
        }
    }
}

/// Error parsing an address string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressParseError {
    #[error("unknown node class: {0}")]
    UnknownClass(String),
    #[error("missing '@' separator")]
    MissingAt,
    #[error("missing ':' port separator")]
    MissingPort,
    #[error("invalid port: {0}")]
    InvalidPort(String),
    #[error("empty host")]
    EmptyHost,
}

/// A canonical mesh address: `<class>@<host>:<port>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub class: NodeClass,
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(class: NodeClass, host: impl Into<String>, port: u16) -> Self {
        Self {
            class,
            host: host.into(),
            port,
        }
    }

    /// Socket form `<host>:<port>`, as accepted by `TcpStream::connect`.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.class, self.host, self.port)
    }
}

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (class, rest) = s.split_once('@').ok_or(AddressParseError::MissingAt)?;
        let class: NodeClass = class.parse()?;
        // rsplit keeps IPv6 hosts (which contain ':') intact.
        let (host, port) = rest.rsplit_once(':').ok_or(AddressParseError::MissingPort)?;
        if host.is_empty() {
            return Err(AddressParseError::EmptyHost);
        }
        let port: u16 = port
            .parse()
            .map_err(|_| AddressParseError::InvalidPort(port.to_string()))?;
        Ok(Address::new(class, host, port))
    }
}

/// A connect argument: an address plus the `*` paired-connect marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub address: Address,
    pub paired: bool,
}

impl From<Address> for ConnectTarget {
    fn from(address: Address) -> Self {
        Self {
            address,
            paired: false,
        }
    }
}

impl FromStr for ConnectTarget {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (paired, rest) = match s.strip_prefix('*') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        Ok(Self {
            address: rest.parse()?,
            paired,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_all_classes() {
        for class in [
            NodeClass::Node,
            NodeClass::Streamer,
            NodeClass::Remote,
            NodeClass::Ca,
        ] {
            let addr = Address::new(class, "127.0.0.1", 65432);
            let parsed: Address = addr.to_string().parse().unwrap();
            assert_eq!(parsed, addr);
        }
    }

    #[test]
    fn round_trip_ipv6_host() {
        let addr = Address::new(NodeClass::Streamer, "::1", 65431);
        assert_eq!(addr.to_string(), "ChaskiStreamer@::1:65431");
        let parsed: Address = addr.to_string().parse().unwrap();
        assert_eq!(parsed, addr);
    }

    #[test]
    fn rejects_malformed() {
        assert!(matches!(
            "ChaskiBogus@127.0.0.1:1".parse::<Address>(),
            Err(AddressParseError::UnknownClass(_))
        ));
        assert!(matches!(
            "ChaskiNode127.0.0.1:1".parse::<Address>(),
            Err(AddressParseError::MissingAt)
        ));
        assert!(matches!(
            "ChaskiNode@127.0.0.1".parse::<Address>(),
            Err(AddressParseError::MissingPort)
        ));
        assert!(matches!(
            "ChaskiNode@127.0.0.1:notaport".parse::<Address>(),
            Err(AddressParseError::InvalidPort(_))
        ));
        assert!(matches!(
            "ChaskiNode@:80".parse::<Address>(),
            Err(AddressParseError::EmptyHost)
        ));
    }

    #[test]
    fn paired_connect_marker() {
        let target: ConnectTarget = "*ChaskiStreamer@127.0.0.1:65430".parse().unwrap();
        assert!(target.paired);
        assert_eq!(target.address.class, NodeClass::Streamer);

        let plain: ConnectTarget = "ChaskiStreamer@127.0.0.1:65430".parse().unwrap();
        assert!(!plain.paired);
    }

    #[test]
    fn serde_round_trip() {
        let addr = Address::new(NodeClass::Ca, "10.0.0.7", 65432);
        let bytes = bincode::serialize(&addr).unwrap();
        let decoded: Address = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, addr);
    }
}
