//! Transport endpoint addresses
//!
//! Every transport mapping binds and routes by a [`TransportAddress`]: a
//! socket address tagged with the medium it belongs to. Mappings refuse to
//! operate on an address of a kind they do not support.
use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use crate::error::KingfisherError;

/// The medium an address belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AddressKind {
    Udp,
    Tcp,
    Tls,
}

impl fmt::Display for AddressKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressKind::Udp => write!(f, "udp"),
            AddressKind::Tcp => write!(f, "tcp"),
            AddressKind::Tls => write!(f, "tls"),
        }
    }
}

impl FromStr for AddressKind {
    type Err = KingfisherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "udp" => Ok(AddressKind::Udp),
            "tcp" => Ok(AddressKind::Tcp),
            "tls" => Ok(AddressKind::Tls),
            _ => Err(crate::config_error!("Unknown address kind: {}", s)),
        }
    }
}

/// An immutable, comparable endpoint identifier: medium + socket address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TransportAddress {
    Udp(SocketAddr),
    Tcp(SocketAddr),
    Tls(SocketAddr),
}

impl TransportAddress {
    pub fn udp(addr: SocketAddr) -> Self {
        TransportAddress::Udp(addr)
    }

    pub fn tcp(addr: SocketAddr) -> Self {
        TransportAddress::Tcp(addr)
    }

    pub fn tls(addr: SocketAddr) -> Self {
        TransportAddress::Tls(addr)
    }

    pub fn kind(&self) -> AddressKind {
        match self {
            TransportAddress::Udp(_) => AddressKind::Udp,
            TransportAddress::Tcp(_) => AddressKind::Tcp,
            TransportAddress::Tls(_) => AddressKind::Tls,
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        match self {
            TransportAddress::Udp(addr)
            | TransportAddress::Tcp(addr)
            | TransportAddress::Tls(addr) => *addr,
        }
    }

    pub fn port(&self) -> u16 {
        self.socket_addr().port()
    }
}

impl fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.socket_addr())
    }
}

impl FromStr for TransportAddress {
    type Err = KingfisherError;

    /// Parses `kind:host:port` (e.g. `udp:127.0.0.1:161`). A bare
    /// `host:port` is treated as UDP.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, rest) = match s.split_once(':') {
            Some((prefix, rest)) if prefix.parse::<AddressKind>().is_ok() => {
                (prefix.parse::<AddressKind>()?, rest)
            }
            _ => (AddressKind::Udp, s),
        };
        let addr: SocketAddr = rest.parse()?;
        Ok(match kind {
            AddressKind::Udp => TransportAddress::Udp(addr),
            AddressKind::Tcp => TransportAddress::Tcp(addr),
            AddressKind::Tls => TransportAddress::Tls(addr),
        })
    }
}
