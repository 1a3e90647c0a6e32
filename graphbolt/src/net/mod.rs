pub mod resolve;

use std::fmt;
use std::hash::Hash;
use std::net::SocketAddr;

use faststr::FastStr;

/// An unresolved `host:port` pair, as reported by a routing table or
/// configured as an initial router.
///
/// Routing tables are keyed by this form; the pool is keyed by
/// [`ResolvedAddress`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Address {
    host: FastStr,
    port: u16,
}

impl Address {
    pub fn new(host: impl Into<FastStr>, port: u16) -> Self {
        Address {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &FastStr {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl From<(&str, u16)> for Address {
    fn from((host, port): (&str, u16)) -> Self {
        Address::new(FastStr::new(host), port)
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::new(addr.ip().to_string(), addr.port())
    }
}

/// A resolved IP endpoint that remembers the host name it was resolved from.
///
/// The host name is needed for SNI and for checking routing-table membership,
/// which is keyed by the unresolved form. Equality and hashing only consider
/// the endpoint itself, mirroring how sockets are deduplicated.
#[derive(Clone, Debug)]
pub struct ResolvedAddress {
    socket_addr: SocketAddr,
    host_name: FastStr,
}

impl ResolvedAddress {
    pub fn new(socket_addr: SocketAddr, host_name: impl Into<FastStr>) -> Self {
        ResolvedAddress {
            socket_addr,
            host_name: host_name.into(),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.socket_addr
    }

    pub fn host_name(&self) -> &FastStr {
        &self.host_name
    }

    /// The `host:port` form this endpoint was resolved from.
    pub fn unresolved(&self) -> Address {
        Address::new(self.host_name.clone(), self.socket_addr.port())
    }
}

impl PartialEq for ResolvedAddress {
    fn eq(&self, other: &Self) -> bool {
        self.socket_addr == other.socket_addr
    }
}

impl Eq for ResolvedAddress {}

impl Hash for ResolvedAddress {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        Hash::hash(&self.socket_addr, state);
    }
}

impl fmt::Display for ResolvedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr)
    }
}

impl From<SocketAddr> for ResolvedAddress {
    fn from(socket_addr: SocketAddr) -> Self {
        ResolvedAddress {
            host_name: FastStr::new(socket_addr.ip().to_string()),
            socket_addr,
        }
    }
}
