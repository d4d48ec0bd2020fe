use std::{
    fmt,
    net::{IpAddr, SocketAddr, ToSocketAddrs},
    str::FromStr,
};

use crate::error::{Error, Result};

/// Transport named in an [`Address`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("tcp") {
            Ok(Protocol::Tcp)
        } else {
            Err(Error::UnsupportedProtocol(s.to_string()))
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => f.write_str("tcp"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Host {
    Ip(IpAddr),
    Name(String),
}

/// An endpoint written as `protocol://host:port`.
///
/// The host is either an IP literal (IPv6 may be bracketed) or a DNS name,
/// which is only looked up by [`Address::resolve`].
///
/// ```
/// use mill_socket::net::address::{Address, Host, Protocol};
///
/// let addr: Address = "tcp://127.0.0.1:5555".parse().unwrap();
/// assert_eq!(addr.protocol(), Protocol::Tcp);
/// assert_eq!(addr.port(), 5555);
/// assert!(matches!(addr.host(), Host::Ip(_)));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    protocol: Protocol,
    host: Host,
    port: u16,
}

impl Address {
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Turns the address into a socket address, looking up DNS names.
    /// The first address the resolver returns wins.
    pub fn resolve(&self) -> Result<SocketAddr> {
        match &self.host {
            Host::Ip(ip) => Ok(SocketAddr::new(*ip, self.port)),
            Host::Name(name) => (name.as_str(), self.port)
                .to_socket_addrs()
                .map_err(|_| Error::Unresolvable(name.clone()))?
                .next()
                .ok_or_else(|| Error::Unresolvable(name.clone())),
        }
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidAddress(s.to_string());

        let (protocol, rest) = s.split_once("://").ok_or_else(invalid)?;
        if protocol.is_empty() || !protocol.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(invalid());
        }
        let (host, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
        let port: u16 = port.parse().map_err(|_| invalid())?;

        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() || host.chars().any(char::is_whitespace) {
            return Err(invalid());
        }
        let host = match host.parse::<IpAddr>() {
            Ok(ip) => Host::Ip(ip),
            Err(_) => Host::Name(host.to_string()),
        };

        Ok(Self {
            protocol: protocol.parse()?,
            host,
            port,
        })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.host {
            Host::Ip(IpAddr::V6(ip)) => write!(f, "{}://[{}]:{}", self.protocol, ip, self.port),
            Host::Ip(ip) => write!(f, "{}://{}:{}", self.protocol, ip, self.port),
            Host::Name(name) => write!(f, "{}://{}:{}", self.protocol, name, self.port),
        }
    }
}
