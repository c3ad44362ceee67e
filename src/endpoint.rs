//! Resolved server endpoint and the address parsers used by channel init.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};

/// A resolved ip:port pair identifying one server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    ip: IpAddr,
    port: u16,
}

impl Endpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self {
            ip: addr.ip(),
            port: addr.port(),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "{ip}:{}", self.port),
            IpAddr::V6(ip) => write!(f, "[{ip}]:{}", self.port),
        }
    }
}

/// Parse `a.b.c.d:port` or `[v6]:port` without name resolution.
pub fn str2endpoint(addr_and_port: &str) -> Option<Endpoint> {
    addr_and_port
        .parse::<SocketAddr>()
        .ok()
        .map(Endpoint::from)
}

/// Parse `a.b.c.d` or a bare v6 literal, with an explicit port.
pub fn str2endpoint_with_port(addr: &str, port: u16) -> Option<Endpoint> {
    addr.parse::<IpAddr>()
        .ok()
        .map(|ip| Endpoint::new(ip, port))
}

/// Resolve `host:port` through the system resolver.
pub fn hostname2endpoint(host_and_port: &str) -> Option<Endpoint> {
    let (host, port) = host_and_port.rsplit_once(':')?;
    let port: u16 = port.parse().ok()?;
    hostname2endpoint_with_port(host, port)
}

/// Resolve a bare hostname through the system resolver, with an explicit port.
pub fn hostname2endpoint_with_port(host: &str, port: u16) -> Option<Endpoint> {
    let mut addrs = (host, port).to_socket_addrs().ok()?;
    // Prefer v4 to keep the printed form stable across resolvers.
    let first = addrs.next()?;
    let picked = std::iter::once(first)
        .chain(addrs)
        .min_by_key(|a| match a {
            SocketAddr::V4(_) => 0,
            SocketAddr::V6(_) => 1,
        })?;
    Some(Endpoint::from(picked))
}

/// Loopback endpoint, used by tests and describe output checks.
pub fn loopback(port: u16) -> Endpoint {
    Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_v4() {
        let ep = str2endpoint("127.0.0.1:9000").unwrap();
        assert_eq!(ep.port(), 9000);
        assert_eq!(ep.to_string(), "127.0.0.1:9000");
    }

    #[test]
    fn parses_bracketed_v6() {
        let ep = str2endpoint("[::1]:80").unwrap();
        assert_eq!(ep.port(), 80);
        assert_eq!(ep.to_string(), "[::1]:80");
    }

    #[test]
    fn rejects_garbage() {
        assert!(str2endpoint("not-an-endpoint").is_none());
        assert!(str2endpoint("127.0.0.1").is_none());
        assert!(str2endpoint("list://a,b").is_none());
    }

    #[test]
    fn resolves_localhost() {
        let ep = hostname2endpoint("localhost:1234").unwrap();
        assert_eq!(ep.port(), 1234);
        assert!(ep.ip().is_loopback());
    }

    #[test]
    fn display_round_trips() {
        for s in ["10.0.0.1:1", "[2001:db8::1]:65535"] {
            let ep = str2endpoint(s).unwrap();
            assert_eq!(str2endpoint(&ep.to_string()), Some(ep));
        }
    }
}
