//! Network endpoint types.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};

/// A TCP endpoint (IP address + port).
///
/// Wrapper around [`SocketAddr`] used for listener binds and peer addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint(SocketAddr);

impl Endpoint {
    /// Creates an endpoint bound to all interfaces (0.0.0.0) on the given port.
    #[must_use]
    pub const fn any(port: u16) -> Self {
        Self(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
    }

    /// Creates a localhost endpoint on the given port.
    #[must_use]
    pub const fn localhost(port: u16) -> Self {
        Self(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
    }

    /// Resolves `host:port` into every candidate endpoint.
    ///
    /// An empty host resolves to [`Endpoint::any`].
    ///
    /// # Errors
    ///
    /// Returns an error if name resolution fails or yields nothing.
    pub fn resolve(host: &str, port: u16) -> io::Result<Vec<Self>> {
        if host.is_empty() {
            return Ok(vec![Self::any(port)]);
        }
        let resolved: Vec<Self> = (host, port).to_socket_addrs()?.map(Self).collect();
        if resolved.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no address found for {host}"),
            ));
        }
        Ok(resolved)
    }

    /// Returns the IP address.
    #[must_use]
    pub const fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    /// Returns the port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.0.port()
    }

    /// Returns the underlying [`SocketAddr`].
    #[must_use]
    pub const fn as_socket_addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_any() {
        let ep = Endpoint::any(9000);
        assert_eq!(ep.ip(), IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(ep.port(), 9000);
    }

    #[test]
    fn endpoint_display() {
        let ep = Endpoint::localhost(8080);
        assert_eq!(format!("{ep}"), "127.0.0.1:8080");
    }

    #[test]
    fn resolve_empty_host_binds_all_interfaces() {
        let resolved = Endpoint::resolve("", 11111).unwrap();
        assert_eq!(resolved, vec![Endpoint::any(11111)]);
    }

    #[test]
    fn resolve_numeric_host() {
        let resolved = Endpoint::resolve("127.0.0.1", 4242).unwrap();
        assert_eq!(resolved, vec![Endpoint::localhost(4242)]);
    }
}
