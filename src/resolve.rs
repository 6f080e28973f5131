//! Address-resolution adapter.
//!
//! Wraps the system resolver for `connect(host, port)`. Callers never see a
//! synchronous completion: the lookup continuation always runs from the
//! loop's deferred queue, so state observed right after `connect` returns
//! is still `opening` even for literal addresses.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use crate::error::Error;

/// Whether `host` needs a resolver round trip (i.e. is not a literal IP).
pub(crate) fn needs_lookup(host: &str) -> bool {
    host.parse::<IpAddr>().is_err()
}

/// Resolve `host` to one address, IPv4 preferred, falling back to IPv6.
///
/// Literal addresses pass straight through. Resolver errors and empty
/// results are fatal to the connecting stream.
pub(crate) fn lookup(host: &str, port: u16) -> Result<SocketAddr, Error> {
    if !needs_lookup(host) {
        let ip: IpAddr = host
            .parse()
            .map_err(|_| Error::Resolve(host.to_string()))?;
        return Ok(SocketAddr::new(ip, port));
    }
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|e| Error::Resolve(format!("{host}: {e}")))?
        .collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.iter().find(|a| a.is_ipv6()))
        .copied()
        .ok_or_else(|| Error::Resolve(format!("{host}: no addresses")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literals_skip_lookup() {
        assert!(!needs_lookup("127.0.0.1"));
        assert!(!needs_lookup("::1"));
        assert!(needs_lookup("localhost"));
        assert!(needs_lookup("example.com"));
    }

    #[test]
    fn literal_passthrough() {
        let addr = lookup("127.0.0.1", 80).unwrap();
        assert_eq!(addr, "127.0.0.1:80".parse().unwrap());
        let addr6 = lookup("::1", 8080).unwrap();
        assert_eq!(addr6, "[::1]:8080".parse().unwrap());
    }

    #[test]
    fn localhost_prefers_v4() {
        // localhost resolves on any test host; v4 wins when present.
        if let Ok(addr) = lookup("localhost", 80) {
            if addr.is_ipv4() {
                assert_eq!(addr.ip(), "127.0.0.1".parse::<IpAddr>().unwrap());
            }
        }
    }
}
