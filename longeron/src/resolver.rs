//! Remote address resolution.
//!
//! The bootstrap resolves names on the reactor the channel was assigned
//! to, behind this trait so embedders can substitute a non-blocking
//! resolver. The default goes through the system resolver and may block
//! that reactor for the duration of the lookup; numeric addresses
//! resolve without any lookup.

use std::net::{SocketAddr, ToSocketAddrs};

use longeron_core::error::{LongeronError, Result};

/// Resolves a host/port pair to a socket address.
pub trait AddressResolver: Send + Sync + 'static {
    /// Resolve `host:port`, preferring the first address returned.
    fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr>;
}

/// System resolver via `ToSocketAddrs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdResolver;

impl AddressResolver for StdResolver {
    fn resolve(&self, host: &str, port: u16) -> Result<SocketAddr> {
        let mut addrs = (host, port)
            .to_socket_addrs()
            .map_err(|_| LongeronError::UnresolvedAddress(format!("{host}:{port}")))?;
        addrs
            .next()
            .ok_or_else(|| LongeronError::UnresolvedAddress(format!("{host}:{port}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_resolution() {
        let addr = StdResolver.resolve("127.0.0.1", 4000).unwrap();
        assert_eq!(addr, "127.0.0.1:4000".parse().unwrap());
    }

    #[test]
    fn test_unresolvable_host() {
        let err = StdResolver
            .resolve("definitely-not-a-host.invalid", 4000)
            .unwrap_err();
        assert!(matches!(err, LongeronError::UnresolvedAddress(_)));
    }
}
