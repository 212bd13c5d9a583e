//! Parsing of the channel's `Target` URI into a scheme and an authority.
//!
//! The scheme selects a [`crate::resolver::Resolver`] factory (§3, §4.1); the
//! authority is transmitted as `:authority` on every call unless overridden.

use http::Uri;
use std::fmt;

/// A parsed target URI, e.g. `http://localhost:5000` or `dns:///example.com`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Target {
    uri: Uri,
}

/// Error constructing a [`Target`] from a user-supplied address string.
#[derive(Debug)]
pub struct InvalidTarget(pub(crate) String);

impl fmt::Display for InvalidTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid target uri: {}", self.0)
    }
}

impl std::error::Error for InvalidTarget {}

impl Target {
    /// Parse a target from a URI-shaped string.
    ///
    /// Targets without a scheme (e.g. `localhost:5000`) are treated as
    /// `dns:///localhost:5000`, matching how the reference resolver treats a
    /// bare `host:port` as a DNS name to poll.
    pub fn from_shared(target: impl Into<String>) -> Result<Self, InvalidTarget> {
        let target = target.into();
        let uri: Uri = target
            .parse()
            .map_err(|_| InvalidTarget(target.clone()))?;

        if uri.scheme().is_none() {
            let dns = format!("dns:///{target}");
            let uri: Uri = dns.parse().map_err(|_| InvalidTarget(target))?;
            return Ok(Target { uri });
        }

        Ok(Target { uri })
    }

    pub(crate) fn from_uri(uri: Uri) -> Self {
        Target { uri }
    }

    /// The scheme that selects a resolver factory (`http`, `https`, `dns`, `unix`, ...).
    pub fn scheme(&self) -> &str {
        self.uri.scheme_str().unwrap_or("http")
    }

    /// The default `:authority` transmitted on every call made through this target.
    pub fn authority(&self) -> String {
        self.uri
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_default()
    }

    /// The underlying URI, e.g. to recover host/port for a static resolver.
    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// True for `unix:` targets, a degenerate single-address static target
    /// (kept for parity with the reference `Endpoint`, which special-cases
    /// Unix domain sockets the same way).
    pub fn is_unix(&self) -> bool {
        self.scheme() == "unix"
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uri)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_http_target() {
        let t = Target::from_shared("http://localhost:5000").unwrap();
        assert_eq!(t.scheme(), "http");
        assert_eq!(t.authority(), "localhost:5000");
    }

    #[test]
    fn bare_host_port_becomes_dns() {
        let t = Target::from_shared("localhost:5000").unwrap();
        assert_eq!(t.scheme(), "dns");
    }

    #[test]
    fn unix_target_is_recognized() {
        let t = Target::from_shared("unix:///tmp/grpc.sock").unwrap();
        assert!(t.is_unix());
    }
}
