//! Tunnel endpoint parsing.

use std::fmt;

use crate::error::{MountError, Result};

/// Host and optional port of the NFS endpoint the client mounts from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: Option<u16>,
}

impl Endpoint {
    /// Parses `host`, `host:port` or `[v6]:port`.
    ///
    /// A value without `:` is taken as a bare host. Anything with a colon
    /// must split cleanly into host and a numeric port.
    pub fn parse(address: &str) -> Result<Self> {
        if !address.contains(':') {
            return Ok(Self {
                host: address.to_string(),
                port: None,
            });
        }
        let (host, port) = split_host_port(address)?;
        let port = port
            .parse::<u16>()
            .map_err(|_| MountError::Config(format!("invalid port {port:?} in {address:?}")))?;
        Ok(Self {
            host: host.to_string(),
            port: Some(port),
        })
    }

    /// `host:/` for the mount command, bracketing IPv6 hosts.
    pub fn source(&self, export: &str) -> String {
        if self.host.contains(':') {
            format!("[{}]:{export}", self.host)
        } else {
            format!("{}:{export}", self.host)
        }
    }

    /// `-o port=P -o mountport=P` when a port is known.
    pub fn mount_options(&self) -> Vec<String> {
        match self.port {
            Some(port) => vec![
                "-o".to_string(),
                format!("port={port}"),
                "-o".to_string(),
                format!("mountport={port}"),
            ],
            None => Vec::new(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        match self.port {
            Some(port) => write!(f, "{host}:{port}"),
            None => f.write_str(&host),
        }
    }
}

/// Splits `host:port` / `[host]:port`. Unbracketed hosts may not contain colons.
fn split_host_port(address: &str) -> Result<(&str, &str)> {
    let malformed = |why: &str| MountError::Config(format!("invalid address {address:?}: {why}"));

    if let Some(rest) = address.strip_prefix('[') {
        let end = rest.find(']').ok_or_else(|| malformed("missing ']'"))?;
        let host = &rest[..end];
        let port = rest[end + 1..]
            .strip_prefix(':')
            .ok_or_else(|| malformed("missing port"))?;
        if host.contains(['[', ']']) || port.contains(['[', ']']) {
            return Err(malformed("unexpected bracket"));
        }
        return Ok((host, port));
    }

    let colon = address.rfind(':').ok_or_else(|| malformed("missing port"))?;
    let (host, port) = (&address[..colon], &address[colon + 1..]);
    if host.contains(':') {
        return Err(malformed("too many colons"));
    }
    if host.contains(['[', ']']) || port.contains(['[', ']']) {
        return Err(malformed("unexpected bracket"));
    }
    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_host_and_port() {
        let ep = Endpoint::parse("1.2.3.4:555").unwrap();
        assert_eq!(ep.host, "1.2.3.4");
        assert_eq!(ep.port, Some(555));
        assert_eq!(
            ep.mount_options(),
            ["-o", "port=555", "-o", "mountport=555"]
        );
        assert_eq!(ep.source("/"), "1.2.3.4:/");
    }

    #[test]
    fn test_bare_host_has_no_options() {
        let ep = Endpoint::parse("1.2.3.4").unwrap();
        assert_eq!(ep.port, None);
        assert!(ep.mount_options().is_empty());
        assert_eq!(ep.to_string(), "1.2.3.4");
    }

    #[test]
    fn test_bracketed_ipv6() {
        let ep = Endpoint::parse("[::1]:6049").unwrap();
        assert_eq!(ep.host, "::1");
        assert_eq!(ep.port, Some(6049));
        assert_eq!(ep.source("/"), "[::1]:/");
        assert_eq!(ep.to_string(), "[::1]:6049");
    }

    #[test]
    fn test_malformed_addresses() {
        for bad in ["::1", "host:", "host:port", "host:70000", "[::1", "[::1]", "[::1]x", "a:b:c"] {
            let err = Endpoint::parse(bad).unwrap_err();
            assert!(matches!(err, MountError::Config(_)), "{bad}: {err}");
        }
    }

    proptest! {
        #[test]
        fn prop_ipv4_host_port_roundtrip(octets in any::<[u8; 4]>(), port in any::<u16>()) {
            let host = std::net::Ipv4Addr::from(octets).to_string();
            let ep = Endpoint::parse(&format!("{host}:{port}")).unwrap();
            prop_assert_eq!(ep.host, host);
            prop_assert_eq!(ep.port, Some(port));
        }
    }
}
