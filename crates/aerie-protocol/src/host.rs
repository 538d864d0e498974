//! Seed and service host addresses

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Default service port
pub const DEFAULT_PORT: u16 = 3000;

/// A server address as configured by the user or advertised by a node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Host {
    /// Hostname or IP literal
    pub name: String,
    /// Service port
    pub port: u16,
    /// Name expected on the server certificate, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_name: Option<String>,
}

impl Host {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
            tls_name: None,
        }
    }

    /// Set the TLS name
    pub fn with_tls_name(mut self, tls_name: impl Into<String>) -> Self {
        self.tls_name = Some(tls_name.into());
        self
    }

    /// Same name and port, ignoring the TLS name
    pub fn same_address(&self, other: &Host) -> bool {
        self.port == other.port && self.name.eq_ignore_ascii_case(&other.name)
    }

    /// `name:port` string usable with `TcpStream::connect`
    pub fn address(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.name.contains(':') {
            write!(f, "[{}]:{}", self.name, self.port)
        } else {
            write!(f, "{}:{}", self.name, self.port)
        }
    }
}

impl FromStr for Host {
    type Err = ProtocolError;

    /// Parse `host`, `host:port`, `[v6]` or `[v6]:port`
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ProtocolError::InvalidHost(s.to_string()));
        }

        if let Some(rest) = s.strip_prefix('[') {
            let (name, tail) = rest
                .split_once(']')
                .ok_or_else(|| ProtocolError::InvalidHost(s.to_string()))?;
            let port = match tail {
                "" => DEFAULT_PORT,
                t => parse_port(t.strip_prefix(':').unwrap_or(t), s)?,
            };
            return Ok(Host::new(name, port));
        }

        match s.rsplit_once(':') {
            // a bare IPv6 literal has more than one colon
            Some((name, _)) if name.contains(':') => Ok(Host::new(s, DEFAULT_PORT)),
            Some((name, port)) => Ok(Host::new(name, parse_port(port, s)?)),
            None => Ok(Host::new(s, DEFAULT_PORT)),
        }
    }
}

fn parse_port(port: &str, whole: &str) -> Result<u16> {
    port.parse()
        .map_err(|_| ProtocolError::InvalidHost(whole.to_string()))
}

/// Parse a `;`-separated host list as returned by the `service-*` info commands
pub fn parse_hosts(list: &str) -> Result<Vec<Host>> {
    list.split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Host::from_str)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_host() {
        let host: Host = "db1.example.com:3100".parse().unwrap();
        assert_eq!(host, Host::new("db1.example.com", 3100));

        let host: Host = "db1".parse().unwrap();
        assert_eq!(host.port, DEFAULT_PORT);
    }

    #[test]
    fn test_parse_ipv6() {
        let host: Host = "[fe80::1]:3000".parse().unwrap();
        assert_eq!(host.name, "fe80::1");
        assert_eq!(host.to_string(), "[fe80::1]:3000");

        let host: Host = "::1".parse().unwrap();
        assert_eq!(host.name, "::1");
        assert_eq!(host.port, DEFAULT_PORT);
    }

    #[test]
    fn test_parse_invalid() {
        assert!("".parse::<Host>().is_err());
        assert!("host:notaport".parse::<Host>().is_err());
        assert!("[::1:3000".parse::<Host>().is_err());
    }

    #[test]
    fn test_parse_hosts_list() {
        let hosts = parse_hosts("10.0.0.1:3000;10.0.0.2:3001;").unwrap();
        assert_eq!(
            hosts,
            vec![Host::new("10.0.0.1", 3000), Host::new("10.0.0.2", 3001)]
        );
        assert!(parse_hosts("").unwrap().is_empty());
    }

    #[test]
    fn test_same_address_ignores_tls_name() {
        let a = Host::new("10.0.0.1", 3000).with_tls_name("cluster-a");
        let b = Host::new("10.0.0.1", 3000);
        assert!(a.same_address(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn test_host_serde() {
        let host = Host::new("10.0.0.1", 3000);
        let json = serde_json::to_string(&host).unwrap();
        assert_eq!(json, r#"{"name":"10.0.0.1","port":3000}"#);
        let back: Host = serde_json::from_str(&json).unwrap();
        assert_eq!(back, host);
    }
}
