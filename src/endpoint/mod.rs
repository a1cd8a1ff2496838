//! Endpoint identity.
//!
//! An [`Endpoint`] names a network destination by host and optional port.
//! Health checking derives a separate check endpoint from it, see
//! [`Endpoint::for_health_check`].

mod protocol;

pub use protocol::SessionProtocol;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur while parsing an endpoint authority.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EndpointParseError {
    #[error("endpoint authority is empty")]
    Empty,

    #[error("invalid port in '{0}'")]
    InvalidPort(String),

    #[error("unterminated IPv6 literal in '{0}'")]
    UnterminatedIpv6(String),
}

/// A network destination: a host plus an optional port.
///
/// Two endpoints are equal when both host and port are equal, so `example.com`
/// and `example.com:80` are distinct endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    host: String,
    port: Option<u16>,
}

impl Endpoint {
    /// Create an endpoint without a port.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: None,
        }
    }

    /// Create an endpoint with a port.
    pub fn of(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port: Some(port),
        }
    }

    /// Host name or IP address.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port, if one was specified.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Port, or `default` if none was specified.
    pub fn port_or(&self, default: u16) -> u16 {
        self.port.unwrap_or(default)
    }

    /// Returns a copy of this endpoint with the given port.
    pub fn with_port(&self, port: u16) -> Self {
        Self::of(self.host.clone(), port)
    }

    /// Returns a copy of this endpoint without a port.
    pub fn without_port(&self) -> Self {
        Self::new(self.host.clone())
    }

    /// Returns a copy of this endpoint with its port removed if it equals `default_port`.
    pub fn without_default_port(&self, default_port: u16) -> Self {
        match self.port {
            Some(port) if port == default_port => self.without_port(),
            _ => self.clone(),
        }
    }

    /// Derive the endpoint a health checker should probe.
    ///
    /// * no override: the protocol's default port is stripped if present
    /// * override equal to the protocol default: the port is stripped
    /// * any other override: that port is set explicitly
    pub fn for_health_check(&self, protocol: SessionProtocol, port_override: Option<u16>) -> Self {
        let default_port = protocol.default_port();
        match port_override {
            None => self.without_default_port(default_port),
            Some(port) if port == default_port => self.without_port(),
            Some(port) => self.with_port(port),
        }
    }

    /// Authority string, e.g. `example.com:8080` or `[::1]:8080`.
    pub fn authority(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            f.write_str(&self.host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}

impl FromStr for Endpoint {
    type Err = EndpointParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(EndpointParseError::Empty);
        }

        let parse_port = |p: &str| -> Result<u16, EndpointParseError> {
            p.parse()
                .map_err(|_| EndpointParseError::InvalidPort(s.to_string()))
        };

        // [v6] or [v6]:port
        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| EndpointParseError::UnterminatedIpv6(s.to_string()))?;
            if host.is_empty() {
                return Err(EndpointParseError::Empty);
            }
            return match tail {
                "" => Ok(Self::new(host)),
                _ => match tail.strip_prefix(':') {
                    Some(port) => Ok(Self::of(host, parse_port(port)?)),
                    None => Err(EndpointParseError::InvalidPort(s.to_string())),
                },
            };
        }

        match s.matches(':').count() {
            0 => Ok(Self::new(s)),
            1 => {
                let (host, port) = s.split_once(':').unwrap_or((s, ""));
                if host.is_empty() {
                    return Err(EndpointParseError::Empty);
                }
                Ok(Self::of(host, parse_port(port)?))
            }
            // Bare IPv6 literal
            _ => Ok(Self::new(s)),
        }
    }
}

impl TryFrom<String> for Endpoint {
    type Error = EndpointParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_host_and_port() {
        let e: Endpoint = "example.com:8080".parse().unwrap();
        assert_eq!(e.host(), "example.com");
        assert_eq!(e.port(), Some(8080));

        let e: Endpoint = "example.com".parse().unwrap();
        assert_eq!(e.port(), None);
    }

    #[test]
    fn test_parse_ipv6() {
        let e: Endpoint = "[::1]:9000".parse().unwrap();
        assert_eq!(e.host(), "::1");
        assert_eq!(e.port(), Some(9000));
        assert_eq!(e.to_string(), "[::1]:9000");

        let e: Endpoint = "::1".parse().unwrap();
        assert_eq!(e.host(), "::1");
        assert_eq!(e.port(), None);
        assert_eq!(e.to_string(), "[::1]");
    }

    #[test]
    fn test_parse_invalid() {
        assert_eq!("".parse::<Endpoint>(), Err(EndpointParseError::Empty));
        assert!(matches!(
            "host:notaport".parse::<Endpoint>(),
            Err(EndpointParseError::InvalidPort(_))
        ));
        assert!(matches!(
            "[::1:80".parse::<Endpoint>(),
            Err(EndpointParseError::UnterminatedIpv6(_))
        ));
        assert!(matches!(
            "host:70000".parse::<Endpoint>(),
            Err(EndpointParseError::InvalidPort(_))
        ));
    }

    #[test]
    fn test_equality_includes_port() {
        assert_ne!(Endpoint::new("a"), Endpoint::of("a", 80));
        assert_eq!(Endpoint::of("a", 80), "a:80".parse().unwrap());
    }

    #[test]
    fn test_health_check_port_rules() {
        let http = SessionProtocol::Http;

        // No override strips the default port only
        assert_eq!(
            Endpoint::of("a", 80).for_health_check(http, None),
            Endpoint::new("a")
        );
        assert_eq!(
            Endpoint::of("a", 8080).for_health_check(http, None),
            Endpoint::of("a", 8080)
        );

        // Override equal to the default strips the port
        assert_eq!(
            Endpoint::of("a", 8080).for_health_check(http, Some(80)),
            Endpoint::new("a")
        );

        // Any other override is applied
        assert_eq!(
            Endpoint::of("a", 8080).for_health_check(http, Some(9090)),
            Endpoint::of("a", 9090)
        );
        assert_eq!(
            Endpoint::new("a").for_health_check(SessionProtocol::Https, Some(8443)),
            Endpoint::of("a", 8443)
        );
    }

    #[test]
    fn test_serde_as_authority() {
        let e: Endpoint = serde_yaml::from_str("\"10.0.0.1:8080\"").unwrap();
        assert_eq!(e, Endpoint::of("10.0.0.1", 8080));

        let list: Vec<Endpoint> = serde_yaml::from_str("- a:1\n- b\n").unwrap();
        assert_eq!(list, vec![Endpoint::of("a", 1), Endpoint::new("b")]);

        assert!(serde_yaml::from_str::<Endpoint>("\"a:b\"").is_err());
    }
}
