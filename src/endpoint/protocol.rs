//! Session protocols and their default ports.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol used to talk to an endpoint.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SessionProtocol {
    #[default]
    Http,
    Https,
}

impl SessionProtocol {
    /// Default port of this protocol.
    pub fn default_port(self) -> u16 {
        match self {
            SessionProtocol::Http => 80,
            SessionProtocol::Https => 443,
        }
    }

    /// URI scheme of this protocol.
    pub fn scheme(self) -> &'static str {
        match self {
            SessionProtocol::Http => "http",
            SessionProtocol::Https => "https",
        }
    }
}

impl fmt::Display for SessionProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}
