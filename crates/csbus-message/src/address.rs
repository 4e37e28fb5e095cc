use std::fmt;

use serde::{Deserialize, Serialize};

/// A reachable endpoint: a component in this process or a remote server.
///
/// Ordering and hashing are total so addresses can key registry maps.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address {
    name: String,
    port: i32,
}

impl Address {
    /// Port value carried by the invalid sentinel.
    pub const INVALID_PORT: i32 = -1;

    /// Create a new address.
    pub fn new(name: impl Into<String>, port: i32) -> Self {
        Self {
            name: name.into(),
            port,
        }
    }

    /// The invalid sentinel: both fields at their invalid value.
    pub fn invalid() -> Self {
        Self {
            name: String::new(),
            port: Self::INVALID_PORT,
        }
    }

    /// An address is valid if either field differs from its invalid value.
    pub fn is_valid(&self) -> bool {
        self.port != Self::INVALID_PORT || !self.name.is_empty()
    }

    /// The endpoint name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The endpoint port.
    pub fn port(&self) -> i32 {
        self.port
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.port)
    }
}
