use std::fmt;

use serde::{Deserialize, Serialize};

use crate::opcode::OpCode;

/// Stable identifier of a service.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServiceID(String);

impl ServiceID {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The invalid sentinel, used by framework-level messages that are not
    /// scoped to any service.
    pub fn invalid() -> Self {
        Self(String::new())
    }

    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ServiceID {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for ServiceID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable identifier of one operation (request, property, or signal) within a
/// service.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpID(String);

impl OpID {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for OpID {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for OpID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Correlation id for one outstanding asynchronous action: a sent request or
/// an active subscription.
///
/// A `RegID` is unique for the lifetime of the action it tracks. It is
/// returned on registration or send and required to unregister or abort.
/// Once the action completes, is aborted, or its owning endpoint goes away,
/// the id is retired and late messages bearing it are discarded.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RegID {
    pub service_id: ServiceID,
    pub op_id: OpID,
    pub op_code: OpCode,
    /// Per-requester sequence; never zero for a live action.
    pub sequence: u64,
}

impl RegID {
    pub fn is_valid(&self) -> bool {
        self.sequence != 0 && self.service_id.is_valid()
    }
}
