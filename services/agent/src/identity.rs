//! Agent identity.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;

/// Maximum accepted identity length in bytes.
const MAX_LEN: usize = 253;

/// Errors that can occur when parsing an agent identity.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AgentIdError {
    /// The identity string is empty.
    #[error("agent ID cannot be empty")]
    Empty,

    /// The identity is longer than allowed.
    #[error("agent ID exceeds {MAX_LEN} bytes")]
    TooLong,

    /// The identity contains whitespace or control characters.
    #[error("agent ID contains invalid character {0:?}")]
    InvalidChar(char),
}

/// Opaque identifier of this node.
///
/// Embedded in every outbound message and compared against the target of
/// every inbound one. Cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AgentId(Arc<str>);

impl AgentId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether an inbound message addressed to `target` is meant for this agent.
    pub fn matches(&self, target: &str) -> bool {
        self.as_str() == target
    }
}

impl FromStr for AgentId {
    type Err = AgentIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(AgentIdError::Empty);
        }
        if s.len() > MAX_LEN {
            return Err(AgentIdError::TooLong);
        }
        if let Some(c) = s.chars().find(|c| c.is_whitespace() || c.is_control()) {
            return Err(AgentIdError::InvalidChar(c));
        }
        Ok(Self(Arc::from(s)))
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for AgentId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
