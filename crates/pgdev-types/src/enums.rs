//! Enumeration types shared across the workspace.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A network vantage point from which the database can be reached.
///
/// The same logical endpoint resolves to a different address depending on
/// who connects: the host process, a sibling container, or the outside
/// world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Scope {
    /// Reachable from a process running directly on the host.
    Native,
    /// Reachable from inside a sibling container (e.g. a migration helper).
    Container,
    /// Reachable from outside the development machine.
    Public,
}

impl Scope {
    /// All scopes, in the order instances are usually produced.
    pub const ALL: [Self; 3] = [Self::Native, Self::Container, Self::Public];

    /// Lowercase name used in logs and settings.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Container => "container",
            Self::Public => "public",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string does not name a known [`Scope`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown network scope: {0}")]
pub struct ScopeParseError(pub String);

impl FromStr for Scope {
    type Err = ScopeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "native" => Ok(Self::Native),
            "container" => Ok(Self::Container),
            "public" => Ok(Self::Public),
            other => Err(ScopeParseError(other.to_owned())),
        }
    }
}
