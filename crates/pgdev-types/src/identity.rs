//! Service identity and the deterministic names derived from it.
//!
//! Container names are a pure function of the identity so that a later
//! `destroy` can find containers left behind by a crashed run without any
//! in-memory state.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Prefix shared by every container pgdev creates.
const CONTAINER_PREFIX: &str = "pgdev";

/// Who a database instance belongs to and where its files live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceIdentity {
    /// Service name (e.g. `store`).
    pub name: String,
    /// Module the service belongs to.
    pub module: String,
    /// Workspace the module belongs to.
    pub workspace: String,
    /// Directory holding the service settings, migrations and data.
    pub location: PathBuf,
}

impl ServiceIdentity {
    /// Create an identity.
    pub fn new(
        name: impl Into<String>,
        module: impl Into<String>,
        workspace: impl Into<String>,
        location: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            module: module.into(),
            workspace: workspace.into(),
            location: location.into(),
        }
    }

    /// Unique service identifier, `module/name`.
    ///
    /// Used as the origin of exported connection configurations.
    pub fn unique(&self) -> String {
        format!("{}/{}", self.module, self.name)
    }

    /// Resolve a path relative to the service location.
    pub fn local(&self, relative: impl AsRef<Path>) -> PathBuf {
        self.location.join(relative)
    }

    /// Name of the long-running database container.
    pub fn container_name(&self) -> String {
        sanitize(&format!(
            "{CONTAINER_PREFIX}-{}-{}-{}",
            self.workspace, self.module, self.name
        ))
    }

    /// Name of the ephemeral migration helper container.
    pub fn helper_container_name(&self) -> String {
        format!("{}-alembic", self.container_name())
    }
}

impl fmt::Display for ServiceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.workspace, self.module, self.name)
    }
}

/// Map a string onto the character set docker accepts for container names.
fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}
