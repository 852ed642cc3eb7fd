//! Schema migration managers.
//!
//! A [`MigrationManager`] brings the database schema up to date after the
//! container becomes ready, and re-applies a single migration when its file
//! changes on disk. Two interchangeable backends exist, selected by
//! [`MigrationFormat`]:
//!
//! - [`EmbeddedMigrator`] -- sqlx migrations run in-process over the native
//!   connection
//! - [`ContainerizedMigrator`] -- alembic run inside a short-lived helper
//!   container over the container connection
//!
//! Both share the same contract: `init` once with the exported connection
//! configurations, then any number of `apply` and `update` calls. A missing
//! migration directory turns both into no-ops.

mod containerized;
mod embedded;

use std::fmt;
use std::num::ParseIntError;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use pgdev_container::{ContainerError, ContainerRuntime};
use pgdev_types::{ConnectionConfiguration, Scope};
use sqlx::migrate::MigrateError;

use crate::error::DbError;

pub use containerized::{ContainerizedMigrator, TableCheckPolicy};
pub use embedded::EmbeddedMigrator;

// ---------------------------------------------------------------------------
// Format
// ---------------------------------------------------------------------------

/// The migration tool a service uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MigrationFormat {
    /// Plain SQL files applied by the sqlx migrator.
    #[default]
    Sqlx,
    /// An alembic project run in a helper container.
    Alembic,
}

impl MigrationFormat {
    /// Name used in settings files.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sqlx => "sqlx",
            Self::Alembic => "alembic",
        }
    }
}

impl fmt::Display for MigrationFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationFormat {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlx" => Ok(Self::Sqlx),
            "alembic" => Ok(Self::Alembic),
            _ => Err(MigrationError::UnsupportedFormat(s.to_owned())),
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Static migration settings, fixed when the service is loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationConfig {
    /// Name of the database being migrated.
    pub database_name: String,
    /// Directory holding the migrations (or the alembic project).
    pub migration_dir: PathBuf,
    /// Alternative directory mounted over the alembic `versions/` folder.
    pub version_dir_override: Option<PathBuf>,
    /// Alternative helper image, `name[:tag]`.
    pub image_override: Option<String>,
    /// Name of the helper container.
    pub helper_container: String,
}

impl MigrationConfig {
    /// Create a config with no overrides.
    pub fn new(
        database_name: impl Into<String>,
        migration_dir: impl Into<PathBuf>,
        helper_container: impl Into<String>,
    ) -> Self {
        Self {
            database_name: database_name.into(),
            migration_dir: migration_dir.into(),
            version_dir_override: None,
            image_override: None,
            helper_container: helper_container.into(),
        }
    }

    /// Whether there is anything to migrate.
    pub fn has_migrations(&self) -> bool {
        self.migration_dir.is_dir()
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised by a migration manager.
#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    /// A connection configuration required by the backend was not exported.
    #[error("no connection configuration for scope {scope}")]
    MissingScope {
        /// The missing scope.
        scope: Scope,
    },

    /// The changed file name does not start with a numeric version.
    #[error("cannot parse migration version from {file}: {source}")]
    InvalidVersion {
        /// Base name of the file.
        file: String,
        /// The underlying parse error.
        source: ParseIntError,
    },

    /// A previous migration failed halfway and left the schema dirty.
    #[error("database is dirty at migration version {version}")]
    Dirty {
        /// The version marked as failed.
        version: i64,
    },

    /// The version table exists but no application tables were created.
    #[error(
        "alembic_version exists (versions: {versions:?}) but no application tables were created \
         after waiting {waited:?}; a transaction was likely never committed"
    )]
    UncommittedTransaction {
        /// Versions recorded in `alembic_version`.
        versions: Vec<String>,
        /// Total time spent waiting for tables.
        waited: Duration,
    },

    /// No application tables appeared after applying migrations.
    #[error(
        "no tables found after {attempts} attempts (waited {waited:?}){}",
        last_error_suffix(.last_error.as_deref())
    )]
    NoTables {
        /// Number of checks made.
        attempts: u32,
        /// Total time spent waiting.
        waited: Duration,
        /// The last connection or query error, if any.
        last_error: Option<String>,
    },

    /// The sqlx migrator failed.
    #[error("migration failed: {0}")]
    Migrate(MigrateError),

    /// A database query failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The database could not be reached.
    #[error("cannot connect for migrations: {0}")]
    Connect(#[from] DbError),

    /// The helper container could not be driven.
    #[error("helper container error: {0}")]
    Container(#[from] ContainerError),

    /// A migration tool reported failure.
    #[error("{command} failed: {message}")]
    Tool {
        /// The tool invocation.
        command: String,
        /// What went wrong.
        message: String,
    },

    /// The settings name a migration format that is not supported.
    #[error("unsupported migration format: {0}")]
    UnsupportedFormat(String),

    /// `apply` or `update` was called before `init`.
    #[error("migration manager used before init")]
    NotInitialized,
}

fn last_error_suffix(last_error: Option<&str>) -> String {
    last_error.map_or_else(String::new, |e| format!(": {e}"))
}

impl From<MigrateError> for MigrationError {
    fn from(err: MigrateError) -> Self {
        match err {
            MigrateError::Dirty(version) => Self::Dirty { version },
            MigrateError::Execute(sqlx_err) => Self::Database(sqlx_err),
            other => Self::Migrate(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// The migration backend of a service.
///
/// `R` is the runtime of the database container; the alembic helper runs
/// as its sibling.
#[derive(Debug)]
pub enum MigrationManager<R: ContainerRuntime> {
    /// sqlx migrations run in-process.
    Embedded(EmbeddedMigrator),
    /// alembic run in a helper container.
    Containerized(ContainerizedMigrator<R>),
}

impl<R: ContainerRuntime> MigrationManager<R> {
    /// Build the backend for `format`. `runtime` is only kept by the alembic
    /// backend, which derives its helper container from it.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError::Container`] if the helper image override
    /// cannot be parsed.
    pub fn new(
        format: MigrationFormat,
        config: MigrationConfig,
        runtime: R,
    ) -> Result<Self, MigrationError> {
        match format {
            MigrationFormat::Sqlx => Ok(Self::Embedded(EmbeddedMigrator::new(config))),
            MigrationFormat::Alembic => Ok(Self::Containerized(ContainerizedMigrator::new(
                config, runtime,
            )?)),
        }
    }

    /// Human-readable name for logging.
    pub const fn name(&self) -> &str {
        match self {
            Self::Embedded(_) => "sqlx",
            Self::Containerized(_) => "alembic",
        }
    }

    /// Record the connection strings from the exported configurations.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError::MissingScope`] if the container or native
    /// configuration is absent.
    pub fn init(
        &mut self,
        configurations: &[ConnectionConfiguration],
    ) -> Result<(), MigrationError> {
        let connections = Connections::extract(configurations)?;
        match self {
            Self::Embedded(m) => m.init(connections),
            Self::Containerized(m) => m.init(connections),
        }
        Ok(())
    }

    /// Apply every pending migration.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError`] if a migration fails or the schema is dirty.
    pub async fn apply(&self) -> Result<(), MigrationError> {
        match self {
            Self::Embedded(m) => m.apply().await,
            Self::Containerized(m) => m.apply().await,
        }
    }

    /// Re-apply the migration defined by `changed_file`.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError`] if the version cannot be determined or the
    /// migration tool fails.
    pub async fn update(&self, changed_file: &Path) -> Result<(), MigrationError> {
        match self {
            Self::Embedded(m) => m.update(changed_file).await,
            Self::Containerized(m) => m.update(changed_file).await,
        }
    }
}

/// Connection strings a migrator works with.
#[derive(Clone, PartialEq, Eq)]
pub(crate) struct Connections {
    /// Reachable from inside other containers.
    pub(crate) container: String,
    /// Reachable from the host.
    pub(crate) native: String,
}

impl fmt::Debug for Connections {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connections").finish_non_exhaustive()
    }
}

impl Connections {
    /// Pull the container and native connection strings out of the bundles.
    pub(crate) fn extract(
        configurations: &[ConnectionConfiguration],
    ) -> Result<Self, MigrationError> {
        let lookup = |scope: Scope| {
            ConnectionConfiguration::find(configurations, scope)
                .and_then(ConnectionConfiguration::connection)
                .map(str::to_owned)
                .ok_or(MigrationError::MissingScope { scope })
        };
        Ok(Self {
            container: lookup(Scope::Container)?,
            native: lookup(Scope::Native)?,
        })
    }
}

/// Version prefix of a migration file: `42_add_users.sql` -> `42`.
///
/// # Errors
///
/// Returns [`MigrationError::InvalidVersion`] if the prefix is not an integer.
pub fn parse_version(path: &Path) -> Result<i64, MigrationError> {
    let file = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let prefix = file.split('_').next().unwrap_or_default();
    prefix
        .parse::<i64>()
        .map_err(|source| MigrationError::InvalidVersion { file: file.clone(), source })
}
