//! Error types for the lifecycle layer.

use std::path::PathBuf;

use pgdev_container::ContainerError;
use pgdev_db::{DbError, MigrationError};
use pgdev_types::Scope;

use crate::config::ConfigError;
use crate::lifecycle::LifecycleState;

/// Errors returned by the lifecycle verbs.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    /// The service settings are invalid.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The verb is not allowed in the current state.
    #[error("cannot {operation} a service in state {state}")]
    InvalidTransition {
        /// The rejected verb.
        operation: &'static str,
        /// State the service was in.
        state: LifecycleState,
    },

    /// No network instance was provided for a required scope.
    #[error("no network instance for scope {scope}")]
    MissingScope {
        /// The missing scope.
        scope: Scope,
    },

    /// Credentials, readiness or connection failure.
    #[error(transparent)]
    Db(#[from] DbError),

    /// The container runtime failed.
    #[error("container error: {0}")]
    Container(#[from] ContainerError),

    /// Migrations failed.
    #[error("migration error: {0}")]
    Migration(#[from] MigrationError),

    /// The migration worker exited before answering.
    #[error("migration worker stopped")]
    WorkerStopped,

    /// A filesystem operation failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// Path involved.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },
}
