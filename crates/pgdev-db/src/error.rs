//! Error types for the database layer.
//!
//! Connection, credential and readiness failures are reported through
//! [`DbError`]. Migration failures have their own taxonomy in
//! [`MigrationError`](crate::migrations::MigrationError).

/// Errors that can occur while connecting to or probing the database.
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// A `PostgreSQL` operation failed.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] sqlx::Error),

    /// A credential could not be read from the credential store.
    #[error("missing credential {provider}/{key} for {scope}")]
    Credentials {
        /// Scope the credential was looked up in.
        scope: String,
        /// Provider name (e.g. `postgres`).
        provider: String,
        /// Credential key (e.g. `POSTGRES_USER`).
        key: String,
    },

    /// The database did not answer within the readiness budget.
    #[error("database not ready after {attempts} attempts: {last_error}")]
    NotReady {
        /// Number of attempts made.
        attempts: u32,
        /// The error returned by the final attempt.
        last_error: String,
    },

    /// A single readiness attempt exceeded its timeout.
    #[error("readiness check timed out")]
    AttemptTimeout,

    /// A configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}
