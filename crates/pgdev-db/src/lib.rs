//! Database layer for pgdev.
//!
//! Everything that talks to `PostgreSQL` itself lives here: building
//! connection strings for each network scope, waiting for a freshly started
//! container to accept queries, and bringing the schema up to date through
//! one of two migration backends.
//!
//! # Flow
//!
//! ```text
//! Credentials + NetworkInstance
//!     |
//!     +-- connection::resolve --------> ConnectionConfiguration (per scope)
//!     |
//!     +-- readiness::wait_for_ready --> SELECT 1 until it answers
//!     |
//!     +-- MigrationManager
//!         |-- Embedded       (sqlx migrator, native scope)
//!         +-- Containerized  (alembic in a helper container, container scope)
//! ```
//!
//! # Modules
//!
//! - [`connection`] -- Connection strings and credential lookup
//! - [`postgres`] -- Short-lived single-connection sessions
//! - [`readiness`] -- Bounded readiness polling
//! - [`migrations`] -- The migration manager and its two backends
//! - [`error`] -- Shared error types

pub mod connection;
pub mod error;
pub mod migrations;
pub mod postgres;
pub mod readiness;

pub use connection::{
    CredentialStore, EnvCredentialStore, StaticCredentialStore, create_connection_configuration,
    resolve,
};
pub use error::DbError;
pub use migrations::{
    ContainerizedMigrator, EmbeddedMigrator, MigrationConfig, MigrationError, MigrationFormat,
    MigrationManager, TableCheckPolicy, parse_version,
};
pub use postgres::{PostgresConfig, PostgresPool};
pub use readiness::{ReadinessPolicy, wait_for_ready};
