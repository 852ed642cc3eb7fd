//! Service lifecycle for pgdev.
//!
//! Ties the container runtime and the database layer together into the
//! verbs a developer tool drives: `load`, `init`, `start`, `stop` and
//! `destroy`.
//!
//! # Modules
//!
//! - [`config`] -- `service.pgdev.yaml` settings and environment overrides
//! - [`network`] -- Mapping a published port onto per-scope addresses
//! - [`lifecycle`] -- The [`ServiceLifecycle`] state machine
//! - [`worker`] -- The task that owns the migration manager
//! - [`watcher`] -- Polling change watcher for the migration directory
//! - [`error`] -- Shared error types

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod network;
pub mod watcher;
pub mod worker;

pub use config::{ConfigError, ServiceSettings};
pub use error::LifecycleError;
pub use lifecycle::{LifecycleOptions, LifecycleState, ServiceLifecycle, ServiceStatus};
pub use network::NetworkMapper;
pub use watcher::{ChangeEvent, ChangeWatcher, WatchPolicy, is_migration_change};
pub use worker::{MigrationClient, MigrationWorker};
