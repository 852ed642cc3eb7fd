//! Container runtime layer for pgdev.
//!
//! The database and the migration helper both run as containers. This crate
//! defines the contract the rest of the workspace relies on
//! ([`ContainerRuntime`]) and a docker CLI implementation of it
//! ([`DockerRunner`]).
//!
//! # Modules
//!
//! - [`spec`] -- Image references and the container specification
//!   (ports, mounts, environment)
//! - [`runtime`] -- The [`ContainerRuntime`] trait and process output
//! - [`docker`] -- [`DockerRunner`], driving the `docker` binary through
//!   `tokio::process`
//! - [`error`] -- Shared error types

pub mod docker;
pub mod error;
pub mod runtime;
pub mod spec;

pub use docker::DockerRunner;
pub use error::ContainerError;
pub use runtime::{ContainerRuntime, ProcessOutput};
pub use spec::{ContainerSpec, ImageRef, Mount, PortMapping};
