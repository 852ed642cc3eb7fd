//! The container runtime contract.
//!
//! The lifecycle and the migration helper only ever talk to containers
//! through [`ContainerRuntime`], so tests can substitute an in-memory fake
//! for the docker CLI.

use std::future::Future;

use crate::error::ContainerError;
use crate::spec::ContainerSpec;

/// Captured result of a command executed inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Lines written to standard output.
    pub stdout: Vec<String>,
    /// Lines written to standard error.
    pub stderr: Vec<String>,
}

impl ProcessOutput {
    /// Standard output joined with newlines.
    pub fn stdout_text(&self) -> String {
        self.stdout.join("\n")
    }
}

/// A single named container managed through some runtime.
///
/// One value drives one container. The name is fixed at construction so it
/// can be derived deterministically from the owning service.
pub trait ContainerRuntime: Send + Sync + Sized {
    /// Name of the container this runtime drives.
    fn name(&self) -> &str;

    /// A runtime of the same kind and settings driving the container called
    /// `name`.
    #[must_use]
    fn sibling(&self, name: &str) -> Self;

    /// Create (but do not start) the container from `spec`, replacing any
    /// stale container with the same name.
    fn init(
        &mut self,
        spec: &ContainerSpec,
    ) -> impl Future<Output = Result<(), ContainerError>> + Send;

    /// Start the created container.
    fn start(&mut self) -> impl Future<Output = Result<(), ContainerError>> + Send;

    /// Stop the container, keeping it and its filesystem.
    fn stop(&mut self) -> impl Future<Output = Result<(), ContainerError>> + Send;

    /// Remove the container, running or not.
    ///
    /// Must succeed when the container does not exist.
    fn shutdown(&mut self) -> impl Future<Output = Result<(), ContainerError>> + Send;

    /// Run `program` with `args` inside the running container and wait for
    /// it to finish.
    fn exec(
        &self,
        program: &str,
        args: &[&str],
    ) -> impl Future<Output = Result<ProcessOutput, ContainerError>> + Send;
}
