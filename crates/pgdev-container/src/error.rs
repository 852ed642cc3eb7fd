//! Error types for the container layer.

/// Errors raised while driving a container runtime.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    /// The runtime binary could not be spawned.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A runtime command exited unsuccessfully.
    #[error("`{command}` exited with {status}: {stderr}")]
    CommandFailed {
        /// The command line that was run.
        command: String,
        /// Exit status description.
        status: String,
        /// Captured standard error (trimmed).
        stderr: String,
    },

    /// The named container does not exist.
    #[error("container not found: {name}")]
    NotFound {
        /// Container name.
        name: String,
    },

    /// An operation needing a configured container was called before `init`.
    #[error("container {name} has not been initialized")]
    NotInitialized {
        /// Container name.
        name: String,
    },

    /// An image reference could not be parsed.
    #[error("invalid image reference: {0}")]
    InvalidImage(String),
}

impl ContainerError {
    /// Whether the error means the container simply does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::CommandFailed { stderr, .. } => stderr.contains("No such container"),
            _ => false,
        }
    }
}
