//! Container specification: what to run and how to wire it to the host.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ContainerError;

/// Tag used when an image reference carries none.
const DEFAULT_TAG: &str = "latest";

/// A docker image reference, `name[:tag]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRef {
    /// Repository name, including any registry prefix.
    pub name: String,
    /// Image tag.
    pub tag: String,
}

impl ImageRef {
    /// Create a reference from a name and tag.
    pub fn new(name: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tag: tag.into(),
        }
    }

    /// Parse `name[:tag]`, defaulting the tag to `latest`.
    ///
    /// A colon that belongs to a registry port (`host:5000/name`) is not
    /// mistaken for a tag separator.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerError::InvalidImage`] for empty references or
    /// references containing whitespace.
    pub fn parse(raw: &str) -> Result<Self, ContainerError> {
        let raw = raw.trim();
        if raw.is_empty() || raw.chars().any(char::is_whitespace) {
            return Err(ContainerError::InvalidImage(raw.to_owned()));
        }
        let (name, tag) = match raw.rsplit_once(':') {
            Some((name, tag)) if !tag.contains('/') => (name, tag),
            _ => (raw, DEFAULT_TAG),
        };
        if name.is_empty() || tag.is_empty() {
            return Err(ContainerError::InvalidImage(raw.to_owned()));
        }
        Ok(Self::new(name, tag))
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

impl FromStr for ImageRef {
    type Err = ContainerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// A host port published to a container port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    /// Port on the host.
    pub host: u16,
    /// Port inside the container.
    pub container: u16,
}

/// A host directory bind-mounted into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    /// Source directory on the host.
    pub host: PathBuf,
    /// Target path inside the container.
    pub container: String,
}

/// Everything needed to create a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Image to run.
    pub image: ImageRef,
    /// Published ports.
    pub ports: Vec<PortMapping>,
    /// Environment variables, in insertion order.
    pub env: Vec<(String, String)>,
    /// Bind mounts.
    pub mounts: Vec<Mount>,
    /// Working directory inside the container.
    pub workdir: Option<String>,
    /// Replace the image entrypoint with an idle process so commands can be
    /// executed into the container one at a time.
    pub keep_alive: bool,
    /// Extra `/etc/hosts` entries (`name:address`).
    pub extra_hosts: Vec<String>,
}

impl ContainerSpec {
    /// Create a spec for `image` with nothing attached.
    pub const fn new(image: ImageRef) -> Self {
        Self {
            image,
            ports: Vec::new(),
            env: Vec::new(),
            mounts: Vec::new(),
            workdir: None,
            keep_alive: false,
            extra_hosts: Vec::new(),
        }
    }

    /// Publish `host` on the container's `container` port.
    #[must_use]
    pub fn with_port(mut self, host: u16, container: u16) -> Self {
        self.ports.push(PortMapping { host, container });
        self
    }

    /// Add an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Bind-mount a host directory.
    #[must_use]
    pub fn with_mount(mut self, host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        self.mounts.push(Mount {
            host: host.into(),
            container: container.into(),
        });
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn with_workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    /// Keep the container idle after start instead of running the image
    /// entrypoint.
    #[must_use]
    pub const fn keep_alive(mut self) -> Self {
        self.keep_alive = true;
        self
    }

    /// Make the host reachable from the container as `host.docker.internal`.
    #[must_use]
    pub fn with_host_gateway(mut self) -> Self {
        self.extra_hosts
            .push(String::from("host.docker.internal:host-gateway"));
        self
    }
}
