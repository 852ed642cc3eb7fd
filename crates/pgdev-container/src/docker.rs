//! Docker CLI implementation of [`ContainerRuntime`].
//!
//! Every operation shells out to the `docker` binary through
//! [`tokio::process::Command`]. Child output is streamed line by line into
//! `tracing` at debug level (unless the runner is silenced) and captured in
//! the returned [`ProcessOutput`].
//!
//! Environment variable values are handed to the docker process through its
//! own environment and referenced by name on the command line (`-e KEY`),
//! so secrets never appear in the process arguments.

use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::ContainerError;
use crate::runtime::{ContainerRuntime, ProcessOutput};
use crate::spec::ContainerSpec;

/// Default name of the docker binary.
const DEFAULT_BINARY: &str = "docker";

/// Drives one named container through the docker CLI.
#[derive(Debug, Clone)]
pub struct DockerRunner {
    /// Container name.
    name: String,
    /// Docker binary to invoke.
    binary: String,
    /// Whether child output is kept out of the logs.
    silent: bool,
    /// Spec of the created container, set by `init`.
    spec: Option<ContainerSpec>,
}

impl DockerRunner {
    /// Create a runner for the container called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            binary: DEFAULT_BINARY.to_owned(),
            silent: false,
            spec: None,
        }
    }

    /// Use a different docker-compatible binary (e.g. `podman`).
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Keep container output out of the logs.
    #[must_use]
    pub const fn silence(mut self) -> Self {
        self.silent = true;
        self
    }

    /// Whether the container exists and is running.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerError`] if docker cannot be invoked.
    pub async fn is_running(&self) -> Result<bool, ContainerError> {
        let args = vec![
            String::from("inspect"),
            String::from("--format"),
            String::from("{{.State.Running}}"),
            self.name.clone(),
        ];
        match self.run(&args, &[]).await {
            Ok(output) => Ok(output.stdout_text().trim() == "true"),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Run the docker binary with `args`, exporting `env` to it.
    async fn run(
        &self,
        args: &[String],
        env: &[(String, String)],
    ) -> Result<ProcessOutput, ContainerError> {
        let command = describe(&self.binary, args);
        let mut child = Command::new(&self.binary)
            .args(args)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ContainerError::Spawn {
                program: self.binary.clone(),
                source,
            })?;

        let (stdout, stderr) = tokio::join!(
            forward_lines(child.stdout.take(), &self.name, self.silent),
            forward_lines(child.stderr.take(), &self.name, self.silent),
        );

        let status = child.wait().await.map_err(|source| ContainerError::Spawn {
            program: self.binary.clone(),
            source,
        })?;

        if status.success() {
            Ok(ProcessOutput { stdout, stderr })
        } else {
            Err(ContainerError::CommandFailed {
                command,
                status: status.to_string(),
                stderr: stderr.join("\n").trim().to_owned(),
            })
        }
    }
}

impl ContainerRuntime for DockerRunner {
    fn name(&self) -> &str {
        &self.name
    }

    fn sibling(&self, name: &str) -> Self {
        Self {
            name: name.to_owned(),
            binary: self.binary.clone(),
            silent: self.silent,
            spec: None,
        }
    }

    async fn init(&mut self, spec: &ContainerSpec) -> Result<(), ContainerError> {
        // A container left over from a crashed run would make `create` fail.
        self.shutdown().await?;

        let args = create_args(&self.name, spec);
        self.run(&args, &spec.env).await?;
        info!(container = %self.name, image = %spec.image, "container created");
        self.spec = Some(spec.clone());
        Ok(())
    }

    async fn start(&mut self) -> Result<(), ContainerError> {
        if self.spec.is_none() {
            return Err(ContainerError::NotInitialized {
                name: self.name.clone(),
            });
        }
        let args = vec![String::from("start"), self.name.clone()];
        self.run(&args, &[]).await?;
        info!(container = %self.name, "container started");
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), ContainerError> {
        let args = vec![String::from("stop"), self.name.clone()];
        match self.run(&args, &[]).await {
            Ok(_) => {
                info!(container = %self.name, "container stopped");
                Ok(())
            }
            Err(e) if e.is_not_found() => Err(ContainerError::NotFound {
                name: self.name.clone(),
            }),
            Err(e) => Err(e),
        }
    }

    async fn shutdown(&mut self) -> Result<(), ContainerError> {
        let args = vec![String::from("rm"), String::from("--force"), self.name.clone()];
        match self.run(&args, &[]).await {
            Ok(_) => {
                debug!(container = %self.name, "container removed");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(container = %self.name, "no container to remove");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn exec(&self, program: &str, args: &[&str]) -> Result<ProcessOutput, ContainerError> {
        let mut full = Vec::with_capacity(args.len().saturating_add(3));
        full.push(String::from("exec"));
        full.push(self.name.clone());
        full.push(program.to_owned());
        full.extend(args.iter().map(|a| (*a).to_owned()));
        debug!(container = %self.name, program, "exec");
        self.run(&full, &[]).await
    }
}

/// Build the `docker create` argument list for `spec`.
///
/// Environment variables are passed by name only; their values must be
/// exported to the docker process itself.
pub fn create_args(name: &str, spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![String::from("create"), String::from("--name"), name.to_owned()];
    for port in &spec.ports {
        args.push(String::from("--publish"));
        args.push(format!("{}:{}", port.host, port.container));
    }
    for (key, _) in &spec.env {
        args.push(String::from("--env"));
        args.push(key.clone());
    }
    for mount in &spec.mounts {
        args.push(String::from("--volume"));
        args.push(format!("{}:{}", mount.host.display(), mount.container));
    }
    for host in &spec.extra_hosts {
        args.push(String::from("--add-host"));
        args.push(host.clone());
    }
    if let Some(workdir) = &spec.workdir {
        args.push(String::from("--workdir"));
        args.push(workdir.clone());
    }
    if spec.keep_alive {
        args.push(String::from("--entrypoint"));
        args.push(String::from("sleep"));
    }
    args.push(spec.image.to_string());
    if spec.keep_alive {
        args.push(String::from("infinity"));
    }
    args
}

/// Short command description for error messages: binary and subcommand.
fn describe(binary: &str, args: &[String]) -> String {
    match args.first() {
        Some(sub) => format!("{binary} {sub}"),
        None => binary.to_owned(),
    }
}

/// Read `reader` to the end, logging and collecting each line.
async fn forward_lines<R>(reader: Option<R>, container: &str, silent: bool) -> Vec<String>
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return Vec::new();
    };
    let mut lines = BufReader::new(reader).lines();
    let mut collected = Vec::new();
    while let Ok(Some(line)) = lines.next_line().await {
        if !silent {
            debug!(container, "{line}");
        }
        collected.push(line);
    }
    collected
}
