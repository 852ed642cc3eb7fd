//! The migration worker.
//!
//! A single task owns the [`MigrationManager`] and runs every migration call
//! in arrival order, so a file-change update can never race the initial
//! apply. Because the work happens on that task, a caller that stops waiting
//! does not abort a migration halfway.

use std::path::PathBuf;

use pgdev_container::ContainerRuntime;
use pgdev_db::{MigrationError, MigrationManager};
use pgdev_types::ConnectionConfiguration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::LifecycleError;

/// Capacity of the command queue.
const QUEUE_DEPTH: usize = 32;

/// A request to the worker.
#[derive(Debug)]
enum Command {
    Init {
        configurations: Vec<ConnectionConfiguration>,
        respond_to: oneshot::Sender<Result<(), MigrationError>>,
    },
    Apply {
        respond_to: oneshot::Sender<Result<(), MigrationError>>,
    },
    Update {
        file: PathBuf,
    },
}

/// Cloneable handle for submitting work to the worker.
#[derive(Debug, Clone)]
pub struct MigrationClient {
    tx: mpsc::Sender<Command>,
}

impl MigrationClient {
    /// Hand the exported connection configurations to the manager.
    ///
    /// # Errors
    ///
    /// Returns the manager's error, or [`LifecycleError::WorkerStopped`] if
    /// the worker is gone.
    pub async fn init(
        &self,
        configurations: Vec<ConnectionConfiguration>,
    ) -> Result<(), LifecycleError> {
        let (respond_to, rx) = oneshot::channel();
        self.send(Command::Init {
            configurations,
            respond_to,
        })
        .await?;
        Ok(rx.await.map_err(|_closed| LifecycleError::WorkerStopped)??)
    }

    /// Apply pending migrations and wait for the outcome.
    ///
    /// # Errors
    ///
    /// Returns the manager's error, or [`LifecycleError::WorkerStopped`] if
    /// the worker is gone.
    pub async fn apply(&self) -> Result<(), LifecycleError> {
        let (respond_to, rx) = oneshot::channel();
        self.send(Command::Apply { respond_to }).await?;
        Ok(rx.await.map_err(|_closed| LifecycleError::WorkerStopped)??)
    }

    /// Queue a re-application of the migration in `file`.
    ///
    /// Returns once the request is queued. Failures are logged by the worker.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::WorkerStopped`] if the worker is gone.
    pub async fn update(&self, file: PathBuf) -> Result<(), LifecycleError> {
        self.send(Command::Update { file }).await
    }

    async fn send(&self, command: Command) -> Result<(), LifecycleError> {
        self.tx
            .send(command)
            .await
            .map_err(|_closed| LifecycleError::WorkerStopped)
    }
}

/// The task owning the migration manager.
#[derive(Debug)]
pub struct MigrationWorker<R: ContainerRuntime> {
    client: MigrationClient,
    task: JoinHandle<MigrationManager<R>>,
}

impl<R: ContainerRuntime + 'static> MigrationWorker<R> {
    /// Spawn a worker owning `manager`.
    pub fn spawn(manager: MigrationManager<R>) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let task = tokio::spawn(run(manager, rx));
        Self {
            client: MigrationClient { tx },
            task,
        }
    }

    /// Handle for submitting work.
    pub fn client(&self) -> MigrationClient {
        self.client.clone()
    }

    /// Stop accepting work, let queued work finish and hand the manager
    /// back.
    ///
    /// The worker only exits once every [`MigrationClient`] clone is dropped.
    ///
    /// Returns `None` if the worker task panicked or was cancelled.
    pub async fn shutdown(self) -> Option<MigrationManager<R>> {
        drop(self.client);
        match self.task.await {
            Ok(manager) => Some(manager),
            Err(e) => {
                warn!(error = %e, "migration worker did not exit cleanly");
                None
            }
        }
    }
}

async fn run<R: ContainerRuntime>(
    mut manager: MigrationManager<R>,
    mut rx: mpsc::Receiver<Command>,
) -> MigrationManager<R> {
    debug!(backend = manager.name(), "migration worker started");
    while let Some(command) = rx.recv().await {
        match command {
            Command::Init {
                configurations,
                respond_to,
            } => {
                let result = manager.init(&configurations);
                if respond_to.send(result).is_err() {
                    debug!("init caller went away");
                }
            }
            Command::Apply { respond_to } => {
                let result = manager.apply().await;
                if let Err(e) = &result {
                    warn!(backend = manager.name(), error = %e, "applying migrations failed");
                }
                if respond_to.send(result).is_err() {
                    debug!("apply caller went away");
                }
            }
            Command::Update { file } => match manager.update(&file).await {
                Ok(()) => info!(file = %file.display(), "migration updated"),
                Err(e) => warn!(file = %file.display(), error = %e, "migration update failed"),
            },
        }
    }
    debug!("migration worker stopped");
    manager
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::path::Path;

    use pgdev_container::DockerRunner;
    use pgdev_db::{MigrationConfig, MigrationFormat};
    use pgdev_types::Scope;

    use super::*;

    fn manager(dir: &Path) -> MigrationManager<DockerRunner> {
        MigrationManager::new(
            MigrationFormat::Sqlx,
            MigrationConfig::new("db", dir, "helper"),
            DockerRunner::new("helper"),
        )
        .unwrap()
    }

    fn configurations() -> Vec<ConnectionConfiguration> {
        vec![
            ConnectionConfiguration::new("m/s", Scope::Native, "postgresql://u:p@localhost:1/db"),
            ConnectionConfiguration::new(
                "m/s",
                Scope::Container,
                "postgresql://u:p@host.docker.internal:1/db",
            ),
        ]
    }

    #[tokio::test]
    async fn init_and_apply_round_trip_through_the_worker() {
        let worker = MigrationWorker::spawn(manager(Path::new("/no/migrations/here")));
        let client = worker.client();
        client.init(configurations()).await.unwrap();
        client.apply().await.unwrap();
        drop(client);
        assert!(worker.shutdown().await.is_some());
    }

    #[tokio::test]
    async fn init_errors_are_returned_to_the_caller() {
        let worker = MigrationWorker::spawn(manager(Path::new("/no/migrations/here")));
        let err = worker.client().init(Vec::new()).await.unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::Migration(MigrationError::MissingScope { .. })
        ));
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn update_failures_do_not_stop_the_worker() {
        let dir = tempfile::tempdir().unwrap();
        let worker = MigrationWorker::spawn(manager(dir.path()));
        let client = worker.client();
        client.init(configurations()).await.unwrap();

        // Unversioned file name: logged and dropped.
        client.update(dir.path().join("notes.txt")).await.unwrap();
        // Still serving requests afterwards.
        client.init(configurations()).await.unwrap();
        drop(client);
        worker.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_waits_for_outstanding_clients() {
        let worker = MigrationWorker::spawn(manager(Path::new("/nowhere")));
        let client = worker.client();
        let stopper = tokio::spawn(worker.shutdown());
        // The worker waits for this clone, so queueing still works.
        client.update(PathBuf::from("1_x.sql")).await.unwrap();
        drop(client);
        assert!(stopper.await.unwrap().is_some());
    }
}
