//! alembic run inside a helper container.
//!
//! The helper mounts the alembic project at `/workspace`, idles, and has
//! each step `exec`ed into it. It reaches the database through the
//! container-scope connection string exported as `DATABASE_URL`. Whether the
//! upgrade actually produced tables is verified from the host over the
//! native connection.
//!
//! After `upgrade head` the helper commits and terminates any session left
//! idle in a transaction. alembic's own transaction handling normally makes
//! this unnecessary; it is a heuristic for projects whose `env.py` forgets to
//! commit.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use backon::{ConstantBuilder, Retryable};
use pgdev_container::{ContainerRuntime, ContainerSpec, ImageRef};
use tracing::{debug, info, warn};

use super::{Connections, MigrationConfig, MigrationError};
use crate::postgres::PostgresPool;

/// Default helper image.
const DEFAULT_IMAGE: &str = "codeflydev/alembic";

/// Default helper image tag.
const DEFAULT_TAG: &str = "latest";

/// Mount point of the alembic project inside the helper.
const WORKSPACE: &str = "/workspace";

/// Mount point of the version directory override.
const VERSIONS_DIR: &str = "/workspace/versions";

/// alembic configuration file inside the helper.
const ALEMBIC_INI: &str = "/workspace/alembic.ini";

/// Runs `psql` against `$DATABASE_URL` with the query passed as `$1`.
const PSQL_SCRIPT: &str = r#"psql "$DATABASE_URL" -c "$1""#;

/// Queries run after an upgrade to flush stuck transactions.
const CLEANUP_QUERIES: [&str; 3] = [
    "SELECT pid, state, query, xact_start, now() - xact_start AS duration \
     FROM pg_stat_activity WHERE state LIKE '%transaction%';",
    "COMMIT;",
    "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
     WHERE state = 'idle in transaction' AND pid <> pg_backend_pid();",
];

/// Application tables in the public schema.
const TABLES_QUERY: &str = r"
    SELECT tablename::text
    FROM pg_catalog.pg_tables
    WHERE schemaname = 'public'
      AND tablename NOT LIKE 'pg\_%'
      AND tablename NOT LIKE 'sql\_%'
      AND tablename <> 'alembic_version'
    ORDER BY tablename
";

const VERSION_TABLE_QUERY: &str = r"
    SELECT EXISTS (
        SELECT 1 FROM pg_catalog.pg_tables
        WHERE schemaname = 'public' AND tablename = 'alembic_version'
    )
";

const VERSIONS_QUERY: &str = "SELECT version_num::text FROM alembic_version";

/// How long to wait for application tables after an upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableCheckPolicy {
    /// Number of checks, including the first.
    pub max_attempts: u32,
    /// Delay between checks.
    pub interval: Duration,
}

impl Default for TableCheckPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 12,
            interval: Duration::from_secs(5),
        }
    }
}

impl TableCheckPolicy {
    /// Total wait reported in errors.
    pub const fn waited(&self) -> Duration {
        self.interval.saturating_mul(self.max_attempts)
    }

    fn retries(&self) -> usize {
        usize::try_from(self.max_attempts.saturating_sub(1)).unwrap_or(usize::MAX)
    }
}

/// Runs alembic in a helper container.
///
/// The helper is driven by a sibling of `runtime`, so it runs under the same
/// runtime binary and settings as the database container.
#[derive(Debug)]
pub struct ContainerizedMigrator<R: ContainerRuntime> {
    config: MigrationConfig,
    image: ImageRef,
    table_check: TableCheckPolicy,
    runtime: R,
    connections: Option<Connections>,
}

impl<R: ContainerRuntime> ContainerizedMigrator<R> {
    /// Create a migrator for `config` whose helper is a sibling of
    /// `runtime`. Call `init` before use.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError::Container`] if the image override is not a
    /// valid image reference.
    pub fn new(config: MigrationConfig, runtime: R) -> Result<Self, MigrationError> {
        let image = config
            .image_override
            .as_deref()
            .map_or_else(|| Ok(ImageRef::new(DEFAULT_IMAGE, DEFAULT_TAG)), ImageRef::parse)?;
        Ok(Self {
            config,
            image,
            table_check: TableCheckPolicy::default(),
            runtime,
            connections: None,
        })
    }

    /// Override the table check budget.
    #[must_use]
    pub const fn with_table_check(mut self, policy: TableCheckPolicy) -> Self {
        self.table_check = policy;
        self
    }

    pub(crate) fn init(&mut self, connections: Connections) {
        self.connections = Some(connections);
    }

    /// `upgrade head`, then check that the schema has tables.
    pub(crate) async fn apply(&self) -> Result<(), MigrationError> {
        if !self.config.has_migrations() {
            debug!(dir = %self.config.migration_dir.display(), "no migration directory, skipping");
            return Ok(());
        }
        let connections = self
            .connections
            .as_ref()
            .ok_or(MigrationError::NotInitialized)?;

        let mut helper = self.start_helper(connections).await?;
        let result = self.upgrade(&helper, connections).await;
        remove_helper(&mut helper).await;
        result
    }

    /// Step the latest revision down and up again.
    pub(crate) async fn update(&self, changed_file: &Path) -> Result<(), MigrationError> {
        if !self.config.has_migrations() {
            debug!(dir = %self.config.migration_dir.display(), "no migration directory, skipping");
            return Ok(());
        }
        let connections = self
            .connections
            .as_ref()
            .ok_or(MigrationError::NotInitialized)?;
        info!(file = %changed_file.display(), "re-applying alembic revision");

        let mut helper = self.start_helper(connections).await?;
        let result = async {
            alembic(&helper, &["downgrade", "-1"]).await?;
            alembic(&helper, &["upgrade", "+1"]).await
        }
        .await;
        remove_helper(&mut helper).await;
        result?;
        info!("alembic revision re-applied");
        Ok(())
    }

    /// Container spec of the helper.
    pub fn helper_spec(&self, database_url: &str) -> ContainerSpec {
        let mut spec = ContainerSpec::new(self.image.clone())
            .with_mount(absolute(&self.config.migration_dir), WORKSPACE);
        if let Some(versions) = &self.config.version_dir_override {
            spec = spec.with_mount(absolute(versions), VERSIONS_DIR);
        }
        spec.with_workdir(WORKSPACE)
            .keep_alive()
            .with_env("DATABASE_URL", database_url)
            .with_host_gateway()
    }

    async fn start_helper(&self, connections: &Connections) -> Result<R, MigrationError> {
        self.log_directory();
        let mut helper = self.runtime.sibling(&self.config.helper_container);
        let spec = self.helper_spec(&connections.container);
        helper.init(&spec).await?;
        if let Err(e) = helper.start().await {
            remove_helper(&mut helper).await;
            return Err(e.into());
        }
        Ok(helper)
    }

    fn log_directory(&self) {
        let dir = &self.config.migration_dir;
        match std::fs::read_dir(dir) {
            Ok(entries) => {
                let mut files: Vec<String> = entries
                    .filter_map(Result::ok)
                    .map(|entry| entry.file_name().to_string_lossy().into_owned())
                    .collect();
                files.sort();
                debug!(dir = %dir.display(), ?files, "migration directory contents");
            }
            Err(e) => warn!(dir = %dir.display(), error = %e, "cannot read migration directory"),
        }
    }

    async fn upgrade(
        &self,
        helper: &R,
        connections: &Connections,
    ) -> Result<(), MigrationError> {
        log_current(helper, "before upgrade").await;
        alembic(helper, &["upgrade", "head"]).await?;
        cleanup_transactions(helper).await;
        log_current(helper, "after upgrade").await;

        match self.wait_for_tables(&connections.native).await {
            Ok(tables) => {
                info!(?tables, "tables in database");
                Ok(())
            }
            Err(last_error) => {
                let versions = recorded_versions(helper, &connections.native).await;
                Err(classify_empty_schema(
                    versions,
                    &self.table_check,
                    last_error,
                ))
            }
        }
    }

    /// Poll for application tables. On exhaustion returns the last
    /// connection or query error seen, if any.
    async fn wait_for_tables(&self, url: &str) -> Result<Vec<String>, Option<String>> {
        let last_error: Mutex<Option<String>> = Mutex::new(None);
        let last = &last_error;
        let backoff = ConstantBuilder::default()
            .with_delay(self.table_check.interval)
            .with_max_times(self.table_check.retries());

        let found = (move || async move {
            match list_tables(url).await {
                Ok(tables) if tables.is_empty() => Err(TableScan::Empty),
                Ok(tables) => Ok(tables),
                Err(e) => {
                    if let Ok(mut slot) = last.lock() {
                        *slot = Some(e.to_string());
                    }
                    Err(TableScan::Failed)
                }
            }
        })
        .retry(backoff)
        .sleep(tokio::time::sleep)
        .notify(|scan: &TableScan, delay: Duration| {
            debug!(?scan, retry_in_secs = delay.as_secs(), "no tables yet");
        })
        .await;

        found.map_err(|_scan| last_error.into_inner().ok().flatten())
    }
}

async fn remove_helper<R: ContainerRuntime>(helper: &mut R) {
    if let Err(e) = helper.shutdown().await {
        warn!(container = %helper.name(), error = %e, "cannot remove migration helper");
    }
}

/// When the version table exists, flush transactions once more and read the
/// versions it records.
async fn recorded_versions<R: ContainerRuntime>(helper: &R, url: &str) -> Option<Vec<String>> {
    let pool = connect(url).await.ok()?;
    let exists: bool = sqlx::query_scalar(VERSION_TABLE_QUERY)
        .fetch_one(pool.pool())
        .await
        .unwrap_or(false);
    if !exists {
        pool.close().await;
        return None;
    }
    debug!("alembic_version exists without application tables, flushing transactions");
    cleanup_transactions(helper).await;
    let versions: Vec<String> = sqlx::query_scalar(VERSIONS_QUERY)
        .fetch_all(pool.pool())
        .await
        .unwrap_or_default();
    pool.close().await;
    Some(versions)
}

/// Outcome of a single table check.
#[derive(Debug)]
enum TableScan {
    Empty,
    Failed,
}

/// Decide which error an empty schema maps to.
///
/// `versions` is `Some` when the `alembic_version` table exists.
fn classify_empty_schema(
    versions: Option<Vec<String>>,
    policy: &TableCheckPolicy,
    last_error: Option<String>,
) -> MigrationError {
    let waited = policy.waited();
    match versions {
        Some(versions) => {
            warn!(
                ?versions,
                ?waited,
                "migrations recorded but no tables created; uncommitted transaction suspected"
            );
            MigrationError::UncommittedTransaction { versions, waited }
        }
        None => MigrationError::NoTables {
            attempts: policy.max_attempts,
            waited,
            last_error,
        },
    }
}

async fn connect(url: &str) -> Result<PostgresPool, MigrationError> {
    Ok(PostgresPool::connect_url(url).await?)
}

async fn list_tables(url: &str) -> Result<Vec<String>, MigrationError> {
    let pool = connect(url).await?;
    let tables = sqlx::query_scalar(TABLES_QUERY).fetch_all(pool.pool()).await;
    pool.close().await;
    Ok(tables?)
}

/// Arguments of an alembic invocation.
fn alembic_args<'a>(args: &[&'a str]) -> Vec<&'a str> {
    let mut full = vec!["-c", ALEMBIC_INI];
    full.extend_from_slice(args);
    full
}

/// Run alembic in the helper. Failure is fatal.
async fn alembic<R: ContainerRuntime>(helper: &R, args: &[&str]) -> Result<(), MigrationError> {
    let command = format!("alembic {}", args.join(" "));
    info!(command = %command, "running");
    helper
        .exec("alembic", &alembic_args(args))
        .await
        .map(drop)
        .map_err(|e| MigrationError::Tool {
            command,
            message: e.to_string(),
        })
}

/// `alembic current`, logged only.
async fn log_current<R: ContainerRuntime>(helper: &R, stage: &str) {
    match helper.exec("alembic", &alembic_args(&["current"])).await {
        Ok(output) => info!(stage, current = %output.stdout_text().trim(), "alembic revision"),
        Err(e) => warn!(stage, error = %e, "cannot read alembic revision"),
    }
}

/// Arguments running one cleanup query through `psql` in the helper.
const fn psql_args(query: &str) -> [&str; 4] {
    ["-c", PSQL_SCRIPT, "psql", query]
}

/// Commit and terminate stuck transactions. Every step is best-effort.
async fn cleanup_transactions<R: ContainerRuntime>(helper: &R) {
    for query in CLEANUP_QUERIES {
        if let Err(e) = helper.exec("sh", &psql_args(query)).await {
            debug!(error = %e, "transaction cleanup step failed");
        }
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic, clippy::indexing_slicing)]
mod tests {
    use std::sync::Arc;

    use pgdev_container::{ContainerError, ProcessOutput};

    use super::*;

    const URL: &str = "postgresql://u:p@host.docker.internal:15432/db?sslmode=disable";
    const HELPER: &str = "pgdev-ws-mod-db-alembic";
    const UNREACHABLE: &str = "postgresql://u:p@127.0.0.1:1/db?sslmode=disable";

    /// Records every call; siblings share the log.
    #[derive(Debug, Clone, Default)]
    struct FakeRuntime {
        name: String,
        calls: Arc<Mutex<Vec<String>>>,
        fail_on: Option<&'static str>,
    }

    impl FakeRuntime {
        fn failing_on(command: &'static str) -> Self {
            Self {
                fail_on: Some(command),
                ..Self::default()
            }
        }

        fn log(&self, line: String) {
            self.calls.lock().unwrap().push(line);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ContainerRuntime for FakeRuntime {
        fn name(&self) -> &str {
            &self.name
        }

        fn sibling(&self, name: &str) -> Self {
            Self {
                name: name.to_owned(),
                ..self.clone()
            }
        }

        async fn init(&mut self, spec: &ContainerSpec) -> Result<(), ContainerError> {
            self.log(format!("init {} {}", self.name, spec.image));
            Ok(())
        }

        async fn start(&mut self) -> Result<(), ContainerError> {
            self.log(format!("start {}", self.name));
            Ok(())
        }

        async fn stop(&mut self) -> Result<(), ContainerError> {
            self.log(format!("stop {}", self.name));
            Ok(())
        }

        async fn shutdown(&mut self) -> Result<(), ContainerError> {
            self.log(format!("shutdown {}", self.name));
            Ok(())
        }

        async fn exec(
            &self,
            program: &str,
            args: &[&str],
        ) -> Result<ProcessOutput, ContainerError> {
            let line = format!("{program} {}", args.join(" "));
            self.log(line.clone());
            if self.fail_on.is_some_and(|failing| line.ends_with(failing)) {
                return Err(ContainerError::CommandFailed {
                    command: line,
                    status: String::from("exit status: 1"),
                    stderr: String::from("FAILED: Can't locate revision"),
                });
            }
            Ok(ProcessOutput::default())
        }
    }

    fn config(dir: &Path) -> MigrationConfig {
        MigrationConfig::new("db", dir, HELPER)
    }

    fn migrator(dir: &Path, runtime: &FakeRuntime) -> ContainerizedMigrator<FakeRuntime> {
        let mut migrator = ContainerizedMigrator::new(config(dir), runtime.clone())
            .unwrap()
            .with_table_check(TableCheckPolicy {
                max_attempts: 1,
                interval: Duration::from_secs(1),
            });
        migrator.init(Connections {
            container: String::from(URL),
            native: String::from(UNREACHABLE),
        });
        migrator
    }

    #[test]
    fn helper_uses_default_image_and_workspace() {
        let dir = tempfile::tempdir().unwrap();
        let migrator =
            ContainerizedMigrator::new(config(dir.path()), FakeRuntime::default()).unwrap();
        let spec = migrator.helper_spec(URL);

        assert_eq!(spec.image.to_string(), "codeflydev/alembic:latest");
        assert_eq!(spec.workdir.as_deref(), Some("/workspace"));
        assert!(spec.keep_alive);
        assert_eq!(spec.env, vec![(String::from("DATABASE_URL"), String::from(URL))]);
        assert_eq!(spec.mounts.len(), 1);
        assert_eq!(spec.mounts[0].container, "/workspace");
        assert_eq!(spec.mounts[0].host, dir.path().canonicalize().unwrap());
        assert_eq!(spec.extra_hosts, vec!["host.docker.internal:host-gateway"]);
    }

    #[test]
    fn helper_honors_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let versions = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.image_override = Some(String::from("registry.local:5000/tools/alembic:1.13"));
        cfg.version_dir_override = Some(versions.path().to_path_buf());

        let spec = ContainerizedMigrator::new(cfg, FakeRuntime::default())
            .unwrap()
            .helper_spec(URL);
        assert_eq!(spec.image.name, "registry.local:5000/tools/alembic");
        assert_eq!(spec.image.tag, "1.13");
        let targets: Vec<&str> = spec.mounts.iter().map(|m| m.container.as_str()).collect();
        assert_eq!(targets, vec!["/workspace", "/workspace/versions"]);
    }

    #[test]
    fn alembic_always_points_at_ini() {
        assert_eq!(
            alembic_args(&["upgrade", "head"]),
            vec!["-c", "/workspace/alembic.ini", "upgrade", "head"]
        );
    }

    #[test]
    fn psql_receives_query_as_positional_argument() {
        let args = psql_args("COMMIT;");
        assert_eq!(args[0], "-c");
        assert!(args[1].contains("$DATABASE_URL"));
        assert_eq!(args[3], "COMMIT;");
    }

    #[test]
    fn table_check_waits_a_minute_by_default() {
        let policy = TableCheckPolicy::default();
        assert_eq!(policy.max_attempts, 12);
        assert_eq!(policy.waited(), Duration::from_secs(60));
    }

    #[test]
    fn version_table_means_uncommitted_transaction() {
        let err = classify_empty_schema(
            Some(vec![String::from("ae1027a6acf")]),
            &TableCheckPolicy::default(),
            None,
        );
        match err {
            MigrationError::UncommittedTransaction { versions, waited } => {
                assert_eq!(versions, vec!["ae1027a6acf"]);
                assert_eq!(waited, Duration::from_secs(60));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn no_version_table_means_no_tables() {
        let err = classify_empty_schema(
            None,
            &TableCheckPolicy::default(),
            Some(String::from("connection refused")),
        );
        match err {
            MigrationError::NoTables {
                attempts,
                last_error,
                ..
            } => {
                assert_eq!(attempts, 12);
                assert_eq!(last_error.as_deref(), Some("connection refused"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_database_reports_last_error_after_full_budget() {
        let dir = tempfile::tempdir().unwrap();
        let migrator = ContainerizedMigrator::new(config(dir.path()), FakeRuntime::default())
            .unwrap()
            .with_table_check(TableCheckPolicy {
                max_attempts: 3,
                interval: Duration::from_secs(5),
            });
        let started = tokio::time::Instant::now();
        let last = migrator
            .wait_for_tables("postgresql://u:p@127.0.0.1:1/db")
            .await
            .unwrap_err();
        assert!(last.is_some());
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn apply_runs_upgrade_sequence_in_sibling_helper() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = FakeRuntime::default();
        let err = migrator(dir.path(), &runtime).apply().await.unwrap_err();

        // Nothing answers on the native connection, so the table check fails.
        assert!(matches!(err, MigrationError::NoTables { attempts: 1, .. }));

        let calls = runtime.calls();
        let current = "alembic -c /workspace/alembic.ini current";
        assert_eq!(
            calls[..4],
            [
                format!("init {HELPER} codeflydev/alembic:latest"),
                format!("start {HELPER}"),
                String::from(current),
                String::from("alembic -c /workspace/alembic.ini upgrade head"),
            ]
        );
        let cleanup = &calls[4..7];
        assert!(cleanup.iter().all(|c| c.starts_with("sh -c ")));
        assert!(cleanup[1].ends_with("COMMIT;"));
        assert_eq!(calls[7], current);
        assert_eq!(calls[8], format!("shutdown {HELPER}"));
        assert_eq!(calls.len(), 9);
    }

    #[tokio::test]
    async fn failed_upgrade_still_removes_helper() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = FakeRuntime::failing_on("upgrade head");
        let err = migrator(dir.path(), &runtime).apply().await.unwrap_err();

        match err {
            MigrationError::Tool { command, message } => {
                assert_eq!(command, "alembic upgrade head");
                assert!(message.contains("Can't locate revision"));
            }
            other => panic!("unexpected error: {other}"),
        }
        let calls = runtime.calls();
        assert_eq!(calls.last().unwrap(), &format!("shutdown {HELPER}"));
        assert!(!calls.iter().any(|c| c.starts_with("sh ")));
    }

    #[tokio::test]
    async fn update_steps_latest_revision_down_and_up() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = FakeRuntime::default();
        migrator(dir.path(), &runtime)
            .update(&dir.path().join("versions/0002_add_email.py"))
            .await
            .unwrap();

        assert_eq!(
            runtime.calls(),
            vec![
                format!("init {HELPER} codeflydev/alembic:latest"),
                format!("start {HELPER}"),
                String::from("alembic -c /workspace/alembic.ini downgrade -1"),
                String::from("alembic -c /workspace/alembic.ini upgrade +1"),
                format!("shutdown {HELPER}"),
            ]
        );
    }

    #[tokio::test]
    async fn apply_before_init_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let migrator =
            ContainerizedMigrator::new(config(dir.path()), FakeRuntime::default()).unwrap();
        assert!(matches!(
            migrator.apply().await,
            Err(MigrationError::NotInitialized)
        ));
    }
}
