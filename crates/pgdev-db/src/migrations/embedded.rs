//! sqlx migrations run in-process.
//!
//! Migrations are loaded from the directory at call time, so files added or
//! edited while the service runs are picked up by the next `apply` or
//! `update`. Bookkeeping lives in sqlx's `_sqlx_migrations` table.

use std::cmp::Reverse;
use std::path::Path;
use std::time::Duration;

use backon::{ConstantBuilder, Retryable};
use sqlx::PgPool;
use sqlx::migrate::{Migrate, Migration, Migrator};
use tracing::{debug, info, warn};

use super::{Connections, MigrationConfig, MigrationError, parse_version};
use crate::error::DbError;
use crate::postgres::{PostgresConfig, PostgresPool};

/// Connection attempts before giving up.
const CONNECT_ATTEMPTS: usize = 3;

/// Delay between connection attempts.
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Applies sqlx migrations over the native connection.
#[derive(Debug)]
pub struct EmbeddedMigrator {
    config: MigrationConfig,
    connections: Option<Connections>,
}

impl EmbeddedMigrator {
    /// Create a migrator for `config`. Call `init` before use.
    pub const fn new(config: MigrationConfig) -> Self {
        Self {
            config,
            connections: None,
        }
    }

    pub(crate) fn init(&mut self, connections: Connections) {
        self.connections = Some(connections);
    }

    /// Apply every pending migration. Nothing pending is success.
    pub(crate) async fn apply(&self) -> Result<(), MigrationError> {
        if !self.config.has_migrations() {
            debug!(dir = %self.config.migration_dir.display(), "no migration directory, skipping");
            return Ok(());
        }
        let pool = self.connect().await?;
        let result = self.run_pending(pool.pool()).await;
        pool.close().await;
        result
    }

    /// Force the schema back to the version of `changed_file` and run it
    /// again, ending at the latest version.
    ///
    /// The version and every applied version above it are reverted newest
    /// first, running each one's down script if it has one and otherwise just
    /// dropping its record. Every pending migration is then applied.
    pub(crate) async fn update(&self, changed_file: &Path) -> Result<(), MigrationError> {
        if !self.config.has_migrations() {
            debug!(dir = %self.config.migration_dir.display(), "no migration directory, skipping");
            return Ok(());
        }
        let version = parse_version(changed_file)?;
        info!(file = %changed_file.display(), version, "re-applying migration");

        let pool = self.connect().await?;
        let result = self.reapply(pool.pool(), version).await;
        pool.close().await;
        result
    }

    async fn connect(&self) -> Result<PostgresPool, MigrationError> {
        let url = &self
            .connections
            .as_ref()
            .ok_or(MigrationError::NotInitialized)?
            .native;
        let config = PostgresConfig::parse(url)?;
        let backoff = ConstantBuilder::default()
            .with_delay(CONNECT_RETRY_DELAY)
            .with_max_times(CONNECT_ATTEMPTS.saturating_sub(1));

        let pool = (|| PostgresPool::connect(&config))
            .retry(backoff)
            .sleep(tokio::time::sleep)
            .when(|e: &DbError| matches!(e, DbError::Postgres(_)))
            .notify(|err: &DbError, _| debug!(error = %err, "retrying migration connection"))
            .await?;
        Ok(pool)
    }

    async fn load(&self) -> Result<Migrator, MigrationError> {
        Ok(Migrator::new(self.config.migration_dir.clone()).await?)
    }

    async fn run_pending(&self, pool: &PgPool) -> Result<(), MigrationError> {
        let migrator = self.load().await?;
        let known = migrator
            .iter()
            .filter(|m| !m.migration_type.is_down_migration())
            .count();
        migrator.run(pool).await?;
        info!(
            database = %self.config.database_name,
            migrations = known,
            "migrations applied"
        );
        Ok(())
    }

    async fn reapply(&self, pool: &PgPool, version: i64) -> Result<(), MigrationError> {
        let migrator = self.load().await?;
        let mut conn = pool.acquire().await?;
        conn.ensure_migrations_table().await?;

        // Versions from the changed one up are reverted below; clear their
        // dirty flags first.
        let forced = sqlx::query("UPDATE _sqlx_migrations SET success = TRUE WHERE version >= $1")
            .bind(version)
            .execute(&mut *conn)
            .await?
            .rows_affected();
        debug!(version, forced, "tracking table forced");

        if let Some(dirty) = conn.dirty_version().await? {
            return Err(MigrationError::Dirty { version: dirty });
        }

        let applied: Vec<i64> = conn
            .list_applied_migrations()
            .await?
            .into_iter()
            .map(|m| m.version)
            .collect();
        let plan = revert_plan(&migrator, &applied, version);
        if plan.is_empty() {
            debug!(version, "migration was not applied yet");
        }
        for (applied_version, down) in plan {
            if let Some(down) = down {
                conn.revert(down).await?;
                info!(version = applied_version, "migration reverted");
            } else {
                sqlx::query("DELETE FROM _sqlx_migrations WHERE version = $1")
                    .bind(applied_version)
                    .execute(&mut *conn)
                    .await?;
                warn!(
                    version = applied_version,
                    "no down migration, re-running without reverting its changes"
                );
            }
        }
        drop(conn);

        migrator.run(pool).await?;
        info!(version, "migration re-applied");
        Ok(())
    }
}

/// Applied versions at or above `version`, newest first, each paired with its
/// down migration if the directory has one.
fn revert_plan<'m>(
    migrator: &'m Migrator,
    applied: &[i64],
    version: i64,
) -> Vec<(i64, Option<&'m Migration>)> {
    let mut versions: Vec<i64> = applied.iter().copied().filter(|v| *v >= version).collect();
    versions.sort_unstable_by_key(|v| Reverse(*v));
    versions
        .into_iter()
        .map(|v| {
            let down = migrator
                .iter()
                .find(|m| m.version == v && m.migration_type.is_down_migration());
            (v, down)
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic, clippy::indexing_slicing)]
mod tests {
    use super::*;

    fn connections() -> Connections {
        Connections {
            container: String::from("postgresql://u:p@host.docker.internal:1/db"),
            native: String::from("postgresql://u:p@localhost:1/db"),
        }
    }

    #[tokio::test]
    async fn apply_before_init_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let migrator = EmbeddedMigrator::new(MigrationConfig::new("db", dir.path(), "helper"));
        let err = migrator.apply().await.unwrap_err();
        assert!(matches!(err, MigrationError::NotInitialized));
    }

    #[tokio::test]
    async fn update_with_unversioned_file_fails_before_connecting() {
        let dir = tempfile::tempdir().unwrap();
        let mut migrator =
            EmbeddedMigrator::new(MigrationConfig::new("db", dir.path(), "helper"));
        migrator.init(connections());
        let err = migrator
            .update(&dir.path().join("readme.md"))
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::InvalidVersion { .. }));
    }

    #[tokio::test]
    async fn missing_directory_skips_everything() {
        let migrator = EmbeddedMigrator::new(MigrationConfig::new("db", "/no/such/dir", "h"));
        migrator.apply().await.unwrap();
        migrator.update(Path::new("garbage")).await.unwrap();
    }

    #[tokio::test]
    async fn revert_plan_walks_down_from_the_newest_applied_version() {
        let dir = tempfile::tempdir().unwrap();
        for (file, sql) in [
            ("1_users.up.sql", "CREATE TABLE users (id INT);"),
            ("1_users.down.sql", "DROP TABLE users;"),
            ("2_orders.up.sql", "CREATE TABLE orders (id INT);"),
            ("2_orders.down.sql", "DROP TABLE orders;"),
            ("3_seed.up.sql", "INSERT INTO users VALUES (1);"),
            ("4_items.up.sql", "CREATE TABLE items (id INT);"),
            ("4_items.down.sql", "DROP TABLE items;"),
        ] {
            std::fs::write(dir.path().join(file), sql).unwrap();
        }
        let migrator = Migrator::new(dir.path().to_path_buf()).await.unwrap();

        // Version 4 exists on disk but was never applied.
        let plan = revert_plan(&migrator, &[1, 2, 3], 2);
        let steps: Vec<(i64, bool)> = plan
            .iter()
            .map(|(v, down)| (*v, down.is_some()))
            .collect();
        assert_eq!(steps, vec![(3, false), (2, true)]);
        let (_, down) = plan[1];
        assert!(down.unwrap().sql.contains("DROP TABLE orders"));
    }

    #[tokio::test]
    async fn revert_plan_is_empty_when_version_was_never_applied() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("1_users.sql"), "CREATE TABLE users (id INT);").unwrap();
        let migrator = Migrator::new(dir.path().to_path_buf()).await.unwrap();

        assert!(revert_plan(&migrator, &[], 1).is_empty());
        assert!(revert_plan(&migrator, &[1], 2).is_empty());
    }
}
