//! Migrator - core migration execution engine
//!
//! Orchestrates the collaborators: lists assets from the `Source`, parses
//! them into migration descriptors, derives the current version from the
//! history table, plans the delta to the requested version, and executes
//! each migration under the cross-process lock while recording one history
//! row per attempt.

use crate::executor::{DbError, DbExecutor, MayPostgresExecutor};
use crate::migration::history::{self, STATUS_FAILED, STATUS_PASSED};
use crate::migration::{
    Direction, LockFactory, Migration, MigrationError, MigrationLockGuard, Parser, Runner, Source,
    Strategy, MIGRATION_LOCK_NAME,
};
use crate::transaction::Transaction;
use may_postgres::Client;

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;

/// Core migration execution engine
pub struct Migrator {
    executor: MayPostgresExecutor,
    lock_factory: Box<dyn LockFactory>,
    source: Box<dyn Source>,
    runner: Box<dyn Runner>,
}

impl Migrator {
    /// Create a new Migrator
    ///
    /// `client` is the main connection migrations run on. The lock factory
    /// must hold its own auxiliary connection; see
    /// [`crate::migration::AdvisoryLockFactory`].
    pub fn new(
        client: Client,
        lock_factory: Box<dyn LockFactory>,
        source: Box<dyn Source>,
        runner: Box<dyn Runner>,
    ) -> Self {
        Self {
            executor: MayPostgresExecutor::new(client),
            lock_factory,
            source,
            runner,
        }
    }

    /// Maximum version among parseable `up` assets
    ///
    /// Asset names that do not match the migration grammar are ignored.
    pub fn supported_version(&self) -> Result<i64, MigrationError> {
        Ok(self
            .migrations()?
            .iter()
            .filter(|m| m.direction == Direction::Up)
            .map(|m| m.version)
            .max()
            .unwrap_or(0))
    }

    /// Current version derived from the history table
    ///
    /// A database without a history table is at version 0; the read path
    /// never creates tables or takes the lock.
    ///
    /// # Errors
    ///
    /// Fails with a dirty-state error if any history row is dirty.
    pub fn current_version(&self) -> Result<i64, MigrationError> {
        if !history::history_table_exists(&self.executor)? {
            return Ok(0);
        }
        let rows = history::fetch_history(&self.executor)?;
        history::derive_current_version(&rows)
    }

    /// All parseable migrations, sorted by `(version, direction)`
    ///
    /// Unparseable asset names are skipped silently; a parseable name
    /// whose body the source cannot provide is an error.
    pub fn migrations(&self) -> Result<Vec<Migration>, MigrationError> {
        let parser = Parser::new(self.source.as_ref());
        let mut migrations = Vec::new();
        for name in self.source.asset_names()? {
            if parser.parse_name(&name).is_err() {
                continue;
            }
            migrations.push(parser.parse(&name)?);
        }
        migrations.sort_by_key(|m| (m.version, m.direction));
        Ok(migrations)
    }

    /// Apply all pending `up` migrations, ending at the supported version
    ///
    /// No-op if nothing is pending. Holds the migration lock from
    /// bootstrap through the last history write.
    pub fn up(&self) -> Result<(), MigrationError> {
        let migrations = self.migrations()?;
        let target = migrations
            .iter()
            .filter(|m| m.direction == Direction::Up)
            .map(|m| m.version)
            .max()
            .unwrap_or(0);

        let _guard = MigrationLockGuard::new(self.lock_factory.new_lock(MIGRATION_LOCK_NAME))?;
        self.setup_history_table()?;

        let current = self.locked_current_version()?;
        if target <= current {
            log::debug!("no migrations pending at version {current}");
            return Ok(());
        }

        for migration in pending_up(&migrations, current, target) {
            self.run_migration(migration)?;
        }
        Ok(())
    }

    /// Migrate to an exact version, upward or downward
    ///
    /// Upward applies `up` migrations with `current < v <= target` in
    /// ascending order; downward applies `down` migrations with
    /// `current >= v > target` in descending order. `target == current`
    /// is a no-op.
    ///
    /// # Errors
    ///
    /// A nonzero target no asset provides is `UnknownVersion`.
    pub fn migrate(&self, target: i64) -> Result<(), MigrationError> {
        let migrations = self.migrations()?;
        if target != 0 && !migrations.iter().any(|m| m.version == target) {
            return Err(MigrationError::UnknownVersion(target));
        }

        let _guard = MigrationLockGuard::new(self.lock_factory.new_lock(MIGRATION_LOCK_NAME))?;
        self.setup_history_table()?;

        let current = self.locked_current_version()?;
        if target > current {
            for migration in pending_up(&migrations, current, target) {
                self.run_migration(migration)?;
            }
        } else if target < current {
            for migration in pending_down(&migrations, current, target) {
                self.run_migration(migration)?;
            }
        }
        Ok(())
    }

    /// Current version once the lock is held and the table exists
    fn locked_current_version(&self) -> Result<i64, MigrationError> {
        let rows = history::fetch_history(&self.executor)?;
        history::derive_current_version(&rows)
    }

    /// First-run bootstrap from the legacy `schema_migrations` table
    ///
    /// Runs under the advisory lock at the entry of every mutating
    /// operation. An existing `migrations_history` table is never
    /// rewritten. A dirty legacy row aborts without creating the new
    /// table.
    fn setup_history_table(&self) -> Result<(), MigrationError> {
        if history::history_table_exists(&self.executor)? {
            return Ok(());
        }

        if history::legacy_table_exists(&self.executor)? {
            if let Some((version, dirty)) = history::read_legacy_version(&self.executor)? {
                if dirty {
                    return Err(MigrationError::dirty_bootstrap());
                }
                log::info!("upgrading legacy schema_migrations table at version {version}");
                history::create_history_table(&self.executor)?;
                history::insert_history(
                    &self.executor,
                    version,
                    Direction::Up.as_str(),
                    STATUS_PASSED,
                    false,
                )?;
                return Ok(());
            }
        }

        history::create_history_table(&self.executor)?;
        Ok(())
    }

    fn run_migration(&self, migration: &Migration) -> Result<(), MigrationError> {
        log::info!(
            "applying migration {} ({})",
            migration.file_name,
            migration.strategy
        );

        match migration.strategy {
            Strategy::SqlTransaction => self.run_sql_in_transaction(migration)?,
            Strategy::SqlNoTransaction => self.run_sql_without_transaction(migration)?,
            Strategy::Registered => self.run_registered(migration)?,
        }

        #[cfg(feature = "metrics")]
        METRICS.record_migration_applied();

        Ok(())
    }

    /// Execute a transactional SQL migration
    ///
    /// Statements run inside one synthesized transaction together with
    /// the `passed` history row. On failure the transaction is rolled
    /// back and a `failed, dirty=false` row is recorded: the database is
    /// left clean and the migration may be retried after fixing the
    /// script.
    fn run_sql_in_transaction(&self, migration: &Migration) -> Result<(), MigrationError> {
        self.ensure_statements(migration)?;

        let tx = Transaction::begin(self.executor.client().clone()).map_err(DbError::from)?;
        for statement in &migration.statements {
            if let Err(e) = tx.execute(statement, &[]) {
                let _ = tx.rollback();
                self.record_attempt(migration, STATUS_FAILED, false)?;
                return Err(MigrationError::RolledBack {
                    version: migration.version,
                    cause: e.to_string(),
                });
            }
        }

        history::insert_history(
            &tx,
            migration.version,
            migration.direction.as_str(),
            STATUS_PASSED,
            false,
        )?;

        if let Err(e) = tx.commit() {
            self.record_attempt(migration, STATUS_FAILED, false)?;
            return Err(MigrationError::RolledBack {
                version: migration.version,
                cause: e.to_string(),
            });
        }
        Ok(())
    }

    /// Execute a non-transactional SQL migration
    ///
    /// Statements run sequentially outside a transaction. A failure
    /// leaves the database partially modified, so the attempt is recorded
    /// `failed, dirty=true` and every later operation is refused until an
    /// operator intervenes.
    fn run_sql_without_transaction(&self, migration: &Migration) -> Result<(), MigrationError> {
        self.ensure_statements(migration)?;

        for statement in &migration.statements {
            if let Err(e) = self.executor.execute(statement, &[]) {
                self.record_attempt(migration, STATUS_FAILED, true)?;
                return Err(MigrationError::Failed {
                    version: migration.version,
                    direction: migration.direction,
                    cause: e.to_string(),
                });
            }
        }

        self.record_attempt(migration, STATUS_PASSED, false)
    }

    /// Execute a registered migration through the runner
    fn run_registered(&self, migration: &Migration) -> Result<(), MigrationError> {
        if let Err(e) = self.runner.run(&migration.name) {
            self.record_attempt(migration, STATUS_FAILED, true)?;
            return Err(MigrationError::Failed {
                version: migration.version,
                direction: migration.direction,
                cause: e.to_string(),
            });
        }

        self.record_attempt(migration, STATUS_PASSED, false)
    }

    /// Append a history row in its own short transaction
    fn record_attempt(
        &self,
        migration: &Migration,
        status: &str,
        dirty: bool,
    ) -> Result<(), MigrationError> {
        let tx = Transaction::begin(self.executor.client().clone()).map_err(DbError::from)?;
        history::insert_history(
            &tx,
            migration.version,
            migration.direction.as_str(),
            status,
            dirty,
        )?;
        tx.commit().map_err(DbError::from)?;
        Ok(())
    }

    fn ensure_statements(&self, migration: &Migration) -> Result<(), MigrationError> {
        if migration.statements.is_empty() {
            return Err(MigrationError::MissingAsset {
                name: migration.file_name.clone(),
                detail: "asset contains no SQL statements".to_string(),
            });
        }
        Ok(())
    }
}

/// Plan the upward delta: `up` entries with `current < v <= target`,
/// ascending
///
/// `migrations` must already be sorted by `(version, direction)`. Entries
/// at or below the current version are skipped silently; entries sharing
/// a version but pointing the other way are not executed.
fn pending_up(migrations: &[Migration], current: i64, target: i64) -> Vec<&Migration> {
    migrations
        .iter()
        .filter(|m| m.direction == Direction::Up && m.version > current && m.version <= target)
        .collect()
}

/// Plan the downward delta: `down` entries with `current >= v > target`,
/// descending
fn pending_down(migrations: &[Migration], current: i64, target: i64) -> Vec<&Migration> {
    migrations
        .iter()
        .rev()
        .filter(|m| m.direction == Direction::Down && m.version <= current && m.version > target)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn migration(version: i64, direction: Direction) -> Migration {
        Migration {
            version,
            direction,
            strategy: Strategy::SqlTransaction,
            name: String::new(),
            statements: vec!["SELECT 1".to_string()],
            file_name: format!("{version}_test.{direction}.sql"),
        }
    }

    fn sorted(mut migrations: Vec<Migration>) -> Vec<Migration> {
        migrations.sort_by_key(|m| (m.version, m.direction));
        migrations
    }

    #[test]
    fn test_pending_up_is_ascending_and_bounded() {
        let migrations = sorted(vec![
            migration(20000, Direction::Up),
            migration(1000, Direction::Up),
            migration(3000, Direction::Up),
            migration(3000, Direction::Down),
        ]);

        let plan = pending_up(&migrations, 1000, 20000);
        let versions: Vec<i64> = plan.iter().map(|m| m.version).collect();
        assert_eq!(versions, vec![3000, 20000]);
        assert!(plan.iter().all(|m| m.direction == Direction::Up));
    }

    #[test]
    fn test_pending_up_respects_target() {
        let migrations = sorted(vec![
            migration(1000, Direction::Up),
            migration(2000, Direction::Up),
            migration(3000, Direction::Up),
        ]);

        let plan = pending_up(&migrations, 0, 2000);
        let versions: Vec<i64> = plan.iter().map(|m| m.version).collect();
        assert_eq!(versions, vec![1000, 2000]);
    }

    #[test]
    fn test_pending_up_empty_when_current_at_target() {
        let migrations = sorted(vec![migration(1000, Direction::Up)]);
        assert!(pending_up(&migrations, 1000, 1000).is_empty());
    }

    #[test]
    fn test_pending_down_is_descending_and_excludes_target() {
        let migrations = sorted(vec![
            migration(1000, Direction::Up),
            migration(2000, Direction::Up),
            migration(2000, Direction::Down),
            migration(3000, Direction::Up),
            migration(3000, Direction::Down),
        ]);

        let plan = pending_down(&migrations, 3000, 1000);
        let versions: Vec<i64> = plan.iter().map(|m| m.version).collect();
        assert_eq!(versions, vec![3000, 2000]);
        assert!(plan.iter().all(|m| m.direction == Direction::Down));
    }

    #[test]
    fn test_numeric_ordering_not_lexicographic() {
        let migrations = sorted(vec![
            migration(20000, Direction::Up),
            migration(3000, Direction::Up),
            migration(1000, Direction::Up),
        ]);

        let plan = pending_up(&migrations, 0, 20000);
        let versions: Vec<i64> = plan.iter().map(|m| m.version).collect();
        // 3000 < 20000 numerically even though "3000" > "20000" as strings
        assert_eq!(versions, vec![1000, 3000, 20000]);
    }
}
