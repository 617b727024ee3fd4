//! The `migrations_history` table
//!
//! History is a log, not a pointer: one row is appended per migration
//! attempt and the current version is derived by scanning, which keeps
//! history auditable and failures observable. The legacy single-row
//! `schema_migrations` table is consulted only during first-run bootstrap.

use crate::executor::DbExecutor;
use crate::migration::MigrationError;

pub const HISTORY_TABLE: &str = "migrations_history";
pub const LEGACY_TABLE: &str = "schema_migrations";

pub const STATUS_PASSED: &str = "passed";
pub const STATUS_FAILED: &str = "failed";

/// One row of `migrations_history`
///
/// `tstamp` stays server-side; ordering is done by the queries that fetch
/// rows, so the row carries only the fields the version scan needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRow {
    pub version: i64,
    pub direction: String,
    pub status: String,
    pub dirty: bool,
}

impl HistoryRow {
    /// Expected column order: `version`, `direction`, `status`, `dirty`
    pub fn from_row(row: &may_postgres::Row) -> Self {
        Self {
            version: row.get(0),
            direction: row.get(1),
            status: row.get(2),
            dirty: row.get(3),
        }
    }
}

fn table_exists(executor: &dyn DbExecutor, table: &str) -> Result<bool, MigrationError> {
    let row = executor.query_one(
        "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
         WHERE table_schema = current_schema() AND table_name = $1)",
        &[&table],
    )?;
    Ok(row.get(0))
}

pub fn history_table_exists(executor: &dyn DbExecutor) -> Result<bool, MigrationError> {
    table_exists(executor, HISTORY_TABLE)
}

pub fn legacy_table_exists(executor: &dyn DbExecutor) -> Result<bool, MigrationError> {
    table_exists(executor, LEGACY_TABLE)
}

/// Create `migrations_history`
///
/// The exact schema is part of the external contract.
pub fn create_history_table(executor: &dyn DbExecutor) -> Result<(), MigrationError> {
    executor.execute(
        "CREATE TABLE IF NOT EXISTS migrations_history (\
         version bigint, \
         tstamp timestamp with time zone, \
         direction varchar, \
         status varchar, \
         dirty boolean)",
        &[],
    )?;
    Ok(())
}

/// Read the single legacy row, if the legacy table holds one
pub fn read_legacy_version(
    executor: &dyn DbExecutor,
) -> Result<Option<(i64, bool)>, MigrationError> {
    let rows = executor.query_all("SELECT version, dirty FROM schema_migrations LIMIT 1", &[])?;
    Ok(rows.first().map(|row| (row.get(0), row.get(1))))
}

/// Append one attempt to the history log
pub fn insert_history(
    executor: &dyn DbExecutor,
    version: i64,
    direction: &str,
    status: &str,
    dirty: bool,
) -> Result<(), MigrationError> {
    executor.execute(
        "INSERT INTO migrations_history (version, tstamp, direction, status, dirty) \
         VALUES ($1, current_timestamp, $2, $3, $4)",
        &[&version, &direction, &status, &dirty],
    )?;
    Ok(())
}

/// Fetch the full history, newest attempt first
pub fn fetch_history(executor: &dyn DbExecutor) -> Result<Vec<HistoryRow>, MigrationError> {
    let rows = executor.query_all(
        "SELECT version, direction, status, dirty FROM migrations_history ORDER BY tstamp DESC",
        &[],
    )?;
    Ok(rows.iter().map(HistoryRow::from_row).collect())
}

/// Derive the current version from history rows (newest first)
///
/// Failed attempts are skipped. If the newest remaining row is a `down`,
/// the current version is the newest remaining row with a strictly lower
/// version, repeated until an `up` row (or nothing) is reached: the newest
/// successful up not yet undone by a down.
///
/// # Errors
///
/// Any `dirty` row forbids reading a version at all.
pub fn derive_current_version(rows: &[HistoryRow]) -> Result<i64, MigrationError> {
    if rows.iter().any(|row| row.dirty) {
        return Err(MigrationError::dirty_read());
    }

    let mut latest = match rows.iter().find(|row| row.status != STATUS_FAILED) {
        Some(row) => row,
        None => return Ok(0),
    };

    while latest.direction == "down" {
        match rows
            .iter()
            .find(|row| row.status != STATUS_FAILED && row.version < latest.version)
        {
            Some(row) => latest = row,
            None => return Ok(0),
        }
    }

    Ok(latest.version)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(version: i64, direction: &str, status: &str, dirty: bool) -> HistoryRow {
        HistoryRow {
            version,
            direction: direction.to_string(),
            status: status.to_string(),
            dirty,
        }
    }

    #[test]
    fn test_empty_history_is_version_zero() {
        assert_eq!(derive_current_version(&[]).unwrap(), 0);
    }

    #[test]
    fn test_latest_up_migration_wins() {
        // Newest first
        let rows = vec![
            row(3000, "up", "passed", false),
            row(2000, "up", "passed", false),
        ];
        assert_eq!(derive_current_version(&rows).unwrap(), 3000);
    }

    #[test]
    fn test_down_migration_reports_version_before_it() {
        // up 3000, up 4000, down 4000 => 3000
        let rows = vec![
            row(4000, "down", "passed", false),
            row(4000, "up", "passed", false),
            row(3000, "up", "passed", false),
        ];
        assert_eq!(derive_current_version(&rows).unwrap(), 3000);
    }

    #[test]
    fn test_failed_attempts_are_skipped() {
        let rows = vec![
            row(3000, "down", "failed", false),
            row(2000, "up", "passed", false),
        ];
        assert_eq!(derive_current_version(&rows).unwrap(), 2000);
    }

    #[test]
    fn test_consecutive_downs_walk_to_the_surviving_up() {
        let rows = vec![
            row(3000, "down", "passed", false),
            row(2000, "down", "passed", false),
            row(3000, "up", "passed", false),
            row(2000, "up", "passed", false),
            row(1000, "up", "passed", false),
        ];
        assert_eq!(derive_current_version(&rows).unwrap(), 1000);
    }

    #[test]
    fn test_down_with_nothing_below_is_version_zero() {
        let rows = vec![
            row(1000, "down", "passed", false),
            row(1000, "up", "passed", false),
        ];
        assert_eq!(derive_current_version(&rows).unwrap(), 0);
    }

    #[test]
    fn test_any_dirty_row_is_an_error() {
        let rows = vec![
            row(3000, "up", "passed", false),
            row(2000, "down", "passed", true),
        ];
        let err = derive_current_version(&rows).unwrap_err();
        assert!(err.to_string().contains("dirty state"));
    }
}
