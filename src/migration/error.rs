//! Migration-specific error types

use crate::executor::DbError;
use crate::migration::Direction;
use crate::transaction::TransactionError;

/// Migration-specific errors
///
/// The `Display` output of several variants is part of the operator
/// contract: `DirtyState` messages contain "dirty state", a failed
/// transactional migration mentions "rolled back the migration", and other
/// failed migrations render as `Migration <version> ... failed`.
#[derive(Debug)]
pub enum MigrationError {
    /// Database execution error
    Db(DbError),
    /// A dirty history row (or dirty legacy row) forbids all operations
    DirtyState(String),
    /// File name does not match the migration grammar
    Parse(String),
    /// The source failed to provide an expected asset, or provided an
    /// empty one
    MissingAsset { name: String, detail: String },
    /// `migrate` was asked for a version no asset provides
    UnknownVersion(i64),
    /// A transactional migration failed; its transaction was rolled back
    RolledBack { version: i64, cause: String },
    /// A non-transactional or registered migration failed
    Failed {
        version: i64,
        direction: Direction,
        cause: String,
    },
    /// A migration procedure was registered twice under one name
    AlreadyRegistered(String),
    /// No migration procedure is registered under the requested name
    NotRegistered(String),
    /// The advisory lock could not be acquired
    LockUnavailable(String),
}

impl MigrationError {
    /// Dirty-state error raised when reading history
    pub fn dirty_read() -> Self {
        MigrationError::DirtyState("Database is in dirty state".to_string())
    }

    /// Dirty-state error raised when the legacy table blocks bootstrap
    pub fn dirty_bootstrap() -> Self {
        MigrationError::DirtyState("Database is in a dirty state".to_string())
    }
}

impl std::fmt::Display for MigrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationError::Db(e) => write!(f, "Database error: {e}"),
            MigrationError::DirtyState(msg) => write!(f, "{msg}"),
            MigrationError::Parse(name) => {
                write!(f, "Could not parse migration file name '{name}'")
            }
            MigrationError::MissingAsset { name, detail } => {
                write!(f, "Missing migration asset '{name}': {detail}")
            }
            MigrationError::UnknownVersion(version) => {
                write!(f, "Could not migrate to unknown version {version}")
            }
            MigrationError::RolledBack { version, cause } => {
                write!(
                    f,
                    "Migration {version} failed, rolled back the migration: {cause}"
                )
            }
            MigrationError::Failed {
                version,
                direction,
                cause,
            } => {
                write!(f, "Migration {version} ({direction}) failed: {cause}")
            }
            MigrationError::AlreadyRegistered(name) => {
                write!(f, "Migration procedure '{name}' is already registered")
            }
            MigrationError::NotRegistered(name) => {
                write!(f, "No migration procedure registered under the name '{name}'")
            }
            MigrationError::LockUnavailable(msg) => {
                write!(f, "Could not acquire migration lock: {msg}")
            }
        }
    }
}

impl std::error::Error for MigrationError {}

impl From<DbError> for MigrationError {
    fn from(error: DbError) -> Self {
        MigrationError::Db(error)
    }
}

impl From<TransactionError> for MigrationError {
    fn from(error: TransactionError) -> Self {
        MigrationError::Db(error.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dirty_messages_contain_contract_substring() {
        assert!(MigrationError::dirty_read().to_string().contains("dirty state"));
        assert!(MigrationError::dirty_bootstrap()
            .to_string()
            .contains("dirty state"));
        // The bootstrap phrasing differs from the read phrasing
        assert_eq!(
            MigrationError::dirty_bootstrap().to_string(),
            "Database is in a dirty state"
        );
        assert_eq!(
            MigrationError::dirty_read().to_string(),
            "Database is in dirty state"
        );
    }

    #[test]
    fn test_rolled_back_message() {
        let err = MigrationError::RolledBack {
            version: 1200,
            cause: "relation does not exist".to_string(),
        };
        assert!(err.to_string().contains("rolled back the migration"));
    }

    #[test]
    fn test_failed_message_matches_contract() {
        let err = MigrationError::Failed {
            version: 1200,
            direction: Direction::Up,
            cause: "relation does not exist".to_string(),
        };
        let msg = err.to_string();
        // Operator tooling matches /Migration.*failed/
        let migration_idx = msg.find("Migration").unwrap();
        let failed_idx = msg.find("failed").unwrap();
        assert!(migration_idx < failed_idx);
    }

    #[test]
    fn test_unknown_version_message() {
        let err = MigrationError::UnknownVersion(1500);
        assert!(err.to_string().contains("1500"));
    }
}
