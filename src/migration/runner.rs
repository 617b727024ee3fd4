//! Execution of registered (compiled) migrations
//!
//! Some migrations cannot be expressed as SQL scripts; they are compiled
//! procedures resolved by name. The [`Runner`] trait is the boundary the
//! migrator sees; [`RegistryRunner`] resolves names against a registry
//! populated explicitly at construction time.

use crate::executor::{DbExecutor, MayPostgresExecutor};
use crate::migration::MigrationError;
use may_postgres::Client;
use std::collections::HashMap;

/// Executes named procedural migrations
pub trait Runner {
    /// Run the procedure registered under `name`
    ///
    /// # Errors
    ///
    /// Returns an error when the name is unknown or the procedure fails;
    /// the migrator records the attempt as failed and dirty either way.
    fn run(&self, name: &str) -> Result<(), MigrationError>;
}

/// Column-value encryption used by registered migrations
///
/// Migrations that move secrets between columns need the deployment's
/// encryption strategy; it is threaded through the [`RunnerContext`].
pub trait EncryptionStrategy: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, MigrationError>;

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, MigrationError>;
}

/// Pass-through strategy for deployments without column encryption
pub struct NoEncryption;

impl EncryptionStrategy for NoEncryption {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, MigrationError> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, MigrationError> {
        Ok(ciphertext.to_vec())
    }
}

/// Everything a registered migration procedure may touch
pub struct RunnerContext {
    executor: Box<dyn DbExecutor>,
    encryption: Box<dyn EncryptionStrategy>,
}

impl RunnerContext {
    pub fn executor(&self) -> &dyn DbExecutor {
        self.executor.as_ref()
    }

    pub fn encryption(&self) -> &dyn EncryptionStrategy {
        self.encryption.as_ref()
    }
}

/// A registered migration procedure
pub type ProcedureFn = fn(&RunnerContext) -> Result<(), MigrationError>;

/// Name-keyed registry of migration procedures
///
/// Procedures are registered once, at startup, before the migrator runs.
pub struct RegistryRunner {
    context: RunnerContext,
    procedures: HashMap<String, ProcedureFn>,
}

impl RegistryRunner {
    /// Create a runner executing procedures on the given client
    pub fn new(client: Client, encryption: Box<dyn EncryptionStrategy>) -> Self {
        Self::with_executor(Box::new(MayPostgresExecutor::new(client)), encryption)
    }

    /// Create a runner over an arbitrary executor
    pub fn with_executor(
        executor: Box<dyn DbExecutor>,
        encryption: Box<dyn EncryptionStrategy>,
    ) -> Self {
        Self {
            context: RunnerContext {
                executor,
                encryption,
            },
            procedures: HashMap::new(),
        }
    }

    /// Register a procedure under a name
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::AlreadyRegistered` if the name is taken.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        procedure: ProcedureFn,
    ) -> Result<(), MigrationError> {
        let name = name.into();
        if self.procedures.contains_key(&name) {
            return Err(MigrationError::AlreadyRegistered(name));
        }
        self.procedures.insert(name, procedure);
        Ok(())
    }

    /// Names of all registered procedures, sorted
    pub fn registered_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.procedures.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Runner for RegistryRunner {
    fn run(&self, name: &str) -> Result<(), MigrationError> {
        let procedure = self
            .procedures
            .get(name)
            .ok_or_else(|| MigrationError::NotRegistered(name.to_string()))?;
        procedure(&self.context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::DbError;
    use may_postgres::types::ToSql;
    use may_postgres::Row;

    /// Executor stub for registry tests; procedures under test never
    /// reach the database
    struct StubExecutor;

    impl DbExecutor for StubExecutor {
        fn execute(&self, _query: &str, _params: &[&dyn ToSql]) -> Result<u64, DbError> {
            Ok(0)
        }

        fn query_one(&self, _query: &str, _params: &[&dyn ToSql]) -> Result<Row, DbError> {
            Err(DbError::QueryError("no rows in stub".to_string()))
        }

        fn query_all(&self, _query: &str, _params: &[&dyn ToSql]) -> Result<Vec<Row>, DbError> {
            Ok(Vec::new())
        }
    }

    fn stub_runner() -> RegistryRunner {
        RegistryRunner::with_executor(Box::new(StubExecutor), Box::new(NoEncryption))
    }

    fn succeeding_procedure(_ctx: &RunnerContext) -> Result<(), MigrationError> {
        Ok(())
    }

    fn failing_procedure(_ctx: &RunnerContext) -> Result<(), MigrationError> {
        Err(MigrationError::Db(DbError::Other("boom".to_string())))
    }

    #[test]
    fn test_runs_registered_procedure() {
        let mut runner = stub_runner();
        runner.register("up_2000", succeeding_procedure).unwrap();
        assert!(runner.run("up_2000").is_ok());
    }

    #[test]
    fn test_unknown_name_is_an_error() {
        let runner = stub_runner();
        let err = runner.run("up_2000").unwrap_err();
        assert!(matches!(err, MigrationError::NotRegistered(_)));
    }

    #[test]
    fn test_duplicate_registration_is_an_error() {
        let mut runner = stub_runner();
        runner.register("up_2000", succeeding_procedure).unwrap();
        let err = runner.register("up_2000", failing_procedure).unwrap_err();
        assert!(matches!(err, MigrationError::AlreadyRegistered(_)));
    }

    #[test]
    fn test_procedure_errors_propagate() {
        let mut runner = stub_runner();
        runner.register("up_2000", failing_procedure).unwrap();
        assert!(runner.run("up_2000").is_err());
    }

    #[test]
    fn test_no_encryption_round_trip() {
        let strategy = NoEncryption;
        let ciphertext = strategy.encrypt(b"plaintext").unwrap();
        assert_eq!(strategy.decrypt(&ciphertext).unwrap(), b"plaintext");
    }
}
