//! Database execution abstraction over `may_postgres`.
//!
//! Provides the [`DbExecutor`] trait that the migrator and its helpers use
//! for all database round-trips, so that a direct client, a transaction,
//! or a test stub can be used interchangeably.

use may_postgres::types::ToSql;
use may_postgres::{Client, Error as PostgresError, Row};
use std::fmt;
use std::time::Instant;

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;
#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Executor error type
#[derive(Debug)]
pub enum DbError {
    /// PostgreSQL error from `may_postgres`
    PostgresError(PostgresError),
    /// Query execution error
    QueryError(String),
    /// Other execution errors
    Other(String),
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbError::PostgresError(e) => {
                write!(f, "PostgreSQL error: {e}")
            }
            DbError::QueryError(s) => {
                write!(f, "Query error: {s}")
            }
            DbError::Other(s) => {
                write!(f, "Execution error: {s}")
            }
        }
    }
}

impl std::error::Error for DbError {}

impl From<PostgresError> for DbError {
    fn from(err: PostgresError) -> Self {
        DbError::PostgresError(err)
    }
}

/// Trait for executing database operations
///
/// All migrator round-trips go through this trait. Suspension points are
/// database round-trips only; calls block the current coroutine/thread
/// until the server responds.
pub trait DbExecutor {
    /// Execute a SQL statement and return the number of rows affected
    fn execute(&self, query: &str, params: &[&dyn ToSql]) -> Result<u64, DbError>;

    /// Execute a query and return a single row
    ///
    /// Errors if the query returns zero or more than one row. Extract
    /// values from the row with `.get(index)`.
    fn query_one(&self, query: &str, params: &[&dyn ToSql]) -> Result<Row, DbError>;

    /// Execute a query and return all rows
    fn query_all(&self, query: &str, params: &[&dyn ToSql]) -> Result<Vec<Row>, DbError>;
}

/// Implementation of [`DbExecutor`] for `may_postgres::Client`
///
/// This is the primary executor implementation that directly uses a
/// `may_postgres::Client`.
pub struct MayPostgresExecutor {
    client: Client,
}

impl MayPostgresExecutor {
    /// Create a new executor from a `may_postgres::Client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Get a reference to the underlying client
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Consume the executor and return the underlying client
    pub fn into_client(self) -> Client {
        self.client
    }

    /// Run one client call with the crate's instrumentation around it
    ///
    /// All three `DbExecutor` methods funnel through here so spans,
    /// timing, and error counting stay in one place.
    fn instrumented<T>(
        &self,
        query: &str,
        call: impl FnOnce(&Client) -> Result<T, PostgresError>,
    ) -> Result<T, DbError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::execute_query_span(query).entered();

        log::trace!("executing: {query}");

        let start = Instant::now();
        let result = call(&self.client);
        let _elapsed = start.elapsed();

        #[cfg(feature = "metrics")]
        {
            METRICS.record_query(_elapsed);
            if result.is_err() {
                METRICS.record_query_error();
            }
        }

        result.map_err(DbError::PostgresError)
    }
}

impl DbExecutor for MayPostgresExecutor {
    fn execute(&self, query: &str, params: &[&dyn ToSql]) -> Result<u64, DbError> {
        self.instrumented(query, |client| client.execute(query, params))
    }

    fn query_one(&self, query: &str, params: &[&dyn ToSql]) -> Result<Row, DbError> {
        self.instrumented(query, |client| client.query_one(query, params))
    }

    fn query_all(&self, query: &str, params: &[&dyn ToSql]) -> Result<Vec<Row>, DbError> {
        self.instrumented(query, |client| client.query(query, params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_error_display() {
        let err = DbError::QueryError("test error".to_string());
        assert!(err.to_string().contains("Query error"));

        let err = DbError::Other("boom".to_string());
        assert!(err.to_string().contains("Execution error"));
    }
}
