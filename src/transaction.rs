//! Transaction support for migration execution.
//!
//! Transactional SQL migrations are not executed with their own `BEGIN`
//! and `COMMIT` statements; the parser strips those and the executor
//! synthesizes the transaction here instead. History writes for
//! non-transactional and registered migrations also go through a short
//! [`Transaction`].

use crate::executor::{DbError, DbExecutor};
use may_postgres::types::ToSql;
use may_postgres::{Client, Error as PostgresError, Row};
use std::fmt;

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Transaction error type
#[derive(Debug)]
pub enum TransactionError {
    /// PostgreSQL error from `may_postgres`
    PostgresError(PostgresError),
    /// Transaction already committed or rolled back
    TransactionClosed,
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionError::PostgresError(e) => {
                write!(f, "PostgreSQL error: {e}")
            }
            TransactionError::TransactionClosed => {
                write!(f, "Transaction has already been committed or rolled back")
            }
        }
    }
}

impl std::error::Error for TransactionError {}

impl From<PostgresError> for TransactionError {
    fn from(err: PostgresError) -> Self {
        TransactionError::PostgresError(err)
    }
}

impl From<TransactionError> for DbError {
    fn from(err: TransactionError) -> Self {
        match err {
            TransactionError::PostgresError(e) => DbError::PostgresError(e),
            TransactionError::TransactionClosed => {
                DbError::Other("Transaction closed".to_string())
            }
        }
    }
}

/// A database transaction
///
/// All operations within a transaction are either committed together or
/// rolled back together. The transaction owns a cloned client handle;
/// transaction state is connection-level, so the handle must not be shared
/// with concurrent statements while the transaction is open.
pub struct Transaction {
    client: Client,
    closed: bool,
}

impl Transaction {
    /// Start a new transaction on the given client
    ///
    /// # Errors
    ///
    /// Returns `TransactionError` if the `BEGIN` statement fails.
    pub fn begin(client: Client) -> Result<Self, TransactionError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::begin_transaction_span().entered();

        client
            .execute("BEGIN", &[])
            .map_err(TransactionError::from)?;

        Ok(Self {
            client,
            closed: false,
        })
    }

    /// Commit the transaction
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction has already been closed or the
    /// `COMMIT` statement fails.
    pub fn commit(mut self) -> Result<(), TransactionError> {
        if self.closed {
            return Err(TransactionError::TransactionClosed);
        }

        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::commit_transaction_span().entered();

        self.client
            .execute("COMMIT", &[])
            .map_err(TransactionError::from)?;

        self.closed = true;
        Ok(())
    }

    /// Rollback the transaction
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction has already been closed or the
    /// `ROLLBACK` statement fails.
    pub fn rollback(mut self) -> Result<(), TransactionError> {
        if self.closed {
            return Err(TransactionError::TransactionClosed);
        }

        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::rollback_transaction_span().entered();

        self.client
            .execute("ROLLBACK", &[])
            .map_err(TransactionError::from)?;

        self.closed = true;
        Ok(())
    }

    /// Check if the transaction is closed
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Run one client call after checking the transaction is still open
    fn guarded<T>(
        &self,
        query: &str,
        call: impl FnOnce(&Client) -> Result<T, PostgresError>,
    ) -> Result<T, DbError> {
        if self.closed {
            return Err(DbError::Other("Transaction is closed".to_string()));
        }

        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::execute_query_span(query).entered();

        log::trace!("executing in transaction: {query}");

        call(&self.client).map_err(DbError::PostgresError)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        // Roll back an open transaction; errors during drop cannot be
        // propagated
        if !self.closed {
            let _ = self.client.execute("ROLLBACK", &[]);
            self.closed = true;
        }
    }
}

impl DbExecutor for Transaction {
    fn execute(&self, query: &str, params: &[&dyn ToSql]) -> Result<u64, DbError> {
        self.guarded(query, |client| client.execute(query, params))
    }

    fn query_one(&self, query: &str, params: &[&dyn ToSql]) -> Result<Row, DbError> {
        self.guarded(query, |client| client.query_one(query, params))
    }

    fn query_all(&self, query: &str, params: &[&dyn ToSql]) -> Result<Vec<Row>, DbError> {
        self.guarded(query, |client| client.query(query, params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_error_display() {
        let err = TransactionError::TransactionClosed;
        assert!(err
            .to_string()
            .contains("Transaction has already been committed"));
    }

    #[test]
    fn test_transaction_error_conversion() {
        let err = TransactionError::TransactionClosed;
        let db_err: DbError = err.into();
        assert!(db_err.to_string().contains("Transaction closed"));
    }
}
