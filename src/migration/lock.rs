//! Cross-process mutual exclusion for migrations
//!
//! The whole mutating critical section, from bootstrap through the last
//! history write, runs under one named lock shared by every process in
//! the fleet. The implementation uses a session-level PostgreSQL advisory
//! lock held on a dedicated auxiliary connection, so transaction state on
//! the main connection cannot release it prematurely.

use crate::migration::MigrationError;
use may_postgres::Client;
use sha2::{Digest, Sha256};
use std::thread;
use std::time::{Duration, Instant};

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Name of the lock bounding all mutating migrator operations
pub const MIGRATION_LOCK_NAME: &str = "voyager-migrations";

/// How often a bounded acquisition re-tries the lock
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// A named cross-process lock
pub trait Lock {
    /// Block until the lock is held
    fn acquire(&mut self) -> Result<(), MigrationError>;

    /// Release the lock; releasing an unheld lock is a no-op
    fn release(&mut self) -> Result<(), MigrationError>;
}

/// Yields named cross-process locks
pub trait LockFactory {
    fn new_lock(&self, name: &str) -> Box<dyn Lock>;
}

/// Derive the stable advisory-lock key for a lock name
///
/// Every process in the fleet must map the same name to the same key; the
/// first eight bytes of the SHA-256 digest are interpreted as a big-endian
/// `i64`.
pub fn lock_key(name: &str) -> i64 {
    let digest = Sha256::digest(name.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

/// Factory for session-level advisory locks on a dedicated connection
pub struct AdvisoryLockFactory {
    client: Client,
    timeout: Option<Duration>,
}

impl AdvisoryLockFactory {
    /// Create a factory holding the auxiliary lock connection
    ///
    /// The client must not be the connection migrations run on: advisory
    /// locks are session-level, and the critical section spans multiple
    /// transactions on the main connection. Acquisition blocks until the
    /// lock is granted; see [`AdvisoryLockFactory::with_timeout`] for a
    /// bounded wait.
    pub fn new(client: Client) -> Self {
        Self {
            client,
            timeout: None,
        }
    }

    /// Create a factory whose locks give up after `timeout`
    ///
    /// A deployment that prefers failing over waiting out a stuck
    /// migrator sets `lock_timeout_seconds` in its configuration; the
    /// lock then polls `pg_try_advisory_lock` instead of blocking.
    pub fn with_timeout(client: Client, timeout: Duration) -> Self {
        Self {
            client,
            timeout: Some(timeout),
        }
    }
}

impl LockFactory for AdvisoryLockFactory {
    fn new_lock(&self, name: &str) -> Box<dyn Lock> {
        Box::new(AdvisoryLock {
            client: self.client.clone(),
            name: name.to_string(),
            key: lock_key(name),
            timeout: self.timeout,
            held: false,
        })
    }
}

/// A session-level `pg_advisory_lock` keyed by a hashed name
pub struct AdvisoryLock {
    client: Client,
    name: String,
    key: i64,
    timeout: Option<Duration>,
    held: bool,
}

impl AdvisoryLock {
    fn acquire_blocking(&self) -> Result<(), MigrationError> {
        // pg_advisory_lock blocks server-side until the lock is granted
        self.client
            .query("SELECT pg_advisory_lock($1)", &[&self.key])
            .map_err(|e| MigrationError::LockUnavailable(e.to_string()))?;
        Ok(())
    }

    /// Poll `pg_try_advisory_lock` until it succeeds or the deadline
    /// passes
    fn acquire_with_timeout(&self, timeout: Duration) -> Result<(), MigrationError> {
        let deadline = Instant::now() + timeout;
        loop {
            let row = self
                .client
                .query_one("SELECT pg_try_advisory_lock($1)", &[&self.key])
                .map_err(|e| MigrationError::LockUnavailable(e.to_string()))?;
            let acquired: bool = row.get(0);
            if acquired {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(MigrationError::LockUnavailable(format!(
                    "timed out after {timeout:?} waiting for lock '{}'; \
                     another process may be running migrations",
                    self.name
                )));
            }
            thread::sleep(RETRY_INTERVAL);
        }
    }
}

impl Lock for AdvisoryLock {
    fn acquire(&mut self) -> Result<(), MigrationError> {
        if self.held {
            return Ok(());
        }

        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::acquire_lock_span(&self.name).entered();

        log::debug!("acquiring migration lock '{}'", self.name);
        match self.timeout {
            Some(timeout) => self.acquire_with_timeout(timeout)?,
            None => self.acquire_blocking()?,
        }
        self.held = true;
        Ok(())
    }

    fn release(&mut self) -> Result<(), MigrationError> {
        if !self.held {
            return Ok(());
        }

        self.client
            .query("SELECT pg_advisory_unlock($1)", &[&self.key])
            .map_err(|e| MigrationError::LockUnavailable(e.to_string()))?;
        self.held = false;
        log::debug!("released migration lock '{}'", self.name);
        Ok(())
    }
}

/// Guard that releases the migration lock when dropped
///
/// Ensures the lock is released even when a migration errors out of the
/// critical section.
pub struct MigrationLockGuard {
    lock: Box<dyn Lock>,
}

impl MigrationLockGuard {
    /// Acquire the lock and wrap it in a guard
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::LockUnavailable` if acquisition fails for
    /// a non-retryable reason (e.g. connection loss).
    pub fn new(mut lock: Box<dyn Lock>) -> Result<Self, MigrationError> {
        lock.acquire()?;
        Ok(Self { lock })
    }
}

impl Drop for MigrationLockGuard {
    fn drop(&mut self) {
        // Errors during drop cannot be propagated
        let _ = self.lock.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_lock_key_is_stable() {
        assert_eq!(lock_key(MIGRATION_LOCK_NAME), lock_key(MIGRATION_LOCK_NAME));
    }

    #[test]
    fn test_lock_key_differs_per_name() {
        assert_ne!(lock_key("voyager-migrations"), lock_key("something-else"));
    }

    struct CountingLock {
        acquires: Arc<AtomicUsize>,
        releases: Arc<AtomicUsize>,
        held: bool,
    }

    impl Lock for CountingLock {
        fn acquire(&mut self) -> Result<(), MigrationError> {
            if !self.held {
                self.acquires.fetch_add(1, Ordering::SeqCst);
                self.held = true;
            }
            Ok(())
        }

        fn release(&mut self) -> Result<(), MigrationError> {
            if self.held {
                self.releases.fetch_add(1, Ordering::SeqCst);
                self.held = false;
            }
            Ok(())
        }
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let acquires = Arc::new(AtomicUsize::new(0));
        let releases = Arc::new(AtomicUsize::new(0));

        let lock = Box::new(CountingLock {
            acquires: Arc::clone(&acquires),
            releases: Arc::clone(&releases),
            held: false,
        });

        let guard = MigrationLockGuard::new(lock).unwrap();
        assert_eq!(acquires.load(Ordering::SeqCst), 1);
        assert_eq!(releases.load(Ordering::SeqCst), 0);

        drop(guard);
        assert_eq!(releases.load(Ordering::SeqCst), 1);
    }
}
