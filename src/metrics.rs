//! Optional instrumentation for executor and migrator calls.
//!
//! Compiled only with the `metrics` / `tracing` features; the executor and
//! transaction modules gate their call sites on the same features.

#[cfg(feature = "metrics")]
pub use counters::{VoyagerMetrics, METRICS};

#[cfg(feature = "metrics")]
mod counters {
    use once_cell::sync::Lazy;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    pub static METRICS: Lazy<VoyagerMetrics> = Lazy::new(VoyagerMetrics::default);

    /// Process-wide counters for database activity
    #[derive(Default)]
    pub struct VoyagerMetrics {
        queries_total: AtomicU64,
        query_errors_total: AtomicU64,
        query_micros_total: AtomicU64,
        migrations_applied_total: AtomicU64,
    }

    impl VoyagerMetrics {
        pub fn record_query(&self, elapsed: Duration) {
            self.queries_total.fetch_add(1, Ordering::Relaxed);
            self.query_micros_total
                .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        }

        pub fn record_query_error(&self) {
            self.query_errors_total.fetch_add(1, Ordering::Relaxed);
        }

        pub fn record_migration_applied(&self) {
            self.migrations_applied_total.fetch_add(1, Ordering::Relaxed);
        }

        pub fn queries_total(&self) -> u64 {
            self.queries_total.load(Ordering::Relaxed)
        }

        pub fn query_errors_total(&self) -> u64 {
            self.query_errors_total.load(Ordering::Relaxed)
        }

        pub fn migrations_applied_total(&self) -> u64 {
            self.migrations_applied_total.load(Ordering::Relaxed)
        }
    }
}

#[cfg(feature = "tracing")]
pub mod tracing_helpers {
    use tracing::{debug_span, Span};

    pub fn acquire_connection_span() -> Span {
        debug_span!("voyager.connect")
    }

    pub fn execute_query_span(query: &str) -> Span {
        debug_span!("voyager.query", query = %query)
    }

    pub fn begin_transaction_span() -> Span {
        debug_span!("voyager.transaction.begin")
    }

    pub fn commit_transaction_span() -> Span {
        debug_span!("voyager.transaction.commit")
    }

    pub fn rollback_transaction_span() -> Span {
        debug_span!("voyager.transaction.rollback")
    }

    pub fn acquire_lock_span(name: &str) -> Span {
        debug_span!("voyager.lock.acquire", name = %name)
    }
}

#[cfg(all(test, feature = "metrics"))]
mod tests {
    use super::METRICS;
    use std::time::Duration;

    #[test]
    fn test_counters_accumulate() {
        let before = METRICS.queries_total();
        METRICS.record_query(Duration::from_micros(10));
        METRICS.record_query(Duration::from_micros(20));
        assert!(METRICS.queries_total() >= before + 2);
    }
}
