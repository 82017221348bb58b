//! Observability for the pool and the hot read/write paths.
//!
//! Grounded in the `postgres` persistence crate's `metrics.rs`, but against
//! plain `prometheus` registration macros rather than an internal metrics
//! facade crate -- this engine is small enough not to need one.

use std::sync::LazyLock;

use prometheus::{
    register_histogram,
    register_int_counter,
    register_int_counter_vec,
    Histogram,
    HistogramTimer,
    IntCounter,
    IntCounterVec,
};

static POOL_ACQUIRE_SECONDS: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram!(
        "rra_pool_acquire_seconds",
        "Time spent acquiring a pooled Postgres connection"
    )
    .expect("metric registration should not fail")
});
pub fn pool_acquire_timer() -> HistogramTimer {
    POOL_ACQUIRE_SECONDS.start_timer()
}

static POOL_CONNECTIONS_CREATED: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "rra_pool_connections_created_total",
        "Number of new Postgres connections opened by the pool"
    )
    .expect("metric registration should not fail")
});
pub fn log_connection_created() {
    POOL_CONNECTIONS_CREATED.inc();
}

static POOL_CONNECTIONS_POISONED: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "rra_pool_connections_poisoned_total",
        "Number of pooled connections dropped after a transport error"
    )
    .expect("metric registration should not fail")
});
pub fn log_connection_poisoned() {
    POOL_CONNECTIONS_POISONED.inc();
}

static FLUSH_STATEMENTS_EXECUTED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "rra_flush_statements_executed_total",
        "Number of statements executed per flush call, by flush kind",
        &["kind"]
    )
    .expect("metric registration should not fail")
});
pub fn log_flush_statements(kind: &str, count: u64) {
    FLUSH_STATEMENTS_EXECUTED
        .with_label_values(&[kind])
        .inc_by(count);
}

static UPSERT_RETRIES: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "rra_flush_upsert_retries_total",
        "Number of times a flush had to insert a missing wide row and retry"
    )
    .expect("metric registration should not fail")
});
pub fn log_upsert_retry() {
    UPSERT_RETRIES.inc();
}

static ALLOCATOR_CALLS: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!(
        "rra_bundle_allocator_calls_total",
        "Number of bundle position allocations"
    )
    .expect("metric registration should not fail")
});
pub fn log_allocator_call() {
    ALLOCATOR_CALLS.inc();
}

static VIEW_QUERY_SECONDS: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram!(
        "rra_view_query_seconds",
        "Time to execute a versioned-view range query"
    )
    .expect("metric registration should not fail")
});
pub fn view_query_timer() -> HistogramTimer {
    VIEW_QUERY_SECONDS.start_timer()
}
