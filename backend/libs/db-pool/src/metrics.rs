//! Prometheus metrics for the database session pool.
//!
//! Tracks session counts by state and acquire latency.

use prometheus::{register_histogram_vec, register_int_gauge_vec, HistogramVec, IntGaugeVec};

lazy_static::lazy_static! {
    /// Session count by state (idle/active/configured)
    static ref DB_POOL_SESSIONS: IntGaugeVec = register_int_gauge_vec!(
        "db_pool_sessions",
        "Database pool session count by state",
        &["service", "state"]
    ).expect("Prometheus metrics registration should succeed at startup");

    /// Time to acquire a session from the pool
    static ref DB_POOL_ACQUIRE_DURATION: HistogramVec = register_histogram_vec!(
        "db_pool_acquire_duration_seconds",
        "Time to acquire a session from the pool",
        &["service"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]
    ).expect("Prometheus metrics registration should succeed at startup");
}

/// Update the idle/active gauges (called on acquire, release and cleanup).
pub(crate) fn record_sizes(service: &str, idle: i64, active: i64) {
    DB_POOL_SESSIONS
        .with_label_values(&[service, "idle"])
        .set(idle);

    DB_POOL_SESSIONS
        .with_label_values(&[service, "active"])
        .set(active);
}

/// Record the configured initial pool size (set once per initialize).
pub(crate) fn record_configured(service: &str, configured: i64) {
    DB_POOL_SESSIONS
        .with_label_values(&[service, "configured"])
        .set(configured);
}

/// Record how long an acquire took, including on-demand growth.
pub(crate) fn observe_acquire(service: &str, seconds: f64) {
    DB_POOL_ACQUIRE_DURATION
        .with_label_values(&[service])
        .observe(seconds);
}
