//! Database health report for the ops probe endpoint.

use chrono::Utc;
use serde::Serialize;

use crate::factory::ConnectionFactory;
use crate::ConnectionPool;

/// Serializable outcome of a pool liveness probe, shaped for the
/// `/health/db` endpoint consumed by ops tooling.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub service: String,
    pub database: &'static str,
    pub timestamp: String,
}

impl HealthReport {
    /// Probe the pool and build the report. Never fails; probe errors are
    /// folded into the `error`/`disconnected` status.
    pub async fn for_pool<F: ConnectionFactory>(pool: &ConnectionPool<F>) -> Self {
        let healthy = pool.check_health().await.is_ok();

        Self {
            status: if healthy { "ok" } else { "error" },
            service: pool.service_name().to_string(),
            database: if healthy { "connected" } else { "disconnected" },
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == "ok"
    }
}
