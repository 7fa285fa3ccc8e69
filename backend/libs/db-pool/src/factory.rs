//! Connection factory seam between the pool and the database driver.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgConnectOptions;
use sqlx::{ConnectOptions, Connection, PgConnection};
use tracing::{debug, error};

use crate::{DbConfig, PoolError};

/// Opens, probes and closes one physical connection.
///
/// The pool itself never talks to the driver directly; everything
/// driver-specific goes through this trait so the registry semantics can be
/// exercised against a fake in tests.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    type Conn: Send + 'static;

    /// Open a new physical connection with the configured connect timeout.
    async fn connect(&self) -> Result<Self::Conn, PoolError>;

    /// Run the liveness probe on an open connection.
    async fn probe(&self, conn: &mut Self::Conn) -> Result<(), PoolError>;

    /// Close the connection gracefully. Close failures are logged, not
    /// surfaced; there is nothing a caller can do with a half-dead socket.
    async fn close(&self, conn: Self::Conn);
}

/// PostgreSQL connection factory backed by sqlx.
pub struct PgConnectionFactory {
    options: PgConnectOptions,
    connect_timeout: Duration,
}

impl PgConnectionFactory {
    pub fn new(config: &DbConfig) -> Self {
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .username(&config.user)
            .password(&config.password)
            .database(&config.database);

        Self {
            options,
            connect_timeout: Duration::from_secs(config.connect_timeout_secs),
        }
    }
}

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    type Conn = PgConnection;

    async fn connect(&self) -> Result<PgConnection, PoolError> {
        debug!(
            host = %self.options.get_host(),
            database = ?self.options.get_database(),
            "opening database connection"
        );

        match tokio::time::timeout(self.connect_timeout, self.options.connect()).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => {
                error!(error = %e, "failed to open database connection");
                Err(PoolError::ConnectionFailed(e.to_string()))
            }
            Err(_) => {
                error!(
                    timeout_secs = self.connect_timeout.as_secs(),
                    "database connection attempt timed out"
                );
                Err(PoolError::ConnectionFailed(format!(
                    "connect timed out after {}s",
                    self.connect_timeout.as_secs()
                )))
            }
        }
    }

    async fn probe(&self, conn: &mut PgConnection) -> Result<(), PoolError> {
        let query = sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(&mut *conn);

        // The probe honors the same timeout as the connect path so the
        // health contract returns within the configured socket timeout.
        let value = match tokio::time::timeout(self.connect_timeout, query).await {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => return Err(PoolError::Query(e)),
            Err(_) => {
                return Err(PoolError::ConnectionFailed(format!(
                    "liveness probe timed out after {}s",
                    self.connect_timeout.as_secs()
                )))
            }
        };

        if value == 1 {
            Ok(())
        } else {
            Err(PoolError::ProbeFailed)
        }
    }

    async fn close(&self, conn: PgConnection) {
        if let Err(e) = conn.close().await {
            debug!(error = %e, "error closing database connection");
        }
    }
}
