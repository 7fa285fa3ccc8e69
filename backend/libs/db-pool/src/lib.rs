//! Database session pool management
//!
//! Hand-managed registry of database sessions shared by every service in the
//! process: eager initialization, grow-on-demand acquire, scoped release and
//! a liveness probe for the ops health contract.
//!
//! The registry sits behind one mutex; the scan-and-flip on acquire is the
//! only work done under the lock, and on-demand connection opens happen
//! outside the critical section. `acquire` never waits for a session to free
//! up — it finds an idle one or grows the pool by one.

mod factory;
mod health;
mod metrics;
mod session;
#[cfg(test)]
mod test_util;

pub use factory::{ConnectionFactory, PgConnectionFactory};
pub use health::HealthReport;
pub use session::{PooledSession, Session};

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Context;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use session::{lock_state, PoolState, Slot};

/// Postgres-backed pool, the configuration every service actually runs.
pub type PgConnectionPool = ConnectionPool<PgConnectionFactory>;

/// Database session pool configuration
#[derive(Clone)]
pub struct DbConfig {
    /// Service name for metrics labeling
    pub service_name: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    /// Sessions opened eagerly at initialization
    pub pool_size: u32,
    /// Floor below which partial initialization counts as failure
    pub min_connections: u32,
    /// Connect/socket timeout when opening a physical connection
    pub connect_timeout_secs: u64,
}

impl fmt::Debug for DbConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DbConfig")
            .field("service_name", &self.service_name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("database", &self.database)
            .field("pool_size", &self.pool_size)
            .field("min_connections", &self.min_connections)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .finish()
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            service_name: String::from("unknown"),
            host: String::from("localhost"),
            port: 5432,
            user: String::from("flightdeck"),
            password: String::new(),
            database: String::from("flightdeck"),
            pool_size: 10,
            min_connections: 1,
            connect_timeout_secs: 5,
        }
    }
}

impl DbConfig {
    /// Load configuration from environment variables. Credentials are
    /// required; everything else falls back to defaults.
    pub fn from_env(service_name: &str) -> anyhow::Result<Self> {
        Ok(Self {
            service_name: service_name.to_string(),
            host: std::env::var("DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: std::env::var("DB_PORT")
                .unwrap_or_else(|_| "5432".to_string())
                .parse()
                .context("Invalid DB_PORT")?,
            user: std::env::var("DB_USER").context("DB_USER must be set")?,
            password: std::env::var("DB_PASSWORD").context("DB_PASSWORD must be set")?,
            database: std::env::var("DB_NAME").context("DB_NAME must be set")?,
            pool_size: std::env::var("DB_POOL_SIZE")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("Invalid DB_POOL_SIZE")?,
            min_connections: std::env::var("DB_MIN_CONNECTIONS")
                .unwrap_or_else(|_| "1".to_string())
                .parse()
                .context("Invalid DB_MIN_CONNECTIONS")?,
            connect_timeout_secs: std::env::var("DB_CONNECT_TIMEOUT_SECS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .context("Invalid DB_CONNECT_TIMEOUT_SECS")?,
        })
    }

    /// Log pool configuration details
    pub fn log_config(&self) {
        info!(
            service = %self.service_name,
            host = %self.host,
            port = self.port,
            database = %self.database,
            pool_size = self.pool_size,
            min_connections = self.min_connections,
            connect_timeout_secs = self.connect_timeout_secs,
            "database pool configuration"
        );
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("connection pool is not initialized")]
    NotInitialized,

    #[error("failed to open database connection: {0}")]
    ConnectionFailed(String),

    #[error("pool initialization opened {opened} of {requested} connections (minimum {min})")]
    InsufficientConnections {
        requested: u32,
        opened: u32,
        min: u32,
    },

    #[error("statement execution failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("liveness probe returned an unexpected result")]
    ProbeFailed,
}

/// Process-wide registry of database sessions.
///
/// Constructed once at startup and injected into every collaborator; there
/// is no global instance. Lifecycle: `initialize` → acquire/release cycles →
/// `cleanup`, after which a new `initialize` may re-enter service.
pub struct ConnectionPool<F: ConnectionFactory> {
    factory: F,
    pool_size: u32,
    min_connections: u32,
    service_name: String,
    state: Arc<Mutex<PoolState<F::Conn>>>,
}

impl ConnectionPool<PgConnectionFactory> {
    /// Build a Postgres-backed pool. The pool starts uninitialized; call
    /// [`ConnectionPool::initialize`] before the first acquire.
    pub fn from_config(config: &DbConfig) -> Self {
        Self::with_factory(PgConnectionFactory::new(config), config)
    }
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    pub fn with_factory(factory: F, config: &DbConfig) -> Self {
        Self {
            factory,
            pool_size: config.pool_size,
            min_connections: config.min_connections,
            service_name: config.service_name.clone(),
            state: Arc::new(Mutex::new(PoolState::new())),
        }
    }

    /// Eagerly open the configured number of sessions.
    ///
    /// Lenient to partial failure: any count at or above the configured
    /// `min_connections` floor still succeeds, and the shortfall is made up
    /// later by on-demand growth. Idempotent — initializing an initialized
    /// pool returns its current size.
    pub async fn initialize(&self) -> Result<u32, PoolError> {
        {
            let state = lock_state(&self.state);
            if state.initialized {
                debug!(service = %self.service_name, "connection pool already initialized");
                return Ok(state.slots.len() as u32);
            }
        }

        let mut opened = Vec::with_capacity(self.pool_size as usize);
        for _ in 0..self.pool_size {
            match self.factory.connect().await {
                Ok(conn) => opened.push(conn),
                Err(e) => warn!(
                    service = %self.service_name,
                    error = %e,
                    "failed to open a connection during pool initialization"
                ),
            }
        }

        if (opened.len() as u32) < self.min_connections {
            let got = opened.len() as u32;
            error!(
                service = %self.service_name,
                opened = got,
                requested = self.pool_size,
                min = self.min_connections,
                "could not establish the minimum number of connections"
            );
            for conn in opened {
                self.factory.close(conn).await;
            }
            return Err(PoolError::InsufficientConnections {
                requested: self.pool_size,
                opened: got,
                min: self.min_connections,
            });
        }

        let surplus;
        let size;
        {
            let mut state = lock_state(&self.state);
            if state.initialized {
                // Another caller won the initialization race; keep its registry.
                size = state.slots.len() as u32;
                surplus = opened;
            } else {
                for conn in opened {
                    let id = state.next_id;
                    state.next_id += 1;
                    state.slots.push(Slot {
                        session: Some(Session { id, conn }),
                    });
                }
                state.initialized = true;
                size = state.slots.len() as u32;
                surplus = Vec::new();

                metrics::record_configured(&self.service_name, self.pool_size as i64);
                metrics::record_sizes(&self.service_name, size as i64, 0);
            }
        }

        for conn in surplus {
            self.factory.close(conn).await;
        }

        info!(
            service = %self.service_name,
            sessions = size,
            requested = self.pool_size,
            "database connection pool initialized"
        );
        Ok(size)
    }

    /// Borrow a session, growing the pool by one when none is idle.
    ///
    /// The returned handle puts the session back when dropped, so release
    /// happens on every exit path.
    pub async fn acquire(&self) -> Result<PooledSession<F>, PoolError> {
        let start = Instant::now();

        let grow_epoch = {
            let mut state = lock_state(&self.state);
            if !state.initialized {
                return Err(PoolError::NotInitialized);
            }

            // Linear scan for an idle session; fine at the sizes this pool
            // runs at.
            if let Some(slot) = state.slots.iter().position(|s| s.session.is_some()) {
                let session = state.slots[slot].session.take();
                let idle = state.idle() as i64;
                let total = state.slots.len() as i64;
                metrics::record_sizes(&self.service_name, idle, total - idle);
                metrics::observe_acquire(&self.service_name, start.elapsed().as_secs_f64());
                return Ok(PooledSession {
                    state: Arc::clone(&self.state),
                    slot,
                    epoch: state.epoch,
                    session,
                    service: self.service_name.clone(),
                });
            }

            state.epoch
        };

        // Every session is checked out: grow by one. The connection is
        // opened outside the critical section so other callers are not
        // serialized behind network I/O.
        let conn = self.factory.connect().await?;

        // Register the grown slot under the lock, then build the handle
        // outside it. The guard is confined to this block so the future stays
        // Send — it is never held across the close await on the error path.
        let grown = {
            let mut state = lock_state(&self.state);
            if !state.initialized || state.epoch != grow_epoch {
                None
            } else {
                let id = state.next_id;
                state.next_id += 1;
                state.slots.push(Slot { session: None });
                let slot = state.slots.len() - 1;
                let epoch = state.epoch;

                info!(
                    service = %self.service_name,
                    pool_size = state.slots.len(),
                    session_id = id,
                    "created a new database session on demand"
                );
                let idle = state.idle() as i64;
                let total = state.slots.len() as i64;
                metrics::record_sizes(&self.service_name, idle, total - idle);
                metrics::observe_acquire(&self.service_name, start.elapsed().as_secs_f64());
                Some((id, slot, epoch))
            }
        };

        let Some((id, slot, epoch)) = grown else {
            self.factory.close(conn).await;
            return Err(PoolError::NotInitialized);
        };

        Ok(PooledSession {
            state: Arc::clone(&self.state),
            slot,
            epoch,
            session: Some(Session { id, conn }),
            service: self.service_name.clone(),
        })
    }

    /// Probe a borrowed session and report whether the database answers.
    ///
    /// Reuses the acquire path, so a saturated pool grows by one here too.
    /// The session is released on every path; no probe error escapes
    /// unhandled.
    pub async fn check_health(&self) -> Result<(), PoolError> {
        let mut session = self.acquire().await?;
        let result = self.factory.probe(&mut session).await;
        if let Err(e) = &result {
            warn!(
                service = %self.service_name,
                error = %e,
                "database liveness probe failed"
            );
        }
        result
    }

    /// Close every idle session and clear the registry. Idempotent.
    ///
    /// Sessions checked out at this point close when their handle drops; the
    /// epoch bump keeps them from rejoining the registry.
    pub async fn cleanup(&self) {
        let sessions: Vec<Session<F::Conn>> = {
            let mut state = lock_state(&self.state);
            if !state.initialized && state.slots.is_empty() {
                return;
            }
            state.initialized = false;
            state.epoch += 1;
            state.slots.drain(..).filter_map(|slot| slot.session).collect()
        };

        let closed = sessions.len();
        for session in sessions {
            self.factory.close(session.conn).await;
        }

        metrics::record_sizes(&self.service_name, 0, 0);
        info!(service = %self.service_name, closed, "database connection pool cleaned up");
    }

    /// Total sessions in the registry (idle and checked out).
    pub fn size(&self) -> usize {
        lock_state(&self.state).slots.len()
    }

    /// Sessions currently idle.
    pub fn idle(&self) -> usize {
        lock_state(&self.state).idle()
    }

    /// Sessions currently checked out.
    pub fn in_use(&self) -> usize {
        let state = lock_state(&self.state);
        state.slots.len() - state.idle()
    }

    pub fn is_initialized(&self) -> bool {
        lock_state(&self.state).initialized
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }
}
