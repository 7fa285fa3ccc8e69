//! Pooled sessions and the scoped-acquisition handle.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};

use sqlx::postgres::PgRow;
use tracing::error;

use crate::factory::{ConnectionFactory, PgConnectionFactory};
use crate::{metrics, PoolError};

/// One managed database session: an owned connection plus the registry slot
/// that tracks whether it is checked out.
pub struct Session<C> {
    pub(crate) id: u32,
    pub(crate) conn: C,
}

impl<C> Session<C> {
    /// Identity of this session within the pool, stable for its lifetime.
    pub fn id(&self) -> u32 {
        self.id
    }
}

/// A registry slot. `None` means the session is checked out.
pub(crate) struct Slot<C> {
    pub(crate) session: Option<Session<C>>,
}

pub(crate) struct PoolState<C> {
    pub(crate) slots: Vec<Slot<C>>,
    pub(crate) initialized: bool,
    /// Bumped on every cleanup so handles from a previous generation close
    /// their connection instead of rejoining the registry.
    pub(crate) epoch: u64,
    pub(crate) next_id: u32,
}

impl<C> PoolState<C> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            initialized: false,
            epoch: 0,
            next_id: 0,
        }
    }

    pub(crate) fn idle(&self) -> usize {
        self.slots.iter().filter(|s| s.session.is_some()).count()
    }
}

/// Registry mutations are single-step, so the state behind a poisoned lock is
/// still consistent and the pool keeps operating.
pub(crate) fn lock_state<C>(state: &Mutex<PoolState<C>>) -> MutexGuard<'_, PoolState<C>> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A session borrowed from the pool.
///
/// Dereferences to the raw connection, and returns the session to its slot
/// when dropped — on every exit path, including early returns and panics. A
/// handle outliving `cleanup` closes its connection instead.
pub struct PooledSession<F: ConnectionFactory> {
    pub(crate) state: Arc<Mutex<PoolState<F::Conn>>>,
    pub(crate) slot: usize,
    pub(crate) epoch: u64,
    pub(crate) session: Option<Session<F::Conn>>,
    pub(crate) service: String,
}

impl<F: ConnectionFactory> PooledSession<F> {
    pub fn session_id(&self) -> u32 {
        self.session
            .as_ref()
            .expect("BUG: pooled session used after return to pool")
            .id
    }
}

impl<F: ConnectionFactory> Deref for PooledSession<F> {
    type Target = F::Conn;

    fn deref(&self) -> &F::Conn {
        &self
            .session
            .as_ref()
            .expect("BUG: pooled session used after return to pool")
            .conn
    }
}

impl<F: ConnectionFactory> DerefMut for PooledSession<F> {
    fn deref_mut(&mut self) -> &mut F::Conn {
        &mut self
            .session
            .as_mut()
            .expect("BUG: pooled session used after return to pool")
            .conn
    }
}

impl<F: ConnectionFactory> Drop for PooledSession<F> {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };

        let mut state = lock_state(&self.state);
        if state.epoch == self.epoch && state.initialized {
            state.slots[self.slot].session = Some(session);
            let idle = state.idle() as i64;
            let total = state.slots.len() as i64;
            metrics::record_sizes(&self.service, idle, total - idle);
        }
        // Otherwise the pool was cleaned up while this session was out; the
        // connection is dropped here rather than rejoining the registry.
    }
}

impl PooledSession<PgConnectionFactory> {
    /// Execute a statement, returning the number of rows affected.
    pub async fn execute(&mut self, statement: &str) -> Result<u64, PoolError> {
        match sqlx::query(statement).execute(&mut **self).await {
            Ok(done) => Ok(done.rows_affected()),
            Err(e) => {
                error!(statement, error = %e, "statement execution failed");
                Err(PoolError::Query(e))
            }
        }
    }

    /// Run a query expected to yield exactly one row.
    pub async fn fetch_one(&mut self, statement: &str) -> Result<PgRow, PoolError> {
        match sqlx::query(statement).fetch_one(&mut **self).await {
            Ok(row) => Ok(row),
            Err(e) => {
                error!(statement, error = %e, "statement execution failed");
                Err(PoolError::Query(e))
            }
        }
    }

    /// Run a query yielding zero or one row.
    pub async fn fetch_optional(&mut self, statement: &str) -> Result<Option<PgRow>, PoolError> {
        match sqlx::query(statement).fetch_optional(&mut **self).await {
            Ok(row) => Ok(row),
            Err(e) => {
                error!(statement, error = %e, "statement execution failed");
                Err(PoolError::Query(e))
            }
        }
    }

    /// Run a query yielding any number of rows.
    pub async fn fetch_all(&mut self, statement: &str) -> Result<Vec<PgRow>, PoolError> {
        match sqlx::query(statement).fetch_all(&mut **self).await {
            Ok(rows) => Ok(rows),
            Err(e) => {
                error!(statement, error = %e, "statement execution failed");
                Err(PoolError::Query(e))
            }
        }
    }
}
