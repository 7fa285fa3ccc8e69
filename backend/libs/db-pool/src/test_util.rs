//! Test doubles for exercising pool semantics without a database.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;

use crate::{ConnectionFactory, PoolError};

pub(crate) struct FakeConn;

pub(crate) struct FakeFactory {
    pub(crate) connects: AtomicU32,
    pub(crate) closes: AtomicU32,
    pub(crate) fail_first: u32,
    pub(crate) fail_after: u32,
    pub(crate) fail_probe: bool,
}

impl FakeFactory {
    pub(crate) fn reliable() -> Self {
        Self {
            connects: AtomicU32::new(0),
            closes: AtomicU32::new(0),
            fail_first: 0,
            fail_after: u32::MAX,
            fail_probe: false,
        }
    }

    /// Fail the first `n` connection attempts, then succeed.
    pub(crate) fn failing_first(n: u32) -> Self {
        Self {
            fail_first: n,
            ..Self::reliable()
        }
    }

    /// Succeed for the first `n` connection attempts, then fail.
    pub(crate) fn failing_after(n: u32) -> Self {
        Self {
            fail_after: n,
            ..Self::reliable()
        }
    }

    pub(crate) fn failing_probe() -> Self {
        Self {
            fail_probe: true,
            ..Self::reliable()
        }
    }

    pub(crate) fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn close_count(&self) -> u32 {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionFactory for FakeFactory {
    type Conn = FakeConn;

    async fn connect(&self) -> Result<FakeConn, PoolError> {
        let attempt = self.connects.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_first || attempt >= self.fail_after {
            Err(PoolError::ConnectionFailed("connection refused".into()))
        } else {
            Ok(FakeConn)
        }
    }

    async fn probe(&self, _conn: &mut FakeConn) -> Result<(), PoolError> {
        if self.fail_probe {
            Err(PoolError::ProbeFailed)
        } else {
            Ok(())
        }
    }

    async fn close(&self, _conn: FakeConn) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}
