//! Per-Node Connection Pool
//!
//! Each event loop keeps one pool per node. The pool is only touched from
//! the loop's own thread, so it needs no locking: it is a plain struct the
//! loop owns.
//!
//! ## Accounting
//!
//! ```text
//!   live = idle + in use + reserved (being connected)
//!
//!   acquire ──► valid idle?      ── yes ─► Some(conn)       live unchanged
//!                    │ no
//!                    ▼
//!               live < max_live? ── yes ─► None (reserved)  live += 1
//!                    │ no
//!                    ▼
//!               Err(PoolError::Exhausted)
//!
//!   release ──► idle < max_idle? ── yes ─► Pooled           live unchanged
//!                    │ no
//!                    ▼
//!               Closed (dropped)                            live -= 1
//!
//!   discard ──► connection failed or reservation unused     live -= 1
//! ```
//!
//! The live count only goes down through `release` overflow, `discard` and
//! the idle-closing methods. Nothing decrements it implicitly.

use std::collections::VecDeque;
use thiserror::Error;
use tokio::time::{Duration, Instant};

/// Pool errors.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Every allowed connection is already open or reserved.
    #[error("connection pool exhausted: {max} connections in use")]
    Exhausted { max: usize },
}

/// Hooks the pool needs from a pooled connection.
pub trait PooledConnection {
    /// How long the connection has been idle at `now`.
    fn idle_for(&self, now: Instant) -> Duration;

    /// Checks the connection is still usable after sitting idle.
    fn validate(&mut self) -> bool;
}

/// What `release` did with a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    Pooled,
    Closed,
}

/// A bounded cache of idle connections plus a live count.
#[derive(Debug)]
pub struct ConnectionPool<C> {
    idle: VecDeque<C>,
    live: usize,
    max_live: usize,
    max_idle: usize,
    max_idle_time: Option<Duration>,
}

impl<C: PooledConnection> ConnectionPool<C> {
    pub fn new(max_live: usize, max_idle: usize, max_idle_time: Option<Duration>) -> Self {
        Self {
            idle: VecDeque::new(),
            live: 0,
            max_live,
            max_idle: max_idle.min(max_live),
            max_idle_time,
        }
    }

    /// Takes an idle connection, or reserves a slot for a new one.
    ///
    /// `Ok(None)` means the caller must open a connection and either hand it
    /// back through [`release`](Self::release) or give up the slot with
    /// [`discard`](Self::discard). Idle connections that sat longer than the
    /// configured limit or fail validation are handed to `closed` and
    /// skipped.
    pub fn acquire(&mut self, mut closed: impl FnMut(C)) -> Result<Option<C>, PoolError> {
        let now = Instant::now();

        while let Some(mut conn) = self.idle.pop_back() {
            let stale = self
                .max_idle_time
                .is_some_and(|limit| conn.idle_for(now) > limit);

            if !stale && conn.validate() {
                return Ok(Some(conn));
            }
            self.live = self.live.saturating_sub(1);
            closed(conn);
        }

        if self.live >= self.max_live {
            return Err(PoolError::Exhausted { max: self.max_live });
        }
        self.live += 1;
        Ok(None)
    }

    /// Returns a healthy connection after use.
    pub fn release(&mut self, conn: C) -> Release {
        if self.idle.len() < self.max_idle {
            self.idle.push_back(conn);
            Release::Pooled
        } else {
            drop(conn);
            self.live = self.live.saturating_sub(1);
            Release::Closed
        }
    }

    /// Accounts for a connection that was closed by its user, or a
    /// reservation that never produced one.
    pub fn discard(&mut self) {
        self.live = self.live.saturating_sub(1);
    }

    /// Closes idle connections unused for longer than the idle limit.
    /// Returns how many were closed.
    pub fn close_expired(&mut self) -> usize {
        let Some(limit) = self.max_idle_time else {
            return 0;
        };
        let now = Instant::now();
        let before = self.idle.len();
        // Oldest connections sit at the front.
        while self
            .idle
            .front()
            .is_some_and(|conn| conn.idle_for(now) > limit)
        {
            self.idle.pop_front();
        }
        let closed = before - self.idle.len();
        self.live = self.live.saturating_sub(closed);
        closed
    }

    /// Closes every idle connection. In-use connections are untouched and
    /// leave through `release` or `discard` as their commands finish.
    pub fn close_idle(&mut self) -> usize {
        let closed = self.idle.len();
        self.idle.clear();
        self.live = self.live.saturating_sub(closed);
        closed
    }

    pub fn live(&self) -> usize {
        self.live
    }

    pub fn idle(&self) -> usize {
        self.idle.len()
    }

    pub fn max_live(&self) -> usize {
        self.max_live
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::DropCounter;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct FakeConn {
        valid: bool,
        idle: Duration,
        _drops: DropCounter,
    }

    impl PooledConnection for FakeConn {
        fn idle_for(&self, _now: Instant) -> Duration {
            self.idle
        }

        fn validate(&mut self) -> bool {
            self.valid
        }
    }

    fn conn(drops: &Arc<AtomicUsize>) -> FakeConn {
        FakeConn {
            valid: true,
            idle: Duration::ZERO,
            _drops: DropCounter::new(drops),
        }
    }

    #[test]
    fn test_release_overflow_closes_third() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut pool = ConnectionPool::new(10, 2, None);

        for _ in 0..3 {
            assert!(pool.acquire(drop).unwrap().is_none());
        }
        assert_eq!(pool.live(), 3);

        assert_eq!(pool.release(conn(&drops)), Release::Pooled);
        assert_eq!(pool.release(conn(&drops)), Release::Pooled);
        assert_eq!(pool.release(conn(&drops)), Release::Closed);

        assert_eq!(pool.idle(), 2);
        assert_eq!(pool.live(), 2);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_acquire_reuses_idle() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut pool = ConnectionPool::new(1, 1, None);

        assert!(pool.acquire(drop).unwrap().is_none());
        pool.release(conn(&drops));

        let reused = pool.acquire(drop).unwrap();
        assert!(reused.is_some());
        assert_eq!(pool.live(), 1);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_acquire_exhausted() {
        let mut pool: ConnectionPool<FakeConn> = ConnectionPool::new(2, 2, None);
        assert!(pool.acquire(drop).unwrap().is_none());
        assert!(pool.acquire(drop).unwrap().is_none());
        assert_eq!(pool.acquire(drop).unwrap_err(), PoolError::Exhausted { max: 2 });

        pool.discard();
        assert!(pool.acquire(drop).unwrap().is_none());
    }

    #[test]
    fn test_acquire_skips_invalid_and_stale() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut pool = ConnectionPool::new(5, 5, Some(Duration::from_secs(55)));

        for _ in 0..3 {
            pool.acquire(drop).unwrap();
        }
        pool.release(conn(&drops));
        pool.release(FakeConn {
            valid: true,
            idle: Duration::from_secs(60),
            _drops: DropCounter::new(&drops),
        });
        pool.release(FakeConn {
            valid: false,
            idle: Duration::ZERO,
            _drops: DropCounter::new(&drops),
        });

        // Invalid and stale connections are closed on the way to a good one.
        let mut closed = 0;
        let got = pool.acquire(|_| closed += 1).unwrap().unwrap();
        assert!(got.valid);
        assert_eq!(closed, 2);
        assert_eq!(drops.load(Ordering::SeqCst), 2);
        assert_eq!(pool.live(), 1);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_close_expired_and_idle() {
        let drops = Arc::new(AtomicUsize::new(0));
        let mut pool = ConnectionPool::new(5, 5, Some(Duration::from_secs(10)));
        for _ in 0..3 {
            pool.acquire(drop).unwrap();
        }
        pool.release(FakeConn {
            valid: true,
            idle: Duration::from_secs(30),
            _drops: DropCounter::new(&drops),
        });
        pool.release(conn(&drops));

        assert_eq!(pool.close_expired(), 1);
        assert_eq!(pool.live(), 2);

        assert_eq!(pool.close_idle(), 1);
        assert_eq!(pool.live(), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }
}
