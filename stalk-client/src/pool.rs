//! # Connection Pool
//!
//! Purpose: Share a bounded set of connections between threads, reuse idle
//! ones, age out stale ones, and hand each caller a lease that returns its
//! connection when closed or dropped.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Idle connections are kept most-recent-first and
//!    reused before dialing.
//! 2. **Minimal Locking**: The mutex guards only the bookkeeping. Dialing,
//!    health checks and closing run with the lock released.
//! 3. **Admission Control**: `max_active` caps open connections. Callers
//!    either fail fast or wait on a condition variable.
//! 4. **Captured Faults**: `get` never fails itself; an acquisition fault is
//!    carried by the lease and returned by every call on it.

use std::collections::{BTreeMap, VecDeque};
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Deserialize;
use tracing::debug;

use crate::conn::{Conn, ConnConfig};
use crate::error::{StalkError, StalkResult};
use crate::resp::Job;

/// Operations the pool and its leases need from a connection.
pub trait JobConn: Send {
    /// Closes the connection for good.
    fn close(self) -> StalkResult<()>
    where
        Self: Sized;

    fn delete(&mut self, id: u64) -> StalkResult<()>;
    fn release(&mut self, id: u64, pri: u32, delay: Duration) -> StalkResult<()>;
    fn bury(&mut self, id: u64, pri: u32) -> StalkResult<()>;
    fn touch(&mut self, id: u64) -> StalkResult<()>;
    fn peek(&mut self, id: u64) -> StalkResult<Job>;
    fn stats(&mut self) -> StalkResult<BTreeMap<String, String>>;
    fn stats_job(&mut self, id: u64) -> StalkResult<BTreeMap<String, String>>;
    fn list_tubes(&mut self) -> StalkResult<Vec<String>>;
    fn put(&mut self, body: &[u8], pri: u32, delay: Duration, ttr: Duration) -> StalkResult<u64>;
    fn peek_ready(&mut self) -> StalkResult<Job>;
    fn peek_delayed(&mut self) -> StalkResult<Job>;
    fn peek_buried(&mut self) -> StalkResult<Job>;
    fn kick(&mut self, bound: u64) -> StalkResult<u64>;
    fn pause(&mut self, delay: Duration) -> StalkResult<()>;
    fn use_tube(&mut self, name: &str) -> StalkResult<()>;
    fn reserve(&mut self, timeout: Option<Duration>) -> StalkResult<Job>;
}

impl JobConn for Conn {
    fn close(self) -> StalkResult<()> {
        Conn::close(self)
    }

    fn delete(&mut self, id: u64) -> StalkResult<()> {
        Conn::delete(self, id)
    }

    fn release(&mut self, id: u64, pri: u32, delay: Duration) -> StalkResult<()> {
        Conn::release(self, id, pri, delay)
    }

    fn bury(&mut self, id: u64, pri: u32) -> StalkResult<()> {
        Conn::bury(self, id, pri)
    }

    fn touch(&mut self, id: u64) -> StalkResult<()> {
        Conn::touch(self, id)
    }

    fn peek(&mut self, id: u64) -> StalkResult<Job> {
        Conn::peek(self, id)
    }

    fn stats(&mut self) -> StalkResult<BTreeMap<String, String>> {
        Conn::stats(self)
    }

    fn stats_job(&mut self, id: u64) -> StalkResult<BTreeMap<String, String>> {
        Conn::stats_job(self, id)
    }

    fn list_tubes(&mut self) -> StalkResult<Vec<String>> {
        Conn::list_tubes(self)
    }

    fn put(&mut self, body: &[u8], pri: u32, delay: Duration, ttr: Duration) -> StalkResult<u64> {
        Conn::put(self, body, pri, delay, ttr)
    }

    fn peek_ready(&mut self) -> StalkResult<Job> {
        Conn::peek_ready(self)
    }

    fn peek_delayed(&mut self) -> StalkResult<Job> {
        Conn::peek_delayed(self)
    }

    fn peek_buried(&mut self) -> StalkResult<Job> {
        Conn::peek_buried(self)
    }

    fn kick(&mut self, bound: u64) -> StalkResult<u64> {
        Conn::kick(self, bound)
    }

    fn pause(&mut self, delay: Duration) -> StalkResult<()> {
        self.pause_tube(delay)
    }

    fn use_tube(&mut self, name: &str) -> StalkResult<()> {
        Conn::use_tube(self, name)
    }

    fn reserve(&mut self, timeout: Option<Duration>) -> StalkResult<Job> {
        Conn::reserve(self, timeout)
    }
}

/// Pool limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of idle connections to keep.
    pub max_idle: usize,
    /// Maximum open connections (idle + leased); zero means no limit.
    pub max_active: usize,
    /// Idle connections older than this are closed instead of reused.
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Option<Duration>,
    /// Block in `get` when the pool is at `max_active`.
    pub wait: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            max_idle: 8,
            max_active: 0,
            idle_timeout: None,
            wait: false,
        }
    }
}

type DialFn<C> = dyn Fn() -> StalkResult<C> + Send + Sync;
type CheckFn<C> = dyn Fn(&mut C, Instant) -> StalkResult<()> + Send + Sync;

struct IdleConn<C> {
    conn: C,
    returned: Instant,
}

struct PoolState<C> {
    // Most recently returned at the front.
    idle: VecDeque<IdleConn<C>>,
    active: usize,
    closed: bool,
}

struct PoolInner<C> {
    config: PoolConfig,
    dial: Box<DialFn<C>>,
    test_on_borrow: Option<Box<CheckFn<C>>>,
    state: Mutex<PoolState<C>>,
    available: Condvar,
}

/// Thread-safe pool of connections.
///
/// Cloning is cheap; clones share the same connections.
pub struct Pool<C: JobConn> {
    inner: Arc<PoolInner<C>>,
}

impl<C: JobConn> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Pool {
            inner: self.inner.clone(),
        }
    }
}

impl Pool<Conn> {
    /// Pool of TCP connections to `addr`.
    pub fn tcp(addr: impl Into<String>, conn_config: ConnConfig, config: PoolConfig) -> Self {
        let addr = addr.into();
        Pool::new(config, move || Conn::dial_with_config(addr.clone(), conn_config.clone()))
    }
}

impl<C: JobConn> Pool<C> {
    /// Creates a pool that opens connections with `dial`.
    pub fn new<F>(config: PoolConfig, dial: F) -> Self
    where
        F: Fn() -> StalkResult<C> + Send + Sync + 'static,
    {
        Pool::builder(dial).config(config).build()
    }

    pub fn builder<F>(dial: F) -> PoolBuilder<C>
    where
        F: Fn() -> StalkResult<C> + Send + Sync + 'static,
    {
        PoolBuilder {
            config: PoolConfig::default(),
            dial: Box::new(dial),
            test_on_borrow: None,
        }
    }

    /// Leases a connection.
    ///
    /// Acquisition faults (dial failure, exhausted or closed pool) are stored
    /// in the lease; check `LeasedConn::err` or let the first call return it.
    pub fn get(&self) -> LeasedConn<C> {
        let lease = match self.inner.acquire() {
            Ok(conn) => Lease::Live(conn),
            Err(err) => Lease::Failed(err),
        };
        LeasedConn {
            pool: self.inner.clone(),
            lease,
            broken: false,
        }
    }

    /// Open connections, idle and leased.
    pub fn active_count(&self) -> usize {
        self.inner.state.lock().active
    }

    pub fn idle_count(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Closes every idle connection and refuses further `get`s.
    ///
    /// Leased connections are closed as they come back. Blocked `get`s wake
    /// and fail with `PoolClosed`.
    pub fn close(&self) -> StalkResult<()> {
        let drained: Vec<IdleConn<C>> = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            let drained: Vec<_> = state.idle.drain(..).collect();
            state.active -= drained.len();
            drained
        };
        self.inner.available.notify_all();

        debug!(idle = drained.len(), "closing pool");
        for idle in drained {
            close_quietly(idle.conn, "pool closed");
        }
        Ok(())
    }
}

/// Builder for `Pool`.
pub struct PoolBuilder<C> {
    config: PoolConfig,
    dial: Box<DialFn<C>>,
    test_on_borrow: Option<Box<CheckFn<C>>>,
}

impl<C: JobConn> PoolBuilder<C> {
    pub fn config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    pub fn max_idle(mut self, max_idle: usize) -> Self {
        self.config.max_idle = max_idle;
        self
    }

    pub fn max_active(mut self, max_active: usize) -> Self {
        self.config.max_active = max_active;
        self
    }

    pub fn idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.config.idle_timeout = Some(idle_timeout);
        self
    }

    pub fn wait(mut self, wait: bool) -> Self {
        self.config.wait = wait;
        self
    }

    /// Health check run on an idle connection before it is leased.
    ///
    /// Receives the instant the connection was returned to the pool. A
    /// failing connection is closed and the next one is tried.
    pub fn test_on_borrow<F>(mut self, check: F) -> Self
    where
        F: Fn(&mut C, Instant) -> StalkResult<()> + Send + Sync + 'static,
    {
        self.test_on_borrow = Some(Box::new(check));
        self
    }

    pub fn build(self) -> Pool<C> {
        let state = PoolState {
            idle: VecDeque::with_capacity(self.config.max_idle),
            active: 0,
            closed: false,
        };
        Pool {
            inner: Arc::new(PoolInner {
                config: self.config,
                dial: self.dial,
                test_on_borrow: self.test_on_borrow,
                state: Mutex::new(state),
                available: Condvar::new(),
            }),
        }
    }
}

impl<C: JobConn> PoolInner<C> {
    fn acquire(&self) -> StalkResult<C> {
        let mut state = self.state.lock();
        loop {
            self.prune(&mut state);

            while let Some(IdleConn { mut conn, returned }) = state.idle.pop_front() {
                let Some(check) = &self.test_on_borrow else {
                    return Ok(conn);
                };
                match MutexGuard::unlocked(&mut state, || check(&mut conn, returned)) {
                    Ok(()) => return Ok(conn),
                    Err(err) => {
                        debug!(error = %err, "pooled connection failed health check");
                        MutexGuard::unlocked(&mut state, || close_quietly(conn, "failed health check"));
                        state.active -= 1;
                        self.available.notify_all();
                    }
                }
            }

            if state.closed {
                return Err(StalkError::PoolClosed);
            }

            if self.config.max_active == 0 || state.active < self.config.max_active {
                state.active += 1;
                debug!(active = state.active, "dialing pooled connection");
                drop(state);
                return match (self.dial)() {
                    Ok(conn) => Ok(conn),
                    Err(err) => {
                        self.state.lock().active -= 1;
                        self.available.notify_all();
                        Err(err)
                    }
                };
            }

            if !self.config.wait {
                return Err(StalkError::PoolExhausted);
            }
            self.available.wait(&mut state);
        }
    }

    /// Closes idle connections older than `idle_timeout`, oldest first.
    fn prune(&self, state: &mut MutexGuard<'_, PoolState<C>>) {
        let Some(timeout) = self.config.idle_timeout else {
            return;
        };
        while state.idle.back().is_some_and(|idle| idle.returned.elapsed() >= timeout) {
            let Some(stale) = state.idle.pop_back() else {
                break;
            };
            state.active -= 1;
            self.available.notify_all();
            MutexGuard::unlocked(state, || close_quietly(stale.conn, "idle timeout"));
        }
    }

    /// Takes a connection back from a lease.
    fn put(&self, conn: C) {
        let mut state = self.state.lock();
        if state.closed {
            state.active -= 1;
            drop(state);
            close_quietly(conn, "pool closed");
        } else {
            state.idle.push_front(IdleConn {
                conn,
                returned: Instant::now(),
            });
            let evicted = if state.idle.len() > self.config.max_idle {
                state.active -= 1;
                state.idle.pop_back()
            } else {
                None
            };
            drop(state);
            if let Some(evicted) = evicted {
                close_quietly(evicted.conn, "idle overflow");
            }
        }
        self.available.notify_all();
    }

    /// Drops a connection that failed mid-command instead of reusing it.
    fn discard(&self, conn: C) {
        self.state.lock().active -= 1;
        close_quietly(conn, "connection fault");
        self.available.notify_all();
    }
}

fn close_quietly<C: JobConn>(conn: C, reason: &'static str) {
    if let Err(err) = conn.close() {
        debug!(reason, error = %err, "failed to close pooled connection");
    }
}

enum Lease<C> {
    Live(C),
    Failed(StalkError),
    Closed,
}

/// A connection leased from a `Pool`.
///
/// Closing (or dropping) the lease returns the connection to the pool. After
/// that every call fails with `ConnClosed`. A connection that hit an I/O fault
/// is closed instead of going back to the idle list.
pub struct LeasedConn<C: JobConn> {
    pool: Arc<PoolInner<C>>,
    lease: Lease<C>,
    broken: bool,
}

impl<C: JobConn> LeasedConn<C> {
    /// Fault captured when the lease was acquired, if any.
    pub fn err(&self) -> Option<&StalkError> {
        match &self.lease {
            Lease::Failed(err) => Some(err),
            _ => None,
        }
    }

    /// Underlying connection.
    pub fn conn_mut(&mut self) -> StalkResult<&mut C> {
        match &mut self.lease {
            Lease::Live(conn) => Ok(conn),
            Lease::Failed(err) => Err(err.clone()),
            Lease::Closed => Err(StalkError::ConnClosed),
        }
    }

    /// Returns the connection to the pool.
    ///
    /// A lease holding an acquisition fault returns that fault once. Closing
    /// twice is a no-op.
    pub fn close(&mut self) -> StalkResult<()> {
        match mem::replace(&mut self.lease, Lease::Closed) {
            Lease::Live(conn) if self.broken => self.pool.discard(conn),
            Lease::Live(conn) => self.pool.put(conn),
            Lease::Failed(err) => return Err(err),
            Lease::Closed => {}
        }
        Ok(())
    }

    fn run<T>(&mut self, op: impl FnOnce(&mut C) -> StalkResult<T>) -> StalkResult<T> {
        let result = op(self.conn_mut()?);
        if result.as_ref().is_err_and(StalkError::is_connection) {
            self.broken = true;
        }
        result
    }
}

impl<C: JobConn> Drop for LeasedConn<C> {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl<C: JobConn> JobConn for LeasedConn<C> {
    fn close(mut self) -> StalkResult<()> {
        LeasedConn::close(&mut self)
    }

    fn delete(&mut self, id: u64) -> StalkResult<()> {
        self.run(|conn| conn.delete(id))
    }

    fn release(&mut self, id: u64, pri: u32, delay: Duration) -> StalkResult<()> {
        self.run(|conn| conn.release(id, pri, delay))
    }

    fn bury(&mut self, id: u64, pri: u32) -> StalkResult<()> {
        self.run(|conn| conn.bury(id, pri))
    }

    fn touch(&mut self, id: u64) -> StalkResult<()> {
        self.run(|conn| conn.touch(id))
    }

    fn peek(&mut self, id: u64) -> StalkResult<Job> {
        self.run(|conn| conn.peek(id))
    }

    fn stats(&mut self) -> StalkResult<BTreeMap<String, String>> {
        self.run(|conn| conn.stats())
    }

    fn stats_job(&mut self, id: u64) -> StalkResult<BTreeMap<String, String>> {
        self.run(|conn| conn.stats_job(id))
    }

    fn list_tubes(&mut self) -> StalkResult<Vec<String>> {
        self.run(|conn| conn.list_tubes())
    }

    fn put(&mut self, body: &[u8], pri: u32, delay: Duration, ttr: Duration) -> StalkResult<u64> {
        self.run(|conn| conn.put(body, pri, delay, ttr))
    }

    fn peek_ready(&mut self) -> StalkResult<Job> {
        self.run(|conn| conn.peek_ready())
    }

    fn peek_delayed(&mut self) -> StalkResult<Job> {
        self.run(|conn| conn.peek_delayed())
    }

    fn peek_buried(&mut self) -> StalkResult<Job> {
        self.run(|conn| conn.peek_buried())
    }

    fn kick(&mut self, bound: u64) -> StalkResult<u64> {
        self.run(|conn| conn.kick(bound))
    }

    fn pause(&mut self, delay: Duration) -> StalkResult<()> {
        self.run(|conn| conn.pause(delay))
    }

    fn use_tube(&mut self, name: &str) -> StalkResult<()> {
        self.run(|conn| conn.use_tube(name))
    }

    fn reserve(&mut self, timeout: Option<Duration>) -> StalkResult<Job> {
        self.run(|conn| conn.reserve(timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;

    #[derive(Default)]
    struct Counters {
        dials: AtomicUsize,
        closes: AtomicUsize,
        fail_dial: AtomicBool,
    }

    impl Counters {
        fn dials(&self) -> usize {
            self.dials.load(Ordering::SeqCst)
        }

        fn closes(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }
    }

    /// In-memory connection; `put` returns its dial number.
    struct FakeConn {
        id: u64,
        counters: Arc<Counters>,
    }

    impl JobConn for FakeConn {
        fn close(self) -> StalkResult<()> {
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn delete(&mut self, id: u64) -> StalkResult<()> {
            if id == 0 {
                return Err(StalkError::connection(
                    "delete",
                    io::Error::from(io::ErrorKind::ConnectionReset),
                ));
            }
            Ok(())
        }

        fn release(&mut self, _id: u64, _pri: u32, _delay: Duration) -> StalkResult<()> {
            Ok(())
        }

        fn bury(&mut self, _id: u64, _pri: u32) -> StalkResult<()> {
            Ok(())
        }

        fn touch(&mut self, _id: u64) -> StalkResult<()> {
            Ok(())
        }

        fn peek(&mut self, id: u64) -> StalkResult<Job> {
            Ok(Job { id, body: Vec::new() })
        }

        fn stats(&mut self) -> StalkResult<BTreeMap<String, String>> {
            Ok(BTreeMap::new())
        }

        fn stats_job(&mut self, _id: u64) -> StalkResult<BTreeMap<String, String>> {
            Ok(BTreeMap::new())
        }

        fn list_tubes(&mut self) -> StalkResult<Vec<String>> {
            Ok(vec!["default".to_string()])
        }

        fn put(&mut self, _body: &[u8], _pri: u32, _delay: Duration, _ttr: Duration) -> StalkResult<u64> {
            Ok(self.id)
        }

        fn peek_ready(&mut self) -> StalkResult<Job> {
            self.peek(self.id)
        }

        fn peek_delayed(&mut self) -> StalkResult<Job> {
            self.peek(self.id)
        }

        fn peek_buried(&mut self) -> StalkResult<Job> {
            self.peek(self.id)
        }

        fn kick(&mut self, bound: u64) -> StalkResult<u64> {
            Ok(bound)
        }

        fn pause(&mut self, _delay: Duration) -> StalkResult<()> {
            Ok(())
        }

        fn use_tube(&mut self, _name: &str) -> StalkResult<()> {
            Ok(())
        }

        fn reserve(&mut self, _timeout: Option<Duration>) -> StalkResult<Job> {
            self.peek(self.id)
        }
    }

    fn fake_builder() -> (PoolBuilder<FakeConn>, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let dial_counters = counters.clone();
        let builder = Pool::builder(move || {
            if dial_counters.fail_dial.load(Ordering::SeqCst) {
                return Err(StalkError::Dial {
                    addr: "fake".to_string(),
                    source: Arc::new(io::Error::from(io::ErrorKind::ConnectionRefused)),
                });
            }
            let id = dial_counters.dials.fetch_add(1, Ordering::SeqCst) as u64 + 1;
            Ok(FakeConn {
                id,
                counters: dial_counters.clone(),
            })
        });
        (builder, counters)
    }

    fn lease_id(lease: &mut LeasedConn<FakeConn>) -> u64 {
        lease.put(b"", 0, Duration::ZERO, Duration::ZERO).unwrap()
    }

    #[test]
    fn test_lease_is_reused() {
        let (builder, counters) = fake_builder();
        let pool = builder.max_idle(2).build();

        let mut lease = pool.get();
        assert_eq!(lease_id(&mut lease), 1);
        lease.close().unwrap();
        assert_eq!(pool.active_count(), 1);
        assert_eq!(pool.idle_count(), 1);

        let mut lease = pool.get();
        assert_eq!(lease_id(&mut lease), 1);
        drop(lease);
        assert_eq!(counters.dials(), 1);
        assert_eq!(pool.active_count(), 1);
    }

    #[test]
    fn test_idle_overflow_evicts_oldest() {
        let (builder, counters) = fake_builder();
        let pool = builder.max_idle(1).build();

        let first = pool.get();
        let second = pool.get();
        drop(first);
        drop(second);

        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.active_count(), 1);
        assert_eq!(counters.closes(), 1);

        let mut lease = pool.get();
        assert_eq!(lease_id(&mut lease), 2);
    }

    #[test]
    fn test_exhausted_without_wait() {
        let (builder, counters) = fake_builder();
        let pool = builder.max_active(1).build();

        let _held = pool.get();
        let mut lease = pool.get();
        assert!(matches!(lease.err(), Some(StalkError::PoolExhausted)));
        assert!(matches!(lease.kick(1), Err(StalkError::PoolExhausted)));
        assert!(matches!(LeasedConn::close(&mut lease), Err(StalkError::PoolExhausted)));
        assert!(LeasedConn::close(&mut lease).is_ok());
        assert!(matches!(lease.kick(1), Err(StalkError::ConnClosed)));

        assert_eq!(pool.active_count(), 1);
        assert_eq!(counters.dials(), 1);
    }

    #[test]
    fn test_wait_blocks_until_release() {
        let (builder, counters) = fake_builder();
        let pool = builder.max_active(1).wait(true).build();

        let held = pool.get();
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || {
                let mut lease = pool.get();
                lease_id(&mut lease)
            })
        };

        thread::sleep(Duration::from_millis(50));
        drop(held);

        assert_eq!(waiter.join().unwrap(), 1);
        assert_eq!(counters.dials(), 1);
        assert_eq!(pool.active_count(), 1);
    }

    #[test]
    fn test_close_drains_idle() {
        let (builder, counters) = fake_builder();
        let pool = builder.max_idle(3).build();

        let leases: Vec<_> = (0..3).map(|_| pool.get()).collect();
        drop(leases);
        assert_eq!(pool.idle_count(), 3);

        pool.close().unwrap();
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.active_count(), 0);
        assert_eq!(counters.closes(), 3);

        let lease = pool.get();
        assert!(matches!(lease.err(), Some(StalkError::PoolClosed)));
        assert!(pool.close().is_ok());
    }

    #[test]
    fn test_lease_returned_after_close_is_closed() {
        let (builder, counters) = fake_builder();
        let pool = builder.build();

        let lease = pool.get();
        pool.close().unwrap();
        assert_eq!(pool.active_count(), 1);

        lease.close().unwrap();
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(counters.closes(), 1);
    }

    #[test]
    fn test_dial_failure_is_captured() {
        let (builder, counters) = fake_builder();
        let pool = builder.build();
        counters.fail_dial.store(true, Ordering::SeqCst);

        let mut lease = pool.get();
        assert!(matches!(lease.err(), Some(StalkError::Dial { .. })));
        assert_eq!(pool.active_count(), 0);

        assert!(matches!(lease.delete(5), Err(StalkError::Dial { .. })));
        assert!(matches!(lease.reserve(None), Err(StalkError::Dial { .. })));
        assert!(matches!(LeasedConn::close(&mut lease), Err(StalkError::Dial { .. })));
        assert!(matches!(lease.delete(5), Err(StalkError::ConnClosed)));
    }

    #[test]
    fn test_failed_health_check_dials_fresh() {
        let (builder, counters) = fake_builder();
        let pool = builder
            .test_on_borrow(|conn: &mut FakeConn, _returned| {
                if conn.id == 1 {
                    return Err(StalkError::ConnClosed);
                }
                Ok(())
            })
            .build();

        drop(pool.get());
        assert_eq!(pool.idle_count(), 1);

        let mut lease = pool.get();
        assert_eq!(lease_id(&mut lease), 2);
        assert_eq!(counters.dials(), 2);
        assert_eq!(counters.closes(), 1);
        assert_eq!(pool.active_count(), 1);
    }

    #[test]
    fn test_stale_idle_is_pruned() {
        let (builder, counters) = fake_builder();
        let pool = builder.idle_timeout(Duration::from_millis(10)).build();

        drop(pool.get());
        thread::sleep(Duration::from_millis(30));

        let mut lease = pool.get();
        assert_eq!(lease_id(&mut lease), 2);
        assert_eq!(counters.closes(), 1);
        assert_eq!(pool.active_count(), 1);
    }

    #[test]
    fn test_broken_connection_is_not_reused() {
        let (builder, counters) = fake_builder();
        let pool = builder.build();

        let mut lease = pool.get();
        assert!(lease.delete(0).unwrap_err().is_connection());
        lease.close().unwrap();

        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.active_count(), 0);
        assert_eq!(counters.closes(), 1);
    }

    #[test]
    fn test_waiter_released_by_pool_close() {
        let (builder, _counters) = fake_builder();
        let pool = builder.max_active(1).wait(true).build();

        let _held = pool.get();
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.get().err().cloned())
        };

        thread::sleep(Duration::from_millis(50));
        pool.close().unwrap();

        assert!(matches!(waiter.join().unwrap(), Some(StalkError::PoolClosed)));
    }

    #[test]
    fn test_concurrent_gets_respect_max_active() {
        let (builder, counters) = fake_builder();
        let pool = builder.max_active(4).max_idle(4).wait(true).build();

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        let mut lease = pool.get();
                        assert!(lease.err().is_none());
                        lease.touch(1).unwrap();
                        assert!(pool.active_count() <= 4);
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert!(counters.dials() <= 4);
        assert_eq!(pool.active_count(), pool.idle_count());
    }

    /// Moves a lease's connection onto the idle list without waking anyone.
    fn park_quietly(pool: &Pool<FakeConn>, mut lease: LeasedConn<FakeConn>) {
        if let Lease::Live(conn) = mem::replace(&mut lease.lease, Lease::Closed) {
            pool.inner.state.lock().idle.push_front(IdleConn {
                conn,
                returned: Instant::now(),
            });
        }
    }

    /// Blocks a `get` on a saturated pool; the receiver yields its outcome.
    fn spawn_waiter(pool: &Pool<FakeConn>) -> mpsc::Receiver<Option<StalkError>> {
        let (tx, rx) = mpsc::channel();
        let pool = pool.clone();
        thread::spawn(move || {
            let lease = pool.get();
            let _ = tx.send(lease.err().cloned());
        });
        rx
    }

    #[test]
    fn test_pruned_slots_wake_waiters() {
        let (builder, _counters) = fake_builder();
        let pool = builder
            .max_active(2)
            .wait(true)
            .idle_timeout(Duration::from_millis(20))
            .build();

        let first = pool.get();
        let second = pool.get();
        let waiter = spawn_waiter(&pool);
        thread::sleep(Duration::from_millis(50));

        park_quietly(&pool, first);
        park_quietly(&pool, second);
        thread::sleep(Duration::from_millis(40));

        // Prunes both stale entries and takes one of the two freed slots.
        let _held = pool.get();
        let outcome = waiter.recv_timeout(Duration::from_secs(2)).expect("waiter woke");
        assert!(outcome.is_none());
    }

    #[test]
    fn test_failed_health_checks_wake_waiters() {
        let (builder, _counters) = fake_builder();
        let pool = builder
            .max_active(2)
            .wait(true)
            .test_on_borrow(|conn: &mut FakeConn, _returned| {
                if conn.id <= 2 {
                    return Err(StalkError::ConnClosed);
                }
                Ok(())
            })
            .build();

        let first = pool.get();
        let second = pool.get();
        let waiter = spawn_waiter(&pool);
        thread::sleep(Duration::from_millis(50));

        park_quietly(&pool, first);
        park_quietly(&pool, second);

        // Discards both idle connections and takes one of the two freed slots.
        let _held = pool.get();
        let outcome = waiter.recv_timeout(Duration::from_secs(2)).expect("waiter woke");
        assert!(outcome.is_none());
    }

    #[test]
    fn test_config_from_json() {
        let config: PoolConfig =
            serde_json::from_str(r#"{"max_active": 4, "idle_timeout": "5m", "wait": true}"#).unwrap();
        assert_eq!(config.max_active, 4);
        assert_eq!(config.max_idle, 8);
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(300)));
        assert!(config.wait);
    }
}
