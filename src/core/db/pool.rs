/// Connection Pool Module
///
/// A fixed-capacity pool for callers that handle concurrent units of work.
/// A bare [`Connection`] is not safe to share, so each caller checks one out,
/// uses it exclusively, and the guard checks it back in on drop.

use crate::config::ResolvedSettings;
use crate::core::db::connection::{Connection, ConnectionManager, DialerRegistry};
use crate::core::{DataError, Result};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub idle: usize,
    pub open: usize,
    pub capacity: usize,
}

struct PoolState {
    idle: Vec<Connection>,
    /// Connections alive, idle or checked out
    open: usize,
    closed: bool,
}

struct PoolInner {
    settings: ResolvedSettings,
    dialers: DialerRegistry,
    capacity: usize,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl PoolInner {
    fn lock(&self) -> Result<MutexGuard<'_, PoolState>> {
        self.state
            .lock()
            .map_err(|e| DataError::Pool(format!("pool mutex poisoned: {}", e)))
    }

    fn release(&self, mut conn: Connection) {
        let mut state = match self.lock() {
            Ok(state) => state,
            Err(_) => return,
        };
        if state.closed || conn.is_closed() {
            state.open = state.open.saturating_sub(1);
            drop(state);
            if let Err(e) = conn.close() {
                warn!(connection = %conn.id(), error = %e, "failed to close released connection");
            }
        } else {
            debug!(connection = %conn.id(), "connection checked in");
            state.idle.push(conn);
        }
        self.available.notify_one();
    }
}

/// Fixed-capacity pool of connections to one backend.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates a pool that opens at most `capacity` connections, lazily.
    pub fn new(settings: ResolvedSettings, dialers: DialerRegistry, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(DataError::Configuration(
                "pool capacity must be greater than 0".to_string(),
            ));
        }
        Ok(ConnectionPool {
            inner: Arc::new(PoolInner {
                settings,
                dialers,
                capacity,
                state: Mutex::new(PoolState {
                    idle: Vec::new(),
                    open: 0,
                    closed: false,
                }),
                available: Condvar::new(),
            }),
        })
    }

    /// Checks out a connection, waiting up to `timeout` for one to free up.
    ///
    /// # Errors
    ///
    /// `DataError::Pool` when the wait times out or the pool is shut down;
    /// `DataError::Connection` when a new connection cannot be opened.
    pub fn checkout(&self, timeout: Duration) -> Result<PooledConnection> {
        // A timeout too large to add to now means wait indefinitely.
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.inner.lock()?;

        loop {
            if state.closed {
                return Err(DataError::Pool("pool is closed".to_string()));
            }

            if let Some(conn) = state.idle.pop() {
                debug!(connection = %conn.id(), "connection checked out");
                return Ok(PooledConnection::new(conn, Arc::clone(&self.inner)));
            }

            if state.open < self.inner.capacity {
                state.open += 1;
                drop(state);
                return match ConnectionManager::open(&self.inner.settings, &self.inner.dialers) {
                    Ok(conn) => Ok(PooledConnection::new(conn, Arc::clone(&self.inner))),
                    Err(e) => {
                        if let Ok(mut state) = self.inner.lock() {
                            state.open -= 1;
                        }
                        self.inner.available.notify_one();
                        Err(e)
                    }
                };
            }

            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(DataError::Pool(format!(
                            "timed out waiting for a connection (capacity={})",
                            self.inner.capacity
                        )));
                    }
                    self.inner
                        .available
                        .wait_timeout(state, deadline - now)
                        .map_err(|e| DataError::Pool(format!("pool mutex poisoned: {}", e)))?
                        .0
                }
                None => self
                    .inner
                    .available
                    .wait(state)
                    .map_err(|e| DataError::Pool(format!("pool mutex poisoned: {}", e)))?,
            };
        }
    }

    pub fn status(&self) -> Result<PoolStatus> {
        let state = self.inner.lock()?;
        Ok(PoolStatus {
            idle: state.idle.len(),
            open: state.open,
            capacity: self.inner.capacity,
        })
    }

    /// Closes idle connections and refuses further checkouts. Connections
    /// still checked out are closed when their guards drop.
    pub fn close(&self) -> Result<()> {
        let idle = {
            let mut state = self.inner.lock()?;
            state.closed = true;
            state.open -= state.idle.len();
            std::mem::take(&mut state.idle)
        };
        self.inner.available.notify_all();

        let mut first_err = None;
        for mut conn in idle {
            if let Err(e) = conn.close() {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// A checked-out connection; returns to the pool on drop.
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<PoolInner>,
}

impl PooledConnection {
    fn new(conn: Connection, pool: Arc<PoolInner>) -> Self {
        PooledConnection {
            conn: Some(conn),
            pool,
        }
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("pooled connection present until drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("pooled connection present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}
