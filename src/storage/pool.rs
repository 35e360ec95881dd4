//! Bounded pool of reusable storage connections.
//!
//! Handles are opened lazily up to the configured size and recycled on release. After
//! [`Pool::shutdown`] every idle handle is closed, new acquisitions fail immediately and
//! handles still checked out are closed when they come back.

use std::{
    ops::{Deref, DerefMut},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use log::{debug, trace};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("no connection available within {0:?}")]
    Timeout(Duration),
    #[error("connection pool is shut down")]
    Closed,
    #[error("failed to open connection: {0}")]
    Connect(String),
}

type Factory<T> = Box<dyn Fn() -> Result<T, String> + Send + Sync>;

struct PoolState<T> {
    idle: Vec<T>,
    open: usize,
    closed: bool,
}

/// A fixed-size pool of connection-like handles.
pub struct Pool<T> {
    size: usize,
    factory: Factory<T>,
    state: Mutex<PoolState<T>>,
    available: Condvar,
}

/// A checked-out handle. Returns to its pool when dropped.
pub struct Pooled<T> {
    pool: Arc<Pool<T>>,
    value: Option<T>,
}

impl<T> Pool<T> {
    pub fn new<F, E>(size: usize, factory: F) -> Arc<Self>
    where
        F: Fn() -> Result<T, E> + Send + Sync + 'static,
        E: std::fmt::Display,
    {
        Arc::new(Self {
            size: size.max(1),
            factory: Box::new(move || factory().map_err(|e| e.to_string())),
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                open: 0,
                closed: false,
            }),
            available: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Checks out a handle, waiting at most `timeout` for one to be released.
    pub fn acquire(self: &Arc<Self>, timeout: Duration) -> Result<Pooled<T>, PoolError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();

        loop {
            if state.closed {
                return Err(PoolError::Closed);
            }

            if let Some(item) = state.idle.pop() {
                trace!("reusing pooled connection");
                return Ok(Pooled {
                    pool: Arc::clone(self),
                    value: Some(item),
                });
            }

            if state.open < self.size {
                state.open += 1;
                drop(state);
                debug!("opening pooled connection");

                return match (self.factory)() {
                    Ok(item) => Ok(Pooled {
                        pool: Arc::clone(self),
                        value: Some(item),
                    }),
                    Err(e) => {
                        self.lock().open -= 1;
                        self.available.notify_one();
                        Err(PoolError::Connect(e))
                    }
                };
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(PoolError::Timeout(timeout));
            }
            let (guard, _) = self
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    /// Returns a handle to the pool. Equivalent to dropping it.
    pub fn release(&self, handle: Pooled<T>) {
        drop(handle);
    }

    /// Closes idle handles and refuses further acquisitions. Returns the number of
    /// handles closed now; repeated calls close nothing.
    pub fn shutdown(&self) -> usize {
        let drained = {
            let mut state = self.lock();
            state.closed = true;
            let drained = std::mem::take(&mut state.idle);
            state.open -= drained.len();
            drained
        };
        self.available.notify_all();

        let closed = drained.len();
        drop(drained);
        if closed > 0 {
            debug!("closed {closed} idle pooled connections");
        }
        closed
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Handles currently open, idle or checked out.
    pub fn open_count(&self) -> usize {
        self.lock().open
    }

    pub fn idle_count(&self) -> usize {
        self.lock().idle.len()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn put_back(&self, item: T) {
        let mut state = self.lock();
        if state.closed {
            state.open -= 1;
            drop(state);
            drop(item);
            trace!("closed connection returned after shutdown");
        } else {
            state.idle.push(item);
            drop(state);
        }
        self.available.notify_one();
    }

    fn forget(&self) {
        self.lock().open -= 1;
        self.available.notify_one();
    }
}

impl<T> Pooled<T> {
    /// Closes the handle instead of recycling it, freeing its slot.
    pub fn discard(mut self) {
        if let Some(item) = self.value.take() {
            drop(item);
            self.pool.forget();
        }
    }
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.value
            .as_ref()
            .expect("pooled value is present until drop")
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value
            .as_mut()
            .expect("pooled value is present until drop")
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(item) = self.value.take() {
            self.pool.put_back(item);
        }
    }
}
