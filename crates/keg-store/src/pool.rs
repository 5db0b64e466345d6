//! A bounded pool of reusable connections.
//!
//! Connections are created lazily up to the capacity. A connection marked
//! bad is discarded on return instead of being handed out again.

use keg_core::{Error, Result};
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

pub struct Pool<C> {
    semaphore: Arc<Semaphore>,
    idle: Mutex<Vec<C>>,
    capacity: usize,
}

impl<C: Send> Pool<C> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            idle: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Borrow a connection, opening a new one through `open` if no idle
    /// connection is available. Waits when all slots are in use.
    pub async fn get<F, Fut>(&self, open: F) -> Result<PoolGuard<'_, C>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C>>,
    {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| Error::Other("connection pool closed".into()))?;

        let idle = self.idle.lock().expect("pool poisoned").pop();
        let conn = match idle {
            Some(conn) => conn,
            None => open().await?,
        };
        Ok(PoolGuard {
            pool: self,
            conn: Some(conn),
            bad: false,
            _permit: permit,
        })
    }
}

/// A borrowed pool connection. Returned to the pool on drop unless marked
/// bad.
pub struct PoolGuard<'a, C: Send> {
    pool: &'a Pool<C>,
    conn: Option<C>,
    bad: bool,
    _permit: OwnedSemaphorePermit,
}

impl<C: Send> PoolGuard<'_, C> {
    /// Discard this connection on return.
    pub fn mark_bad(&mut self) {
        self.bad = true;
    }
}

impl<C: Send> Deref for PoolGuard<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.conn.as_ref().expect("connection taken")
    }
}

impl<C: Send> DerefMut for PoolGuard<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn.as_mut().expect("connection taken")
    }
}

impl<C: Send> Drop for PoolGuard<'_, C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if !self.bad {
                self.pool.idle.lock().expect("pool poisoned").push(conn);
            }
        }
    }
}
