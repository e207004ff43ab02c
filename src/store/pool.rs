//! Bounded connection pool
//!
//! At most `max_size` connections are checked out at once; callers beyond
//! that wait up to `acquire_timeout` for a permit. Returned connections are
//! kept on an idle stack (up to `max_idle`) and reused newest-first. A
//! connection idle for longer than `idle_timeout` is closed instead of reused.

use crate::common::{Error, PoolConfig, Result};
use async_trait::async_trait;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Opens new connections for a [`Pool`]
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Connection: Send + 'static;

    async fn connect(&self) -> Result<Self::Connection>;
}

struct Idle<T> {
    conn: T,
    since: Instant,
}

struct Shared<C: Connector> {
    connector: C,
    idle: Mutex<Vec<Idle<C::Connection>>>,
    permits: Arc<Semaphore>,
    max_size: usize,
    max_idle: usize,
    idle_timeout: Duration,
    acquire_timeout: Duration,
}

impl<C: Connector> Shared<C> {
    fn idle(&self) -> MutexGuard<'_, Vec<Idle<C::Connection>>> {
        // The idle stack stays valid even if a holder panicked.
        self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub max_size: usize,
    pub in_use: usize,
    pub idle: usize,
}

pub struct Pool<C: Connector> {
    shared: Arc<Shared<C>>,
}

impl<C: Connector> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<C: Connector> Pool<C> {
    pub fn new(connector: C, config: &PoolConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                connector,
                idle: Mutex::new(Vec::with_capacity(config.max_idle)),
                permits: Arc::new(Semaphore::new(config.max_size)),
                max_size: config.max_size,
                max_idle: config.max_idle,
                idle_timeout: config.idle_timeout(),
                acquire_timeout: config.acquire_timeout(),
            }),
        }
    }

    /// Check out a connection, reusing an idle one when possible
    pub async fn get(&self) -> Result<Pooled<C>> {
        let permit = tokio::time::timeout(
            self.shared.acquire_timeout,
            self.shared.permits.clone().acquire_owned(),
        )
        .await
        .map_err(|_| {
            Error::Timeout(format!(
                "no free store connection within {:?} (pool size {})",
                self.shared.acquire_timeout, self.shared.max_size
            ))
        })?
        .map_err(|_| Error::Internal("connection pool closed".into()))?;

        let conn = match self.take_idle() {
            Some(conn) => conn,
            None => {
                tracing::debug!("Opening new store connection");
                self.shared.connector.connect().await?
            }
        };

        Ok(Pooled {
            conn: Some(conn),
            shared: self.shared.clone(),
            reusable: true,
            _permit: permit,
        })
    }

    fn take_idle(&self) -> Option<C::Connection> {
        let mut idle = self.shared.idle();
        while let Some(entry) = idle.pop() {
            if entry.since.elapsed() <= self.shared.idle_timeout {
                return Some(entry.conn);
            }
            tracing::debug!("Closing store connection idle for {:?}", entry.since.elapsed());
        }
        None
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            max_size: self.shared.max_size,
            in_use: self.shared.max_size - self.shared.permits.available_permits(),
            idle: self.shared.idle().len(),
        }
    }
}

/// A checked-out connection, returned to the pool on drop
pub struct Pooled<C: Connector> {
    conn: Option<C::Connection>,
    shared: Arc<Shared<C>>,
    reusable: bool,
    // Dropped after `Drop::drop` has put the connection back.
    _permit: OwnedSemaphorePermit,
}

impl<C: Connector> Pooled<C> {
    /// Close this connection on release instead of returning it
    pub fn discard(&mut self) {
        self.reusable = false;
    }
}

impl<C: Connector> Deref for Pooled<C> {
    type Target = C::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl<C: Connector> DerefMut for Pooled<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl<C: Connector> Drop for Pooled<C> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if !self.reusable {
            tracing::debug!("Discarding store connection");
            return;
        }
        let mut idle = self.shared.idle();
        if idle.len() < self.shared.max_idle {
            idle.push(Idle {
                conn,
                since: Instant::now(),
            });
        }
    }
}
