//! Bounded connection pool
//!
//! A semaphore caps how many connections are checked out at once; returned
//! connections go onto an idle stack and are reused before new ones are
//! opened.

use crate::adapter::{AdapterError, BackendAdapter};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Pool of backend connections, at most `size` checked out at a time
pub struct ConnectionPool<A: BackendAdapter> {
    adapter: Arc<A>,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<A::Connection>>,
    size: usize,
}

impl<A: BackendAdapter> ConnectionPool<A> {
    /// Create a pool; `size` is clamped to at least one
    pub fn new(adapter: Arc<A>, size: usize) -> Self {
        let size = size.max(1);
        Self {
            adapter,
            permits: Arc::new(Semaphore::new(size)),
            idle: Mutex::new(Vec::with_capacity(size)),
            size,
        }
    }

    pub fn adapter(&self) -> &Arc<A> {
        &self.adapter
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Permits not currently checked out
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Connections open but not checked out
    pub fn idle_count(&self) -> usize {
        self.idle().len()
    }

    /// Check out a connection, waiting while the pool is exhausted
    ///
    /// Reuses an idle connection when one exists, opens a new one otherwise.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection<A>, AdapterError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| AdapterError::PoolClosed)?;

        let reused = self.idle().pop();
        let connection = match reused {
            Some(connection) => connection,
            None => {
                tracing::debug!(adapter = self.adapter.name(), "opening backend connection");
                self.adapter.open().await?
            }
        };

        Ok(PooledConnection {
            pool: Arc::clone(self),
            connection: Some(connection),
            _permit: permit,
        })
    }

    /// Stop handing out connections and close every idle one
    ///
    /// Connections still checked out are dropped, not pooled, when their
    /// guard is released.
    pub async fn shutdown(&self) -> Result<(), AdapterError> {
        self.permits.close();
        let idle: Vec<A::Connection> = self.idle().drain(..).collect();
        tracing::debug!(adapter = self.adapter.name(), connections = idle.len(), "closing connection pool");

        let mut first_error = None;
        for connection in idle {
            if let Err(e) = self.adapter.close(connection).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn idle(&self) -> MutexGuard<'_, Vec<A::Connection>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A checked-out connection; returns to the pool when dropped
pub struct PooledConnection<A: BackendAdapter> {
    pool: Arc<ConnectionPool<A>>,
    connection: Option<A::Connection>,
    _permit: OwnedSemaphorePermit,
}

impl<A: BackendAdapter> PooledConnection<A> {
    /// Close this connection instead of returning it to the pool
    ///
    /// Used after an abort, when the connection state is unknown.
    pub async fn discard(mut self) -> Result<(), AdapterError> {
        match self.connection.take() {
            Some(connection) => self.pool.adapter.close(connection).await,
            None => Ok(()),
        }
    }
}

impl<A: BackendAdapter> Deref for PooledConnection<A> {
    type Target = A::Connection;

    fn deref(&self) -> &Self::Target {
        // Only `discard` and `drop` take the connection, and both consume the guard
        match &self.connection {
            Some(connection) => connection,
            None => unreachable!("pooled connection used after discard"),
        }
    }
}

impl<A: BackendAdapter> DerefMut for PooledConnection<A> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.connection {
            Some(connection) => connection,
            None => unreachable!("pooled connection used after discard"),
        }
    }
}

impl<A: BackendAdapter> Drop for PooledConnection<A> {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            if !self.pool.permits.is_closed() {
                self.pool.idle().push(connection);
            }
        }
    }
}
