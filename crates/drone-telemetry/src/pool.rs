// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fixed-size pool of transport handles.
//!
//! Pre-creates N handles at construction and hands them out through a
//! lock-free freelist. A semaphore counts the free handles so `acquire()` can
//! suspend the calling task until one is returned. This is the backpressure
//! point that bounds concurrent outbound sends to N.
//!
//! Handles are checked out as [`PooledHandle`] guards. Dropping the guard
//! returns the handle exactly once, whichever way the holding scope exits.
//!
//! The pool does not check handle health. A broken handle surfaces its error
//! to whoever uses it next and goes back to the freelist unchanged.

use crossbeam::queue::ArrayQueue;
use std::fmt;
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Semaphore, TryAcquireError};

/// Default pool capacity.
pub const DEFAULT_POOL_SIZE: usize = 100;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Boxed error returned by a handle factory.
pub type FactoryError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Pool errors.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Pool capacity must be at least 1")]
    InvalidCapacity,

    #[error("Handle factory failed after {created} of {capacity} handles: {source}")]
    Factory {
        created: usize,
        capacity: usize,
        #[source]
        source: FactoryError,
    },

    #[error("Pool is closed")]
    Closed,

    #[error("No handle available")]
    Exhausted,

    #[error("Handle belongs to pool {owner}, not pool {pool}")]
    ForeignHandle { owner: u64, pool: u64 },

    #[error("Handle in slot {0} released twice")]
    DoubleRelease(usize),
}

struct Slot<T> {
    index: usize,
    handle: T,
}

struct PoolInner<T> {
    id: u64,
    free: ArrayQueue<Slot<T>>,
    permits: Semaphore,
    checked_out: Vec<AtomicBool>,
    contended: AtomicU64,
}

impl<T> PoolInner<T> {
    fn take(&self) -> Result<Slot<T>, PoolError> {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                // A permit was granted without a free handle behind it.
                self.permits.add_permits(1);
                return Err(PoolError::Exhausted);
            }
        };
        self.checked_out[slot.index].store(true, Ordering::Release);
        Ok(slot)
    }

    fn give_back(&self, slot: Slot<T>) -> Result<(), PoolError> {
        let index = slot.index;
        if !self.checked_out[index].swap(false, Ordering::AcqRel) {
            return Err(PoolError::DoubleRelease(index));
        }
        if self.free.push(slot).is_err() {
            return Err(PoolError::DoubleRelease(index));
        }
        self.permits.add_permits(1);
        Ok(())
    }
}

/// Fixed-size pool of reusable handles.
///
/// Cloning is cheap and yields another reference to the same pool.
pub struct ConnectionPool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for ConnectionPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for ConnectionPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("id", &self.inner.id)
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .finish()
    }
}

impl<T> ConnectionPool<T> {
    /// Create a pool by calling `factory` once per slot.
    ///
    /// Fails unless all `capacity` handles are created.
    pub fn new<F, E>(capacity: usize, mut factory: F) -> Result<Self, PoolError>
    where
        F: FnMut(usize) -> Result<T, E>,
        E: Into<FactoryError>,
    {
        if capacity == 0 {
            return Err(PoolError::InvalidCapacity);
        }
        let mut handles = Vec::with_capacity(capacity);
        for index in 0..capacity {
            let handle = factory(index).map_err(|e| PoolError::Factory {
                created: index,
                capacity,
                source: e.into(),
            })?;
            handles.push(handle);
        }
        Self::from_handles(handles)
    }

    /// Async variant of [`ConnectionPool::new`] for factories that connect.
    pub async fn connect<F, Fut, E>(capacity: usize, mut factory: F) -> Result<Self, PoolError>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Into<FactoryError>,
    {
        if capacity == 0 {
            return Err(PoolError::InvalidCapacity);
        }
        let mut handles = Vec::with_capacity(capacity);
        for index in 0..capacity {
            let handle = factory(index).await.map_err(|e| PoolError::Factory {
                created: index,
                capacity,
                source: e.into(),
            })?;
            handles.push(handle);
        }
        Self::from_handles(handles)
    }

    fn from_handles(handles: Vec<T>) -> Result<Self, PoolError> {
        let capacity = handles.len();
        let free = ArrayQueue::new(capacity);
        for (index, handle) in handles.into_iter().enumerate() {
            free.push(Slot { index, handle })
                .map_err(|_| PoolError::InvalidCapacity)?;
        }
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("Connection pool {} ready with {} handles", id, capacity);

        Ok(Self {
            inner: Arc::new(PoolInner {
                id,
                free,
                permits: Semaphore::new(capacity),
                checked_out: (0..capacity).map(|_| AtomicBool::new(false)).collect(),
                contended: AtomicU64::new(0),
            }),
        })
    }

    /// Pool identifier, unique within the process.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Total number of handles.
    pub fn capacity(&self) -> usize {
        self.inner.checked_out.len()
    }

    /// Handles currently free.
    pub fn available(&self) -> usize {
        self.inner.free.len()
    }

    /// Handles currently checked out.
    pub fn checked_out(&self) -> usize {
        self.inner
            .checked_out
            .iter()
            .filter(|flag| flag.load(Ordering::Acquire))
            .count()
    }

    /// Number of `acquire()` calls that had to wait for a handle.
    pub fn contended_count(&self) -> u64 {
        self.inner.contended.load(Ordering::Relaxed)
    }

    /// Check out a handle, waiting until one is free.
    ///
    /// Fails with [`PoolError::Closed`] once the pool is closed, including for
    /// tasks already waiting.
    pub async fn acquire(&self) -> Result<PooledHandle<T>, PoolError> {
        let permit = match self.inner.permits.try_acquire() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return Err(PoolError::Closed),
            Err(TryAcquireError::NoPermits) => {
                self.inner.contended.fetch_add(1, Ordering::Relaxed);
                self.inner
                    .permits
                    .acquire()
                    .await
                    .map_err(|_| PoolError::Closed)?
            }
        };
        permit.forget();
        self.checkout()
    }

    /// Check out a handle without waiting.
    pub fn try_acquire(&self) -> Result<PooledHandle<T>, PoolError> {
        let permit = self.inner.permits.try_acquire().map_err(|e| match e {
            TryAcquireError::Closed => PoolError::Closed,
            TryAcquireError::NoPermits => PoolError::Exhausted,
        })?;
        permit.forget();
        self.checkout()
    }

    fn checkout(&self) -> Result<PooledHandle<T>, PoolError> {
        let slot = self.inner.take()?;
        Ok(PooledHandle {
            pool: Arc::clone(&self.inner),
            slot: Some(slot),
        })
    }

    /// Return a handle explicitly.
    ///
    /// Dropping the guard does the same; this form reports misuse. A handle
    /// from a different pool is rejected and goes back to its own pool.
    pub fn release(&self, mut handle: PooledHandle<T>) -> Result<(), PoolError> {
        if !Arc::ptr_eq(&handle.pool, &self.inner) {
            return Err(PoolError::ForeignHandle {
                owner: handle.pool.id,
                pool: self.inner.id,
            });
        }
        match handle.slot.take() {
            Some(slot) => self.inner.give_back(slot),
            None => Err(PoolError::DoubleRelease(usize::MAX)),
        }
    }

    /// Stop handing out handles. Waiting and future acquirers get
    /// [`PoolError::Closed`]; outstanding guards may still be returned.
    pub fn close(&self) {
        self.inner.permits.close();
        tracing::debug!("Connection pool {} closed", self.inner.id);
    }

    /// True once [`ConnectionPool::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.permits.is_closed()
    }
}

/// A handle checked out of a [`ConnectionPool`].
///
/// Dereferences to the handle. Returned to the pool on drop.
pub struct PooledHandle<T> {
    pool: Arc<PoolInner<T>>,
    slot: Option<Slot<T>>,
}

impl<T> PooledHandle<T> {
    /// Slot index inside the owning pool.
    pub fn slot(&self) -> usize {
        self.slot.as_ref().map_or(usize::MAX, |s| s.index)
    }

    /// Identifier of the owning pool.
    pub fn pool_id(&self) -> u64 {
        self.pool.id
    }
}

impl<T> Deref for PooledHandle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        match &self.slot {
            Some(slot) => &slot.handle,
            // The slot is only taken by `release` and `drop`, both of which
            // consume the guard.
            None => unreachable!("pooled handle used after release"),
        }
    }
}

impl<T> DerefMut for PooledHandle<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.slot {
            Some(slot) => &mut slot.handle,
            None => unreachable!("pooled handle used after release"),
        }
    }
}

impl<T> Drop for PooledHandle<T> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            if let Err(e) = self.pool.give_back(slot) {
                tracing::error!("Failed to return handle to pool {}: {}", self.pool.id, e);
            }
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for PooledHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledHandle")
            .field("pool", &self.pool.id)
            .field("slot", &self.slot())
            .finish()
    }
}
