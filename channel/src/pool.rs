// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Fixed-size message pool, and the per-endpoint cache in front of it.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;
use tracing::error;

use crate::endpoint::AllocError;
use crate::message::BypassMessage;

use tracectl::trace_target;
trace_target!("bypass-channel", LevelFilter::INFO, &["bypass"]);

/// A fixed number of message slots, allocated once, with a lock-free free list.
pub struct MessagePool {
    slots: Box<[UnsafeCell<BypassMessage>]>,
    free: ArrayQueue<u32>,
}

// SAFETY: a slot is only reachable through the single PooledMessage holding
// its index, and an index is either in the free list, in a ring, or held by
// exactly one PooledMessage.
unsafe impl Sync for MessagePool {}

impl MessagePool {
    /// Build a pool of `size` slots. `size` must be non-zero and fit a `u32`.
    pub(crate) fn new(size: u32) -> Arc<Self> {
        debug_assert!(size > 0);
        let free = ArrayQueue::new(size as usize);
        for index in 0..size {
            // cannot fail: the free list has room for every slot
            let _ = free.push(index);
        }
        Arc::new(Self {
            slots: (0..size)
                .map(|_| UnsafeCell::new(BypassMessage::default()))
                .collect(),
            free,
        })
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slots currently in the shared free list. Slots held in endpoint caches
    /// are not counted.
    #[must_use]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Take a slot straight from the shared free list.
    ///
    /// # Errors
    ///
    /// [`AllocError::Exhausted`] when every slot is checked out or cached.
    pub fn allocate(self: &Arc<Self>) -> Result<PooledMessage, AllocError> {
        self.free
            .pop()
            .map(|index| self.adopt(index))
            .ok_or(AllocError::Exhausted)
    }

    pub(crate) fn adopt(self: &Arc<Self>, index: u32) -> PooledMessage {
        debug_assert!((index as usize) < self.slots.len());
        PooledMessage {
            pool: Arc::clone(self),
            index,
            armed: true,
        }
    }

    pub(crate) fn release(&self, index: u32) {
        if self.free.push(index).is_err() {
            error!("Message slot {index} released twice: free list is full");
        }
    }

    pub(crate) fn pop_free(&self) -> Option<u32> {
        self.free.pop()
    }
}

impl std::fmt::Debug for MessagePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePool")
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .finish()
    }
}

/// Exclusive ownership of one pool slot. Dropping it returns the slot to the
/// shared pool.
pub struct PooledMessage {
    pool: Arc<MessagePool>,
    index: u32,
    armed: bool,
}

impl PooledMessage {
    /// Give up the slot without returning it; whoever holds the index now owns it.
    pub(crate) fn into_index(mut self) -> u32 {
        self.armed = false;
        self.index
    }

    pub(crate) fn pool(&self) -> &Arc<MessagePool> {
        &self.pool
    }

    #[must_use]
    pub fn slot(&self) -> u32 {
        self.index
    }
}

impl Deref for PooledMessage {
    type Target = BypassMessage;

    fn deref(&self) -> &Self::Target {
        // SAFETY: this PooledMessage is the only holder of `index`
        unsafe { &*self.pool.slots[self.index as usize].get() }
    }
}

impl DerefMut for PooledMessage {
    fn deref_mut(&mut self) -> &mut Self::Target {
        // SAFETY: this PooledMessage is the only holder of `index`
        unsafe { &mut *self.pool.slots[self.index as usize].get() }
    }
}

impl Drop for PooledMessage {
    fn drop(&mut self) {
        if self.armed {
            self.pool.release(self.index);
        }
    }
}

impl std::fmt::Debug for PooledMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PooledMessage[{}]{:?}", self.index, **self)
    }
}

/// A private stash of free slot indices for one endpoint.
///
/// Misses refill half the cache from the shared pool in one go; a full cache
/// flushes half of itself back.
pub struct PoolCache {
    pool: Arc<MessagePool>,
    local: Vec<u32>,
    capacity: usize,
}

impl PoolCache {
    #[must_use]
    pub fn new(pool: Arc<MessagePool>, capacity: usize) -> Self {
        Self {
            pool,
            local: Vec::with_capacity(capacity),
            capacity,
        }
    }

    fn batch(&self) -> usize {
        (self.capacity / 2).max(1)
    }

    fn refill(&mut self) {
        let batch = self.batch().min(self.capacity);
        while self.local.len() < batch {
            match self.pool.pop_free() {
                Some(index) => self.local.push(index),
                None => break,
            }
        }
    }

    /// Get a slot, from the cache if possible.
    pub fn get(&mut self) -> Option<PooledMessage> {
        let mut msg = if self.capacity == 0 {
            self.pool.allocate().ok()?
        } else {
            if self.local.is_empty() {
                self.refill();
            }
            let index = self.local.pop()?;
            self.pool.adopt(index)
        };
        *msg = BypassMessage::default();
        Some(msg)
    }

    /// Put a slot in the cache. Slots of another pool go back to their own pool.
    pub fn put(&mut self, msg: PooledMessage) {
        if !Arc::ptr_eq(msg.pool(), &self.pool) || self.capacity == 0 {
            return;
        }
        if self.local.len() == self.capacity {
            let keep = self.capacity - self.batch();
            for index in self.local.drain(keep..) {
                self.pool.release(index);
            }
        }
        self.local.push(msg.into_index());
    }

    /// Return every cached slot to the shared pool.
    pub fn flush(&mut self) {
        for index in self.local.drain(..) {
            self.pool.release(index);
        }
    }

    #[must_use]
    pub fn cached(&self) -> usize {
        self.local.len()
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<MessagePool> {
        &self.pool
    }
}

impl Drop for PoolCache {
    fn drop(&mut self) {
        self.flush();
    }
}
