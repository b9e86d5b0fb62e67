// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use crossbeam::queue::ArrayQueue;

/// Bounded lock-free queue of message slot indices.
pub struct Ring {
    name: String,
    queue: ArrayQueue<u32>,
}

impl Ring {
    /// `capacity` must be non-zero.
    pub(crate) fn new(name: String, capacity: usize) -> Self {
        Self {
            name,
            queue: ArrayQueue::new(capacity),
        }
    }

    /// Enqueue a slot index, or give it back if the ring is full.
    ///
    /// # Errors
    ///
    /// Returns the index when the ring is full.
    pub fn push(&self, index: u32) -> Result<(), u32> {
        self.queue.push(index)
    }

    #[must_use]
    pub fn pop(&self) -> Option<u32> {
        self.queue.pop()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for Ring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Ring({}: {}/{})", self.name, self.len(), self.capacity())
    }
}
