// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Endpoints of a bypass link.

use std::marker::PhantomData;
use std::sync::Arc;

use tracing::trace;

use crate::link::BypassLink;
use crate::pool::{PoolCache, PooledMessage};
use crate::ring::Ring;

use tracectl::trace_target;
trace_target!("bypass-channel", LevelFilter::INFO, &["bypass"]);

/// The outbound ring had no room. The message is handed back untouched.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("bypass ring is full")]
    Full(PooledMessage),
    #[error("message belongs to another link's pool")]
    ForeignMessage(PooledMessage),
}

impl SendError {
    /// Take the message back.
    #[must_use]
    pub fn into_inner(self) -> PooledMessage {
        match self {
            SendError::Full(msg) | SendError::ForeignMessage(msg) => msg,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    #[error("bypass message pool exhausted")]
    Exhausted,
}

/// Outcome of a non-blocking receive. An empty ring is not an error.
#[derive(Debug)]
pub enum TryReceive {
    Message(PooledMessage),
    Empty,
}

impl TryReceive {
    #[must_use]
    pub fn into_option(self) -> Option<PooledMessage> {
        match self {
            TryReceive::Message(msg) => Some(msg),
            TryReceive::Empty => None,
        }
    }
}

/// Which rings an endpoint sends on and receives from.
pub trait Direction {
    const NAME: &'static str;
    fn outbound(link: &BypassLink) -> &Ring;
    fn inbound(link: &BypassLink) -> &Ring;
}

/// The engine worker side: sends tasks, receives results.
#[derive(Debug)]
pub struct Worker;

/// The offload side: receives tasks, sends results.
#[derive(Debug)]
pub struct Offload;

impl Direction for Worker {
    const NAME: &'static str = "worker";
    fn outbound(link: &BypassLink) -> &Ring {
        link.tasks()
    }
    fn inbound(link: &BypassLink) -> &Ring {
        link.results()
    }
}

impl Direction for Offload {
    const NAME: &'static str = "offload";
    fn outbound(link: &BypassLink) -> &Ring {
        link.results()
    }
    fn inbound(link: &BypassLink) -> &Ring {
        link.tasks()
    }
}

/// One side of a [`BypassLink`], owned by a single thread.
///
/// A single producer per endpoint makes delivery FIFO per endpoint.
pub struct Endpoint<D: Direction> {
    link: Arc<BypassLink>,
    cache: PoolCache,
    _direction: PhantomData<D>,
}

pub type ChannelEndpoint = Endpoint<Worker>;
pub type OffloadEndpoint = Endpoint<Offload>;

impl<D: Direction> Endpoint<D> {
    pub(crate) fn new(link: Arc<BypassLink>, cache_size: usize) -> Self {
        let cache = PoolCache::new(Arc::clone(link.pool()), cache_size);
        Self {
            link,
            cache,
            _direction: PhantomData,
        }
    }

    /// Enqueue a message on the outbound ring without blocking.
    ///
    /// # Errors
    ///
    /// [`SendError::Full`] gives the message back when the ring is full;
    /// retrying, counting or dropping it is up to the caller.
    pub fn send(&self, msg: PooledMessage) -> Result<(), SendError> {
        if !Arc::ptr_eq(msg.pool(), self.link.pool()) {
            return Err(SendError::ForeignMessage(msg));
        }
        let index = msg.into_index();
        D::outbound(&self.link).push(index).map_err(|index| {
            trace!("{} ring of queue {} full", D::NAME, self.link.queue());
            SendError::Full(self.link.pool().adopt(index))
        })
    }

    /// Dequeue the next inbound message, if any.
    #[must_use]
    pub fn try_receive(&self) -> TryReceive {
        match D::inbound(&self.link).pop() {
            Some(index) => TryReceive::Message(self.link.pool().adopt(index)),
            None => TryReceive::Empty,
        }
    }

    /// Get a blank message, from the endpoint cache first.
    ///
    /// # Errors
    ///
    /// [`AllocError::Exhausted`] when the pool has no free slot left.
    pub fn allocate(&mut self) -> Result<PooledMessage, AllocError> {
        self.cache.get().ok_or(AllocError::Exhausted)
    }

    /// Return a consumed or unsent message to the endpoint cache.
    pub fn free(&mut self, msg: PooledMessage) {
        self.cache.put(msg);
    }

    /// Messages sent by this endpoint and not yet consumed by the peer.
    #[must_use]
    pub fn pending(&self) -> usize {
        D::outbound(&self.link).len()
    }

    #[must_use]
    pub fn link(&self) -> &Arc<BypassLink> {
        &self.link
    }

    /// Return the cached slots to the shared pool.
    pub fn flush(&mut self) {
        self.cache.flush();
    }
}

impl Endpoint<Worker> {
    /// Number of sent tasks the offload side has finished. Load it before
    /// draining the results ring.
    #[must_use]
    pub fn completed(&self) -> u64 {
        self.link.completed()
    }
}

impl Endpoint<Offload> {
    /// Report `tasks` received tasks as finished. Every reply they caused
    /// must already be sent.
    pub fn complete(&self, tasks: u64) {
        if tasks > 0 {
            self.link.complete(tasks);
        }
    }
}

impl<D: Direction> std::fmt::Debug for Endpoint<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("direction", &D::NAME)
            .field("queue", &self.link.queue())
            .field("cached", &self.cache.cached())
            .finish_non_exhaustive()
    }
}
