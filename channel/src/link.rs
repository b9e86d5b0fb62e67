// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::endpoint::{ChannelEndpoint, Endpoint, OffloadEndpoint};
use crate::pool::MessagePool;
use crate::ring::Ring;

use tracectl::trace_target;
trace_target!("bypass-channel", LevelFilter::INFO, &["bypass"]);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("bypass ring size must be non-zero")]
    ZeroRingSize,
    #[error("bypass message pool size must be non-zero")]
    ZeroPoolSize,
    #[error("bypass message pool size {0} is too large")]
    PoolTooLarge(usize),
    #[error("bypass message cache size {cache} exceeds pool size {pool}")]
    CacheLargerThanPool { cache: usize, pool: usize },
}

/// Sizing of one bypass link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct LinkConfig {
    /// Capacity of each of the two rings.
    #[serde(default = "LinkConfig::default_ring_size")]
    pub ring_size: usize,
    /// Number of message slots.
    #[serde(default = "LinkConfig::default_pool_size")]
    pub pool_size: usize,
    /// Capacity of each endpoint cache. Zero disables caching.
    #[serde(default = "LinkConfig::default_cache_size")]
    pub cache_size: usize,
}

impl LinkConfig {
    const fn default_ring_size() -> usize {
        1024
    }
    const fn default_pool_size() -> usize {
        2048
    }
    const fn default_cache_size() -> usize {
        32
    }

    /// # Errors
    ///
    /// Rejects empty rings or pools, and caches larger than the pool.
    pub fn validate(&self) -> Result<(), ChannelError> {
        if self.ring_size == 0 {
            return Err(ChannelError::ZeroRingSize);
        }
        if self.pool_size == 0 {
            return Err(ChannelError::ZeroPoolSize);
        }
        if u32::try_from(self.pool_size).is_err() {
            return Err(ChannelError::PoolTooLarge(self.pool_size));
        }
        if self.cache_size > self.pool_size {
            return Err(ChannelError::CacheLargerThanPool {
                cache: self.cache_size,
                pool: self.pool_size,
            });
        }
        Ok(())
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            ring_size: Self::default_ring_size(),
            pool_size: Self::default_pool_size(),
            cache_size: Self::default_cache_size(),
        }
    }
}

/// The rings and message pool shared by the two endpoints of one queue.
#[derive(Debug)]
pub struct BypassLink {
    queue: u16,
    tasks: Ring,
    results: Ring,
    pool: Arc<MessagePool>,
    cache_size: usize,
    /// Tasks the offload side finished, replies included.
    completed: AtomicU64,
}

impl BypassLink {
    /// Build the link of rx queue `queue`.
    ///
    /// # Errors
    ///
    /// Fails if `config` does not validate.
    pub fn new(name: &str, queue: u16, config: &LinkConfig) -> Result<Arc<Self>, ChannelError> {
        config.validate()?;
        #[allow(clippy::cast_possible_truncation)] // validated above
        let pool = MessagePool::new(config.pool_size as u32);
        debug!(
            "Built bypass link {name}:{queue} rings={} pool={} cache={}",
            config.ring_size, config.pool_size, config.cache_size
        );
        Ok(Arc::new(Self {
            queue,
            tasks: Ring::new(format!("{name}-tasks-{queue}"), config.ring_size),
            results: Ring::new(format!("{name}-results-{queue}"), config.ring_size),
            pool,
            cache_size: config.cache_size,
            completed: AtomicU64::new(0),
        }))
    }

    #[must_use]
    pub fn queue(&self) -> u16 {
        self.queue
    }

    /// Engine to offload.
    #[must_use]
    pub fn tasks(&self) -> &Ring {
        &self.tasks
    }

    /// Offload to engine.
    #[must_use]
    pub fn results(&self) -> &Ring {
        &self.results
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<MessagePool> {
        &self.pool
    }

    /// Number of tasks the offload side has finished.
    ///
    /// A task is finished once every reply it caused is on the results ring,
    /// so a reader that loads this count and then drains the results ring
    /// has seen every answer to those tasks.
    #[must_use]
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    pub(crate) fn complete(&self, tasks: u64) {
        self.completed.fetch_add(tasks, Ordering::Release);
    }

    /// The engine worker side of the link.
    #[must_use]
    pub fn worker_endpoint(self: &Arc<Self>) -> ChannelEndpoint {
        Endpoint::new(Arc::clone(self), self.cache_size)
    }

    /// The offload process side of the link.
    #[must_use]
    pub fn offload_endpoint(self: &Arc<Self>) -> OffloadEndpoint {
        Endpoint::new(Arc::clone(self), self.cache_size)
    }

    /// Return every in-flight message of both rings to the pool.
    ///
    /// Returns the number of messages drained.
    pub fn drain(&self) -> usize {
        let mut drained = 0;
        for ring in [&self.tasks, &self.results] {
            while let Some(index) = ring.pop() {
                self.pool.release(index);
                drained += 1;
            }
        }
        if drained > 0 {
            info!("Drained {drained} in-flight bypass messages of queue {}", self.queue);
        }
        drained
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn config_validation() {
        assert!(LinkConfig::default().validate().is_ok());
        let bad = LinkConfig {
            ring_size: 0,
            ..Default::default()
        };
        assert_eq!(BypassLink::new("eth0", 0, &bad).unwrap_err(), ChannelError::ZeroRingSize);
        let bad = LinkConfig {
            pool_size: 0,
            cache_size: 0,
            ..Default::default()
        };
        assert_eq!(bad.validate(), Err(ChannelError::ZeroPoolSize));
        let bad = LinkConfig {
            pool_size: 4,
            cache_size: 8,
            ..Default::default()
        };
        assert_eq!(
            bad.validate(),
            Err(ChannelError::CacheLargerThanPool { cache: 8, pool: 4 })
        );
    }

    #[test]
    #[traced_test]
    fn drain_frees_messages_of_both_rings() {
        let config = LinkConfig {
            ring_size: 4,
            pool_size: 4,
            cache_size: 0,
        };
        let link = BypassLink::new("eth0", 3, &config).unwrap();
        let worker = link.worker_endpoint();
        let offload = link.offload_endpoint();
        worker.send(link.pool().allocate().unwrap()).unwrap();
        worker.send(link.pool().allocate().unwrap()).unwrap();
        offload.send(link.pool().allocate().unwrap()).unwrap();
        assert_eq!(link.pool().available(), 1);

        assert_eq!(link.drain(), 3);
        assert_eq!(link.pool().available(), 4);
        assert!(link.tasks().is_empty() && link.results().is_empty());
        assert!(logs_contain("Drained 3 in-flight bypass messages of queue 3"));
        assert_eq!(link.drain(), 0);
    }

    #[test]
    fn completions_follow_replies() {
        let link = BypassLink::new("eth0", 0, &LinkConfig::default()).unwrap();
        let worker = link.worker_endpoint();
        let offload = link.offload_endpoint();
        worker.send(link.pool().allocate().unwrap()).unwrap();
        let task = offload.try_receive().into_option().unwrap();
        offload.send(task).unwrap();
        assert_eq!(link.completed(), 0);
        offload.complete(1);
        assert_eq!(worker.completed(), 1);
        assert!(worker.try_receive().into_option().is_some());
    }
}
