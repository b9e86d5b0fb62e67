// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The shared, reference counted interface configuration.

use std::fmt::Display;
use std::ops::Deref;
use std::sync::OnceLock;

use capability::{CapabilitySet, CapabilityWord, Negotiation, OffloadIndices};
use channel::BypassLink;
use concurrency::sync::Arc;
use concurrency::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use tracing::{debug, error, info};

use crate::params::{IfaceParams, ParamsError};

use tracectl::trace_target;
trace_target!("iface", LevelFilter::INFO, &["bypass"]);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IfaceError {
    #[error(transparent)]
    Params(#[from] ParamsError),
    #[error("interface {name}: all {queues} rx queues already claimed")]
    QueuesExhausted { name: String, queues: u16 },
    #[error("interface {0}: offloads are frozen once a queue is claimed")]
    Frozen(String),
    #[error("interface {0}: offloads already negotiated")]
    AlreadyNegotiated(String),
}

/// Index of an rx queue, unique per interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueueId(pub u16);

impl Display for QueueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of releasing an [`IfaceHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Released {
    /// Other holders remain.
    Retained(usize),
    /// This release dropped the last reference and ran the teardown.
    TornDown,
}

/// What to do when the last reference to an interface goes away.
///
/// Runs exactly once, on the thread observing the count reach zero, after
/// the bypass links have been drained.
pub trait Teardown: Send + Sync {
    fn teardown(&self, config: &IfaceConfig);
}

impl<F> Teardown for F
where
    F: Fn(&IfaceConfig) + Send + Sync,
{
    fn teardown(&self, config: &IfaceConfig) {
        self(config);
    }
}

/// The negotiated offloads of an interface, with the set in force for its copy mode.
#[derive(Debug, Clone)]
pub struct Offloads {
    pub negotiation: Negotiation,
    pub active: CapabilitySet,
    pub word: CapabilityWord,
    pub indices: OffloadIndices,
}

/// Configuration of one interface, shared by every worker bound to it.
pub struct IfaceConfig {
    params: IfaceParams,
    links: Vec<std::sync::Arc<BypassLink>>,
    refcount: AtomicUsize,
    next_queue: AtomicU16,
    offloads: OnceLock<Offloads>,
    teardown: Box<dyn Teardown>,
}

impl std::fmt::Debug for IfaceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IfaceConfig")
            .field("name", &self.params.name)
            .field("refcount", &self.refcount.load(Ordering::Relaxed))
            .field("claimed", &self.next_queue.load(Ordering::Relaxed))
            .field("offloads", &self.offloads.get())
            .finish_non_exhaustive()
    }
}

impl IfaceConfig {
    /// Build the configuration of an interface and return the creator's handle.
    ///
    /// # Errors
    ///
    /// Configuration errors from [`IfaceParams::resolve`].
    pub fn create(
        params: IfaceParams,
        available_cores: u16,
        teardown: impl Teardown + 'static,
    ) -> Result<IfaceHandle, IfaceError> {
        let params = params.resolve(available_cores)?;
        let links = (0..params.rx_queues)
            .map(|queue| {
                BypassLink::new(&params.name, queue, &params.link).map_err(|source| {
                    ParamsError::Link {
                        name: params.name.clone(),
                        source,
                    }
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        info!(
            "Created interface {} port={} mode={:?} threads={} rx-queues={} copy-mode={:?}",
            params.name,
            params.port_id,
            params.mode,
            params.threads,
            params.rx_queues,
            params.copy_mode
        );
        let config = Arc::new(IfaceConfig {
            params,
            links,
            refcount: AtomicUsize::new(1),
            next_queue: AtomicU16::new(0),
            offloads: OnceLock::new(),
            teardown: Box::new(teardown),
        });
        Ok(IfaceHandle {
            config,
            released: false,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.params.name
    }

    #[must_use]
    pub fn params(&self) -> &IfaceParams {
        &self.params
    }

    #[must_use]
    pub fn threads(&self) -> u16 {
        self.params.threads
    }

    /// Current number of holders.
    #[must_use]
    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    /// Number of queues handed out so far.
    #[must_use]
    pub fn claimed(&self) -> u16 {
        self.next_queue.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn link(&self, queue: QueueId) -> Option<&std::sync::Arc<BypassLink>> {
        self.links.get(usize::from(queue.0))
    }

    pub fn links(&self) -> impl Iterator<Item = &std::sync::Arc<BypassLink>> {
        self.links.iter()
    }

    #[must_use]
    pub fn offloads(&self) -> Option<&Offloads> {
        self.offloads.get()
    }

    /// Record the negotiated offloads. The set in force is picked by the copy mode.
    ///
    /// # Errors
    ///
    /// [`IfaceError::Frozen`] once a queue was claimed,
    /// [`IfaceError::AlreadyNegotiated`] on a second call.
    pub fn set_offloads(&self, negotiation: Negotiation) -> Result<&Offloads, IfaceError> {
        if self.claimed() > 0 {
            return Err(IfaceError::Frozen(self.params.name.clone()));
        }
        let active = *negotiation.final_set(self.params.copy_mode.final_mode());
        let word = active.encode();
        let offloads = Offloads {
            negotiation,
            active,
            word,
            indices: OffloadIndices::of(word),
        };
        let already = || IfaceError::AlreadyNegotiated(self.params.name.clone());
        self.offloads.set(offloads).map_err(|_| already())?;
        let stored = self.offloads.get().ok_or_else(already)?;
        info!("Interface {}: offloads {}", self.params.name, stored.active);
        Ok(stored)
    }

    /// Claim the next rx queue. Each queue is handed out once.
    ///
    /// # Errors
    ///
    /// [`IfaceError::QueuesExhausted`] when every queue is taken: there are
    /// more workers than queues.
    pub fn claim_queue(&self) -> Result<QueueId, IfaceError> {
        let queues = self.params.rx_queues;
        self.next_queue
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |next| {
                (next < queues).then_some(next + 1)
            })
            .map(|queue| {
                debug!("Interface {}: claimed queue {queue}", self.params.name);
                QueueId(queue)
            })
            .map_err(|_| {
                error!(
                    "Interface {}: no rx queue left for another worker ({queues} configured)",
                    self.params.name
                );
                IfaceError::QueuesExhausted {
                    name: self.params.name.clone(),
                    queues,
                }
            })
    }

    fn release_ref(&self) -> Released {
        let previous = self.refcount.fetch_sub(1, Ordering::AcqRel);
        if previous > 1 {
            debug!(
                "Interface {}: released, {} holders left",
                self.params.name,
                previous - 1
            );
            return Released::Retained(previous - 1);
        }
        let drained: usize = self.links.iter().map(|link| link.drain()).sum();
        self.teardown.teardown(self);
        info!(
            "Tore down interface {} ({drained} in-flight messages drained)",
            self.params.name
        );
        Released::TornDown
    }
}

/// A counted reference to an [`IfaceConfig`].
///
/// Dropping a handle releases it.
#[derive(Debug)]
pub struct IfaceHandle {
    config: Arc<IfaceConfig>,
    released: bool,
}

impl IfaceHandle {
    /// Take another reference.
    #[must_use]
    pub fn acquire(&self) -> IfaceHandle {
        self.config.refcount.fetch_add(1, Ordering::AcqRel);
        IfaceHandle {
            config: Arc::clone(&self.config),
            released: false,
        }
    }

    /// Give up this reference, tearing the interface down if it was the last.
    pub fn release(mut self) -> Released {
        self.released = true;
        self.config.release_ref()
    }
}

impl Deref for IfaceHandle {
    type Target = IfaceConfig;

    fn deref(&self) -> &Self::Target {
        &self.config
    }
}

impl Drop for IfaceHandle {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.config.release_ref();
        }
    }
}
