// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Per-worker table of flow bypass states.

use std::collections::{HashMap, VecDeque};

use ahash::RandomState;
use channel::MessageKind;
use pkt_meta::FlowKey;
use tracing::{debug, trace};

use crate::state::{BypassState, Transition};

use tracectl::trace_target;
trace_target!("flow-state", LevelFilter::INFO, &["bypass"]);

#[derive(Debug, Clone, Copy)]
struct Entry {
    state: BypassState,
    /// Poll epoch in which the last ADD was issued.
    epoch: u64,
}

/// Number of tracked flows per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCounts {
    pub pending: usize,
    pub bypassed: usize,
    pub soft_deleted: usize,
    pub evicted: usize,
}

/// Bypass state of the flows one worker offloaded.
///
/// Flows not in the table are untracked. The table belongs to a single
/// worker and is never shared.
#[derive(Debug)]
pub struct FlowStates {
    flows: HashMap<FlowKey, Entry, RandomState>,
    /// ADDs awaiting promotion, oldest epoch first. Entries whose flow moved
    /// on or was added again are stale and skipped.
    pending: VecDeque<(u64, FlowKey)>,
    epoch: u64,
}

impl Default for FlowStates {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowStates {
    #[must_use]
    pub fn new() -> Self {
        Self {
            flows: HashMap::with_hasher(RandomState::new()),
            pending: VecDeque::new(),
            epoch: 0,
        }
    }

    #[must_use]
    pub fn state(&self, key: &FlowKey) -> BypassState {
        self.flows.get(key).map_or(BypassState::Untracked, |e| e.state)
    }

    /// Can the engine skip this flow?
    #[must_use]
    pub fn is_bypassed(&self, key: &FlowKey) -> bool {
        self.state(key) == BypassState::Bypassed
    }

    /// Current poll epoch.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    fn apply(&mut self, kind: MessageKind, key: &FlowKey) -> Transition {
        let from = self.state(key);
        let Some(to) = from.next(kind) else {
            trace!("{kind} for {key}: stays {from}");
            return Transition::Unchanged(from);
        };
        match to {
            BypassState::Untracked => {
                self.flows.remove(key);
            }
            BypassState::Pending => {
                self.flows.insert(
                    *key,
                    Entry {
                        state: to,
                        epoch: self.epoch,
                    },
                );
                self.pending.push_back((self.epoch, *key));
            }
            _ => {
                if let Some(entry) = self.flows.get_mut(key) {
                    entry.state = to;
                }
            }
        }
        debug!("{kind} for {key}: {from} -> {to}");
        Transition::Moved { from, to }
    }

    /// Record a message the engine is sending for `key`.
    pub fn apply_outbound(&mut self, kind: MessageKind, key: &FlowKey) -> Transition {
        if !kind.is_engine_to_offload() {
            debug!("Not applying {kind} for {key}: offload side message");
            return Transition::Ignored(kind);
        }
        self.apply(kind, key)
    }

    /// Apply a message the offload side sent about `key`.
    pub fn apply_inbound(&mut self, kind: MessageKind, key: &FlowKey) -> Transition {
        if !kind.is_offload_to_engine() {
            debug!("Not applying {kind} for {key}: engine side message");
            return Transition::Ignored(kind);
        }
        self.apply(kind, key)
    }

    /// Promote to bypassed the pending flows whose ADD was issued in an
    /// epoch below `settled`, then open a new epoch.
    ///
    /// The offload side only answers an ADD when it fails. Once the caller
    /// knows every ADD before `settled` was finished and every answer to
    /// them was applied, silence means success.
    ///
    /// Returns the number of flows promoted.
    pub fn promote_pending(&mut self, settled: u64) -> usize {
        let mut promoted = 0;
        while let Some(&(epoch, key)) = self.pending.front() {
            if epoch >= settled {
                break;
            }
            self.pending.pop_front();
            let Some(entry) = self.flows.get_mut(&key) else {
                continue;
            };
            if entry.state == BypassState::Pending && entry.epoch == epoch {
                entry.state = BypassState::Bypassed;
                promoted += 1;
                trace!("{key}: pending -> bypassed");
            }
        }
        self.epoch += 1;
        promoted
    }

    /// ADDs still waiting for [`FlowStates::promote_pending`], stale ones included.
    #[must_use]
    pub fn awaiting_promotion(&self) -> usize {
        self.pending.len()
    }

    /// Forget evicted flows and return their keys, so that software
    /// inspection resumes for them.
    pub fn take_evicted(&mut self) -> Vec<FlowKey> {
        let evicted: Vec<FlowKey> = self
            .flows
            .iter()
            .filter(|(_, e)| e.state == BypassState::Evicted)
            .map(|(k, _)| *k)
            .collect();
        for key in &evicted {
            self.flows.remove(key);
        }
        evicted
    }

    #[must_use]
    pub fn counts(&self) -> StateCounts {
        let mut counts = StateCounts::default();
        for entry in self.flows.values() {
            match entry.state {
                BypassState::Pending => counts.pending += 1,
                BypassState::Bypassed => counts.bypassed += 1,
                BypassState::SoftDeleted => counts.soft_deleted += 1,
                BypassState::Evicted => counts.evicted += 1,
                BypassState::Untracked => {}
            }
        }
        counts
    }

    /// Number of tracked flows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FlowKey, BypassState)> {
        self.flows.iter().map(|(k, e)| (k, e.state))
    }
}
