// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Offload side of a queue.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use channel::{MessageKind, OffloadEndpoint, TryReceive};
use iface::QueueId;
use metrics::counter;
use pkt_meta::{FlowKey, MetadataEnvelope, ParseError, RuleList};
use tracing::{debug, trace, warn};

use crate::config::AssistantConfig;
use crate::fifo::FifoMap;

use tracectl::trace_target;
trace_target!("bypass-assistant", LevelFilter::INFO, &["bypass"]);

pub const FORCE_EVICTIONS: &str = "bypass_assistant_force_evictions";
pub const BACKLOG_STALLS: &str = "bypass_assistant_backlog_stalls";

/// Where a packet goes after [`BypassAssistant::ingest`].
#[derive(Debug)]
pub enum Verdict {
    /// The flow is offloaded; the engine never sees the packet.
    Bypassed,
    /// The engine must inspect the packet; its headers are already parsed.
    ToEngine(MetadataEnvelope),
    Malformed(ParseError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssistantStats {
    pub installed: u64,
    pub updated: u64,
    pub soft_deleted: u64,
    pub removed: u64,
    pub force_evicted: u64,
    pub expired: u64,
    pub not_found: u64,
    /// Polls that left tasks queued because replies were still undelivered.
    pub backlog_stalls: u64,
    pub bypassed_packets: u64,
    pub to_engine: u64,
    pub malformed: u64,
}

#[derive(Debug, Clone, Copy)]
struct Rule {
    rules: RuleList,
    soft_deleted: bool,
    last_seen: Instant,
    packets: u64,
}

/// Holds the flow rules of one queue and answers its engine worker.
///
/// Rules are kept in install order, so the oldest goes first when the table
/// is full.
///
/// Replies are never dropped. When the results ring is full they wait in a
/// backlog, and no further task is taken until the backlog is flushed. Tasks
/// are reported complete to the worker only once all their replies are on the
/// ring.
#[derive(Debug)]
pub struct BypassAssistant {
    queue: QueueId,
    endpoint: OffloadEndpoint,
    config: AssistantConfig,
    /// Flows seen on the wire and not offloaded.
    observed: FifoMap<FlowKey, Instant>,
    rules: FifoMap<FlowKey, Rule>,
    backlog: VecDeque<(MessageKind, FlowKey)>,
    /// Tasks handled and not yet reported complete.
    held: u64,
    stats: AssistantStats,
}

impl BypassAssistant {
    pub(crate) fn new(queue: QueueId, endpoint: OffloadEndpoint, config: AssistantConfig) -> Self {
        Self {
            queue,
            endpoint,
            config,
            observed: FifoMap::new(),
            rules: FifoMap::new(),
            backlog: VecDeque::new(),
            held: 0,
            stats: AssistantStats::default(),
        }
    }

    #[must_use]
    pub fn queue(&self) -> QueueId {
        self.queue
    }

    #[must_use]
    pub fn stats(&self) -> AssistantStats {
        self.stats
    }

    /// Number of flow rules held.
    #[must_use]
    pub fn installed(&self) -> usize {
        self.rules.len()
    }

    /// Is a rule filtering `key` (in either direction)?
    #[must_use]
    pub fn is_installed(&self, key: &FlowKey) -> bool {
        self.rule_key(key)
            .and_then(|k| self.rules.get(&k))
            .is_some_and(|rule| !rule.soft_deleted)
    }

    /// Replies waiting for room on the results ring.
    #[must_use]
    pub fn backlog(&self) -> usize {
        self.backlog.len()
    }

    fn rule_key(&self, key: &FlowKey) -> Option<FlowKey> {
        if self.rules.contains_key(key) {
            return Some(*key);
        }
        let reversed = key.reversed();
        self.rules.contains_key(&reversed).then_some(reversed)
    }

    fn was_observed(&self, key: &FlowKey) -> bool {
        self.observed.contains_key(key) || self.observed.contains_key(&key.reversed())
    }

    fn forget_observed(&mut self, key: &FlowKey) {
        self.observed.remove(key);
        self.observed.remove(&key.reversed());
    }

    fn observe(&mut self, key: FlowKey, now: Instant) {
        if self.config.observed == 0 {
            return;
        }
        if !self.observed.contains_key(&key) && self.observed.len() >= self.config.observed {
            self.observed.pop_oldest();
        }
        self.observed.insert(key, now);
    }

    /// Send a reply, or queue it behind earlier ones that did not fit.
    fn reply(&mut self, kind: MessageKind, key: FlowKey) {
        if self.backlog.is_empty() && self.try_send(kind, key) {
            return;
        }
        trace!("Queue {}: results ring full, {kind} for {key} delayed", self.queue);
        self.backlog.push_back((kind, key));
    }

    fn try_send(&mut self, kind: MessageKind, key: FlowKey) -> bool {
        let Ok(mut msg) = self.endpoint.allocate() else {
            return false;
        };
        msg.set(kind, key);
        match self.endpoint.send(msg) {
            Ok(()) => true,
            Err(err) => {
                self.endpoint.free(err.into_inner());
                false
            }
        }
    }

    fn flush_backlog(&mut self) {
        let mut sent = 0;
        while let Some(&(kind, key)) = self.backlog.front() {
            if !self.try_send(kind, key) {
                break;
            }
            self.backlog.pop_front();
            sent += 1;
        }
        if sent > 0 {
            trace!("Queue {}: {sent} delayed replies sent", self.queue);
        }
        self.publish();
    }

    /// Report the held tasks complete once none of their replies is pending.
    fn publish(&mut self) {
        if self.backlog.is_empty() && self.held > 0 {
            self.endpoint.complete(self.held);
            self.held = 0;
        }
    }

    fn install(&mut self, key: FlowKey, rules: RuleList, now: Instant) {
        if let Some(k) = self.rule_key(&key) {
            if let Some(rule) = self.rules.get_mut(&k) {
                rule.rules = rules;
                rule.soft_deleted = false;
                rule.last_seen = now;
                self.stats.updated += 1;
                trace!("Queue {}: rule for {key} revived", self.queue);
            }
            return;
        }
        if !self.was_observed(&key) {
            self.stats.not_found += 1;
            debug!("Queue {}: ADD for unknown flow {key}", self.queue);
            self.reply(MessageKind::FlowNotFound, key);
            return;
        }
        if self.config.capacity == 0 {
            self.stats.force_evicted += 1;
            self.reply(MessageKind::ForceEvict, key);
            return;
        }
        while self.rules.len() >= self.config.capacity {
            let Some((oldest, _)) = self.rules.pop_oldest() else {
                break;
            };
            self.stats.force_evicted += 1;
            counter!(FORCE_EVICTIONS, "queue" => self.queue.to_string()).increment(1);
            debug!("Queue {}: rule table full, evicting {oldest}", self.queue);
            self.reply(MessageKind::ForceEvict, oldest);
        }
        self.forget_observed(&key);
        self.rules.insert(
            key,
            Rule {
                rules,
                soft_deleted: false,
                last_seen: now,
                packets: 0,
            },
        );
        self.stats.installed += 1;
        trace!("Queue {}: rule for {key} installed", self.queue);
    }

    fn handle(&mut self, kind: MessageKind, key: FlowKey, rules: RuleList, now: Instant) {
        match kind {
            MessageKind::Add => self.install(key, rules, now),
            MessageKind::Update | MessageKind::SoftDelete => {
                let Some(rule) = self.rule_key(&key).and_then(|k| self.rules.get_mut(&k)) else {
                    self.stats.not_found += 1;
                    self.reply(MessageKind::FlowNotFound, key);
                    return;
                };
                if kind == MessageKind::Update {
                    rule.rules = rules;
                    rule.last_seen = now;
                    self.stats.updated += 1;
                } else {
                    rule.soft_deleted = true;
                    self.stats.soft_deleted += 1;
                }
            }
            MessageKind::HardDelete => {
                // already gone is fine
                if let Some(k) = self.rule_key(&key) {
                    self.rules.remove(&k);
                    self.stats.removed += 1;
                }
            }
            MessageKind::ForceEvict | MessageKind::Evict | MessageKind::FlowNotFound => {
                warn!("Queue {}: ignoring {kind} for {key} from the engine", self.queue);
            }
        }
    }

    /// Retry delayed replies, then handle the tasks of the engine worker
    /// until none is left or a reply does not fit on the results ring.
    ///
    /// Returns the number of tasks handled.
    pub fn poll(&mut self) -> usize {
        self.flush_backlog();
        let now = Instant::now();
        let mut handled = 0;
        while self.backlog.is_empty() {
            let TryReceive::Message(msg) = self.endpoint.try_receive() else {
                break;
            };
            handled += 1;
            self.held += 1;
            let (key, rules) = (*msg.key(), *msg.rules());
            let kind = msg.kind();
            self.endpoint.free(msg);
            match kind {
                Ok(kind) => self.handle(kind, key, rules, now),
                Err(err) => warn!("Queue {}: dropping task: {err}", self.queue),
            }
        }
        self.publish();
        if !self.backlog.is_empty() && !self.endpoint.link().tasks().is_empty() {
            self.stats.backlog_stalls += 1;
            counter!(BACKLOG_STALLS, "queue" => self.queue.to_string()).increment(1);
            debug!(
                "Queue {}: tasks wait behind {} undelivered replies",
                self.queue,
                self.backlog.len()
            );
        }
        handled
    }

    /// Remove the rules idle for at least `idle` and tell the engine (EVICT).
    ///
    /// Returns the number of rules removed.
    pub fn expire(&mut self, now: Instant, idle: Duration) -> usize {
        let is_idle = |seen: Instant| now.saturating_duration_since(seen) >= idle;
        let expired = self.rules.retain(|_, rule| !is_idle(rule.last_seen));
        self.observed.retain(|_, seen| !is_idle(*seen));
        for key in &expired {
            self.reply(MessageKind::Evict, *key);
        }
        self.stats.expired += expired.len() as u64;
        if !expired.is_empty() {
            debug!("Queue {}: {} idle rules expired", self.queue, expired.len());
        }
        expired.len()
    }

    /// Parse a frame and decide whether the engine needs to see it.
    pub fn ingest(&mut self, frame: &[u8]) -> Verdict {
        let env = match MetadataEnvelope::parse(frame) {
            Ok(env) => env,
            Err(err) => {
                self.stats.malformed += 1;
                return Verdict::Malformed(err);
            }
        };
        let now = Instant::now();
        let Some(key) = FlowKey::from_envelope(&env) else {
            self.stats.to_engine += 1;
            return Verdict::ToEngine(env);
        };
        if let Some(rule) = self.rule_key(&key).and_then(|k| self.rules.get_mut(&k)) {
            rule.last_seen = now;
            rule.packets += 1;
            if !rule.soft_deleted {
                self.stats.bypassed_packets += 1;
                return Verdict::Bypassed;
            }
        } else {
            self.observe(key, now);
        }
        self.stats.to_engine += 1;
        Verdict::ToEngine(env)
    }

    /// Rule ids the engine attached to the rule of `key`.
    #[must_use]
    pub fn rule_ids(&self, key: &FlowKey) -> Option<&RuleList> {
        self.rule_key(key)
            .and_then(|k| self.rules.get(&k))
            .map(|rule| &rule.rules)
    }

    /// Packets seen for the rule of `key`, soft deleted or not.
    #[must_use]
    pub fn packets(&self, key: &FlowKey) -> Option<u64> {
        self.rule_key(key)
            .and_then(|k| self.rules.get(&k))
            .map(|rule| rule.packets)
    }
}
