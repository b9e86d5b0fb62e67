// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Engine side of a queue.

use std::collections::VecDeque;

use channel::{ChannelEndpoint, MessageKind, SendError, TryReceive};
use flow_state::{BypassState, FlowStates, StateCounts, Transition};
use iface::{IfaceHandle, QueueId, Released};
use metrics::counter;
use pkt_meta::{FlowKey, RuleList};
use tracing::{debug, trace, warn};

use tracectl::trace_target;
trace_target!("bypass-worker", LevelFilter::INFO, &["bypass"]);

pub const BACKPRESSURE: &str = "bypass_worker_backpressure";
pub const EVICTIONS: &str = "bypass_worker_evictions";

/// Why a message could not be handed to the offload side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backpressure {
    /// Every message slot is checked out.
    Exhausted,
    /// The tasks ring is full.
    Full,
}

impl std::fmt::Display for Backpressure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backpressure::Exhausted => write!(f, "message pool exhausted"),
            Backpressure::Full => write!(f, "tasks ring full"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BypassError {
    /// Nothing was sent and the flow state is unchanged; retrying or
    /// giving up is the caller's call.
    #[error("{kind} for {key} not sent: {cause}")]
    Backpressure {
        kind: MessageKind,
        key: FlowKey,
        cause: Backpressure,
    },
    #[error("bypass worker of queue {0} is closed")]
    Closed(QueueId),
}

/// What one [`BypassWorker::poll`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    /// Messages received from the offload side.
    pub received: usize,
    /// Received messages with an unknown kind.
    pub malformed: usize,
    /// Flows promoted from pending to bypassed.
    pub promoted: usize,
    /// Messages sent and not yet finished by the offload side.
    pub pending: usize,
}

/// Bypass control of the flows of one claimed queue, owned by one engine worker.
#[derive(Debug)]
pub struct BypassWorker {
    queue: QueueId,
    endpoint: ChannelEndpoint,
    flows: FlowStates,
    /// Every ADD of an epoch below this one has been finished by the peer.
    settled: u64,
    /// Messages sent so far.
    sent: u64,
    /// Messages sent by the end of each unsettled epoch, oldest first.
    marks: VecDeque<(u64, u64)>,
    iface: Option<IfaceHandle>,
}

impl BypassWorker {
    pub(crate) fn new(queue: QueueId, endpoint: ChannelEndpoint, iface: IfaceHandle) -> Self {
        debug!("Bypass worker attached to {} queue {queue}", iface.name());
        Self {
            queue,
            endpoint,
            flows: FlowStates::new(),
            settled: 0,
            sent: 0,
            marks: VecDeque::new(),
            iface: Some(iface),
        }
    }

    #[must_use]
    pub fn queue(&self) -> QueueId {
        self.queue
    }

    fn send(
        &mut self,
        kind: MessageKind,
        key: &FlowKey,
        rules: Option<&RuleList>,
    ) -> Result<Transition, BypassError> {
        if self.iface.is_none() {
            return Err(BypassError::Closed(self.queue));
        }
        let Ok(mut msg) = self.endpoint.allocate() else {
            return Err(self.backpressure(kind, key, Backpressure::Exhausted));
        };
        msg.set(kind, *key);
        if let Some(rules) = rules {
            *msg.rules_mut() = *rules;
        }
        match self.endpoint.send(msg) {
            Ok(()) => {
                self.sent += 1;
                Ok(self.flows.apply_outbound(kind, key))
            }
            Err(err) => {
                if let SendError::ForeignMessage(_) = err {
                    warn!("{kind} for {key}: message from another queue's pool");
                }
                self.endpoint.free(err.into_inner());
                Err(self.backpressure(kind, key, Backpressure::Full))
            }
        }
    }

    fn backpressure(&self, kind: MessageKind, key: &FlowKey, cause: Backpressure) -> BypassError {
        trace!("{kind} for {key} on queue {}: {cause}", self.queue);
        counter!(BACKPRESSURE, "queue" => self.queue.to_string()).increment(1);
        BypassError::Backpressure {
            kind,
            key: *key,
            cause,
        }
    }

    /// Ask the data path to filter `key` (ADD).
    ///
    /// The flow is pending until a [`BypassWorker::poll`] finds the offload
    /// side finished the request without complaint.
    ///
    /// # Errors
    ///
    /// [`BypassError::Backpressure`] if the request could not be queued.
    pub fn offload_flow(&mut self, key: &FlowKey, rules: &RuleList) -> Result<Transition, BypassError> {
        self.send(MessageKind::Add, key, Some(rules))
    }

    /// Refresh the rule of an offloaded flow (UPDATE).
    ///
    /// # Errors
    ///
    /// [`BypassError::Backpressure`] if the request could not be queued.
    pub fn refresh(&mut self, key: &FlowKey, rules: &RuleList) -> Result<Transition, BypassError> {
        self.send(MessageKind::Update, key, Some(rules))
    }

    /// Stop filtering `key` but let the data path keep its counters (SOFT_DELETE).
    ///
    /// # Errors
    ///
    /// [`BypassError::Backpressure`] if the request could not be queued.
    pub fn soft_delete(&mut self, key: &FlowKey) -> Result<Transition, BypassError> {
        self.send(MessageKind::SoftDelete, key, None)
    }

    /// Remove the rule of `key` (HARD_DELETE).
    ///
    /// # Errors
    ///
    /// [`BypassError::Backpressure`] if the request could not be queued.
    pub fn hard_delete(&mut self, key: &FlowKey) -> Result<Transition, BypassError> {
        self.send(MessageKind::HardDelete, key, None)
    }

    /// Apply what the offload side sent, then settle pending flows.
    ///
    /// A pending flow becomes bypassed on the first poll that finds its ADD
    /// reported complete by the offload side, provided no FLOW_NOT_FOUND came
    /// back for it. The completion count is loaded before the results are
    /// drained, so every reply it covers has been applied.
    pub fn poll(&mut self) -> PollSummary {
        let mut summary = PollSummary::default();
        let epoch = self.flows.epoch();
        let completed = self.endpoint.completed();
        while let TryReceive::Message(msg) = self.endpoint.try_receive() {
            summary.received += 1;
            match msg.kind() {
                Ok(kind) => {
                    let transition = self.flows.apply_inbound(kind, msg.key());
                    if matches!(kind, MessageKind::Evict | MessageKind::ForceEvict)
                        && transition.changed()
                    {
                        counter!(EVICTIONS, "kind" => kind.to_string()).increment(1);
                    }
                }
                Err(err) => {
                    summary.malformed += 1;
                    warn!("Dropping bypass message on queue {}: {err}", self.queue);
                }
            }
            self.endpoint.free(msg);
        }
        match self.marks.back_mut() {
            Some(last) if last.1 == self.sent => last.0 = epoch,
            _ => self.marks.push_back((epoch, self.sent)),
        }
        while let Some(&(marked, sent)) = self.marks.front() {
            if sent > completed {
                break;
            }
            self.settled = marked + 1;
            self.marks.pop_front();
        }
        summary.promoted = self.flows.promote_pending(self.settled);
        summary.pending = usize::try_from(self.sent.saturating_sub(completed)).unwrap_or(usize::MAX);
        if summary.received > 0 || summary.promoted > 0 {
            debug!("Queue {} poll: {summary:?}", self.queue);
        }
        summary
    }

    #[must_use]
    pub fn state(&self, key: &FlowKey) -> BypassState {
        self.flows.state(key)
    }

    /// Can the engine skip `key`?
    #[must_use]
    pub fn is_bypassed(&self, key: &FlowKey) -> bool {
        self.flows.is_bypassed(key)
    }

    /// Flows the offload side evicted, for which inspection must resume.
    pub fn take_evicted(&mut self) -> Vec<FlowKey> {
        self.flows.take_evicted()
    }

    #[must_use]
    pub fn counts(&self) -> StateCounts {
        self.flows.counts()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.iface.is_none()
    }

    /// Apply the last results, give the cached message slots back and
    /// release the interface. Closing twice does nothing.
    pub fn close(&mut self) -> Option<Released> {
        let iface = self.iface.take()?;
        let late = self.poll_inbound_only();
        self.endpoint.flush();
        debug!(
            "Closing bypass worker of {} queue {} ({late} late results)",
            iface.name(),
            self.queue,
        );
        Some(iface.release())
    }

    fn poll_inbound_only(&mut self) -> usize {
        let mut received = 0;
        while let TryReceive::Message(msg) = self.endpoint.try_receive() {
            if let Ok(kind) = msg.kind() {
                self.flows.apply_inbound(kind, msg.key());
            }
            self.endpoint.free(msg);
            received += 1;
        }
        received
    }
}

impl Drop for BypassWorker {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use channel::OffloadEndpoint;
    use iface::{IfaceConfig, IfaceParams};
    use std::net::Ipv6Addr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tracing_test::traced_test;

    fn worker(torn: &Arc<AtomicBool>) -> (BypassWorker, OffloadEndpoint) {
        let mut params = IfaceParams::new("eth0");
        params.link.ring_size = 4;
        params.link.pool_size = 8;
        params.link.cache_size = 2;
        let torn = Arc::clone(torn);
        let iface = IfaceConfig::create(params, 1, move |_: &IfaceConfig| {
            torn.store(true, Ordering::Release);
        })
        .unwrap();
        let queue = iface.claim_queue().unwrap();
        let link = iface.link(queue).unwrap();
        let (engine, offload) = (link.worker_endpoint(), link.offload_endpoint());
        (BypassWorker::new(queue, engine, iface), offload)
    }

    fn key(port: u16) -> FlowKey {
        FlowKey::new(
            Ipv6Addr::LOCALHOST.into(),
            Ipv6Addr::LOCALHOST.into(),
            port,
            8080,
            6,
        )
    }

    fn take(offload: &mut OffloadEndpoint) -> Vec<(MessageKind, FlowKey)> {
        let mut tasks = vec![];
        while let TryReceive::Message(msg) = offload.try_receive() {
            tasks.push((msg.kind().unwrap(), *msg.key()));
            offload.free(msg);
        }
        tasks
    }

    /// Finish every task, like an offload side that accepts everything.
    fn consume(offload: &mut OffloadEndpoint) -> Vec<(MessageKind, FlowKey)> {
        let tasks = take(offload);
        offload.complete(tasks.len() as u64);
        tasks
    }

    fn answer(offload: &mut OffloadEndpoint, kind: MessageKind, key: FlowKey) {
        let mut msg = offload.allocate().unwrap();
        msg.set(kind, key);
        offload.send(msg).unwrap();
    }

    #[test]
    fn requests_carry_their_rules() {
        let torn = Arc::new(AtomicBool::new(false));
        let (mut worker, mut offload) = worker(&torn);
        let mut rules = RuleList::new();
        rules.push(11).unwrap();
        worker.offload_flow(&key(1), &rules).unwrap();
        let TryReceive::Message(msg) = offload.try_receive() else {
            panic!("ADD not sent");
        };
        assert_eq!(msg.kind(), Ok(MessageKind::Add));
        assert_eq!(msg.rules().as_slice(), &[11]);
        offload.free(msg);

        assert_eq!(
            worker.refresh(&key(1), &rules),
            Ok(Transition::Unchanged(BypassState::Pending))
        );
        assert_eq!(consume(&mut offload), vec![(MessageKind::Update, key(1))]);
    }

    #[test]
    fn pending_flows_wait_for_a_settled_poll() {
        let torn = Arc::new(AtomicBool::new(false));
        let (mut worker, mut offload) = worker(&torn);
        worker.offload_flow(&key(1), &RuleList::new()).unwrap();
        assert_eq!(worker.poll().pending, 1);

        worker.offload_flow(&key(2), &RuleList::new()).unwrap();
        let TryReceive::Message(msg) = offload.try_receive() else {
            panic!("ADD not sent");
        };
        offload.free(msg);
        // received is not finished
        assert_eq!(worker.poll().promoted, 0);
        offload.complete(1);
        let summary = worker.poll();
        assert_eq!((summary.promoted, summary.pending), (1, 1));
        assert!(worker.is_bypassed(&key(1)));
        assert_eq!(worker.state(&key(2)), BypassState::Pending);

        consume(&mut offload);
        let summary = worker.poll();
        assert_eq!((summary.promoted, summary.pending), (1, 0));
        assert_eq!(worker.counts().bypassed, 2);
    }

    #[test]
    #[traced_test]
    fn answers_are_applied_before_promotion() {
        let torn = Arc::new(AtomicBool::new(false));
        let (mut worker, mut offload) = worker(&torn);
        worker.offload_flow(&key(1), &RuleList::new()).unwrap();
        worker.offload_flow(&key(2), &RuleList::new()).unwrap();
        take(&mut offload);
        assert_eq!(worker.poll().promoted, 0);
        answer(&mut offload, MessageKind::FlowNotFound, key(1));
        answer(&mut offload, MessageKind::ForceEvict, key(3));
        offload.complete(2);

        let summary = worker.poll();
        assert_eq!(summary.received, 2);
        assert_eq!(summary.promoted, 1);
        assert_eq!(worker.state(&key(1)), BypassState::Untracked);
        assert!(worker.is_bypassed(&key(2)));
        // nothing to evict for an unknown flow
        assert!(worker.take_evicted().is_empty());

        answer(&mut offload, MessageKind::Evict, key(2));
        worker.poll();
        assert_eq!(worker.take_evicted(), vec![key(2)]);
        assert!(logs_contain("Queue 0 poll"));
    }

    #[test]
    fn close_flushes_and_releases() {
        let torn = Arc::new(AtomicBool::new(false));
        let (mut worker, mut offload) = worker(&torn);
        worker.offload_flow(&key(1), &RuleList::new()).unwrap();
        consume(&mut offload);
        answer(&mut offload, MessageKind::FlowNotFound, key(1));

        assert_eq!(worker.close(), Some(Released::TornDown));
        assert!(torn.load(Ordering::Acquire));
        assert!(worker.is_closed());
        assert_eq!(worker.state(&key(1)), BypassState::Untracked);
        assert_eq!(worker.close(), None);
        assert_eq!(
            worker.soft_delete(&key(1)),
            Err(BypassError::Closed(worker.queue()))
        );
    }

    #[test]
    fn drop_releases() {
        let torn = Arc::new(AtomicBool::new(false));
        let (worker, _offload) = worker(&torn);
        drop(worker);
        assert!(torn.load(Ordering::Acquire));
    }
}
