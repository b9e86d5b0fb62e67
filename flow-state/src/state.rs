// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use std::fmt::Display;

use channel::MessageKind;

/// Where a flow stands with respect to offload.
///
/// A hard delete is instantaneous and has no state of its own: it lands in
/// [`BypassState::Untracked`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BypassState {
    /// Inspected in software, nothing offloaded.
    #[default]
    Untracked,
    /// ADD sent, no answer yet.
    Pending,
    /// Filtered by the data path; the engine may skip the flow.
    Bypassed,
    /// Marked for removal; counters are kept and a new ADD revives the flow.
    SoftDeleted,
    /// Removed by the offload side; software inspection must resume.
    Evicted,
}

impl BypassState {
    /// The state after `kind`, or `None` if `kind` leaves the state alone.
    #[must_use]
    pub const fn next(self, kind: MessageKind) -> Option<BypassState> {
        use BypassState::{Bypassed, Evicted, Pending, SoftDeleted, Untracked};
        match (kind, self) {
            (MessageKind::Add, Bypassed) => None,
            (MessageKind::Add, _) => Some(Pending),
            (MessageKind::Update, _) => None,
            (MessageKind::SoftDelete, Bypassed | Pending) => Some(SoftDeleted),
            (MessageKind::SoftDelete, _) => None,
            (MessageKind::HardDelete | MessageKind::FlowNotFound, _) => Some(Untracked),
            (MessageKind::ForceEvict | MessageKind::Evict, Pending | Bypassed | SoftDeleted) => {
                Some(Evicted)
            }
            (MessageKind::ForceEvict | MessageKind::Evict, Untracked | Evicted) => None,
        }
    }
}

impl Display for BypassState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BypassState::Untracked => "untracked",
            BypassState::Pending => "pending",
            BypassState::Bypassed => "bypassed",
            BypassState::SoftDeleted => "soft-deleted",
            BypassState::Evicted => "evicted",
        };
        f.write_str(name)
    }
}

/// The effect of one message on one flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Moved { from: BypassState, to: BypassState },
    /// The message was valid but left the state as it was.
    Unchanged(BypassState),
    /// The message travelled in the wrong direction and was not applied.
    Ignored(MessageKind),
}

impl Transition {
    #[must_use]
    pub fn changed(&self) -> bool {
        matches!(self, Transition::Moved { from, to } if from != to)
    }

    /// The state after the message, if it was applied.
    #[must_use]
    pub fn state(&self) -> Option<BypassState> {
        match self {
            Transition::Moved { to, .. } => Some(*to),
            Transition::Unchanged(state) => Some(*state),
            Transition::Ignored(_) => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const STATES: [BypassState; 5] = [
        BypassState::Untracked,
        BypassState::Pending,
        BypassState::Bypassed,
        BypassState::SoftDeleted,
        BypassState::Evicted,
    ];

    fn apply(state: BypassState, kind: MessageKind) -> BypassState {
        state.next(kind).unwrap_or(state)
    }

    #[test]
    fn every_rule_is_idempotent() {
        bolero::check!()
            .with_type::<(u8, u8)>()
            .cloned()
            .for_each(|(state, kind)| {
                let state = STATES[usize::from(state) % STATES.len()];
                let Ok(kind) = MessageKind::try_from(kind % 8) else {
                    return;
                };
                let once = apply(state, kind);
                assert_eq!(apply(once, kind), once, "{kind} from {state}");
            });
    }

    #[test]
    fn hard_delete_always_lands_untracked() {
        for state in STATES {
            assert_eq!(apply(state, MessageKind::HardDelete), BypassState::Untracked);
        }
    }

    #[test]
    fn eviction_of_untracked_or_evicted_is_a_noop() {
        for kind in [MessageKind::ForceEvict, MessageKind::Evict] {
            assert_eq!(BypassState::Untracked.next(kind), None);
            assert_eq!(BypassState::Evicted.next(kind), None);
            assert_eq!(BypassState::SoftDeleted.next(kind), Some(BypassState::Evicted));
        }
    }

    #[test]
    fn add_revives_soft_deleted_but_leaves_bypassed() {
        assert_eq!(
            BypassState::SoftDeleted.next(MessageKind::Add),
            Some(BypassState::Pending)
        );
        assert_eq!(BypassState::Bypassed.next(MessageKind::Add), None);
        assert_eq!(BypassState::Bypassed.next(MessageKind::Update), None);
    }

    #[test]
    fn soft_delete_needs_something_to_delete() {
        assert_eq!(BypassState::Untracked.next(MessageKind::SoftDelete), None);
        assert_eq!(BypassState::Evicted.next(MessageKind::SoftDelete), None);
        assert_eq!(
            BypassState::Pending.next(MessageKind::SoftDelete),
            Some(BypassState::SoftDeleted)
        );
    }
}
