// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use std::fmt::Display;

use pkt_meta::{FlowKey, RuleList};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MessageError {
    #[error("unknown bypass message kind {0}")]
    UnknownKind(u8),
}

/// What a [`BypassMessage`] asks for or reports.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Install a filter rule for the flow.
    Add = 1,
    /// Mark the rule for removal, keeping its counters.
    SoftDelete = 2,
    /// Remove the rule now.
    HardDelete = 3,
    /// Refresh the parameters of an installed rule.
    Update = 4,
    /// The offload side evicted the flow under resource pressure.
    ForceEvict = 5,
    /// The flow expired on the offload side.
    Evict = 6,
    /// The offload side has no rule for the referenced flow.
    FlowNotFound = 7,
}

impl MessageKind {
    /// Messages the engine sends to the offload process.
    #[must_use]
    pub const fn is_engine_to_offload(self) -> bool {
        matches!(
            self,
            MessageKind::Add | MessageKind::SoftDelete | MessageKind::HardDelete | MessageKind::Update
        )
    }

    /// Messages the offload process sends to the engine.
    #[must_use]
    pub const fn is_offload_to_engine(self) -> bool {
        !self.is_engine_to_offload()
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = MessageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => MessageKind::Add,
            2 => MessageKind::SoftDelete,
            3 => MessageKind::HardDelete,
            4 => MessageKind::Update,
            5 => MessageKind::ForceEvict,
            6 => MessageKind::Evict,
            7 => MessageKind::FlowNotFound,
            v => return Err(MessageError::UnknownKind(v)),
        })
    }
}

impl Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MessageKind::Add => "ADD",
            MessageKind::SoftDelete => "SOFT_DELETE",
            MessageKind::HardDelete => "HARD_DELETE",
            MessageKind::Update => "UPDATE",
            MessageKind::ForceEvict => "FORCE_EVICT",
            MessageKind::Evict => "EVICT",
            MessageKind::FlowNotFound => "FLOW_NOT_FOUND",
        };
        f.write_str(name)
    }
}

/// A bypass control message.
///
/// Plain data with a fixed layout. The kind is kept raw so that any bytes
/// received from a peer form a valid value; [`BypassMessage::kind`] checks it.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct BypassMessage {
    kind: u8,
    pad: [u8; 3],
    key: FlowKey,
    rules: RuleList,
}

static_assertions::assert_impl_all!(BypassMessage: Copy, Send, Sync);

impl BypassMessage {
    #[must_use]
    pub fn new(kind: MessageKind, key: FlowKey) -> Self {
        Self {
            kind: kind as u8,
            key,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_rules(mut self, rules: RuleList) -> Self {
        self.rules = rules;
        self
    }

    /// Overwrite the whole message, clearing the rule list.
    pub fn set(&mut self, kind: MessageKind, key: FlowKey) {
        *self = Self::new(kind, key);
    }

    /// # Errors
    ///
    /// Fails if the raw kind is not a known [`MessageKind`].
    pub fn kind(&self) -> Result<MessageKind, MessageError> {
        MessageKind::try_from(self.kind)
    }

    #[must_use]
    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    #[must_use]
    pub fn rules(&self) -> &RuleList {
        &self.rules
    }

    pub fn rules_mut(&mut self) -> &mut RuleList {
        &mut self.rules
    }
}

impl std::fmt::Debug for BypassMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind() {
            Ok(kind) => write!(f, "{kind}({}) rules={:?}", self.key, self.rules),
            Err(_) => write!(f, "<kind {}>({})", self.kind, self.key),
        }
    }
}
