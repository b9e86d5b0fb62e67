// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Match results travelling from the engine to the offload process.

use bitflags::bitflags;
use capability::MAX_CNT_MATCHED_RULES;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("rule list is full ({max} rules)", max = MAX_CNT_MATCHED_RULES)]
pub struct RuleListFull;

/// Up to [`MAX_CNT_MATCHED_RULES`] rule ids, inline.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RuleList {
    len: u32,
    ids: [u32; MAX_CNT_MATCHED_RULES],
}

impl RuleList {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            len: 0,
            ids: [0; MAX_CNT_MATCHED_RULES],
        }
    }

    /// Append a rule id.
    ///
    /// # Errors
    ///
    /// Returns [`RuleListFull`] when the list already holds
    /// [`MAX_CNT_MATCHED_RULES`] ids.
    pub fn push(&mut self, id: u32) -> Result<(), RuleListFull> {
        let len = self.len();
        if len == MAX_CNT_MATCHED_RULES {
            return Err(RuleListFull);
        }
        self.ids[len] = id;
        #[allow(clippy::cast_possible_truncation)]
        {
            self.len = (len + 1) as u32;
        }
        Ok(())
    }

    /// Number of ids held. A length beyond capacity, which only a corrupted
    /// peer could produce, is clamped.
    #[must_use]
    pub fn len(&self) -> usize {
        (self.len as usize).min(MAX_CNT_MATCHED_RULES)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u32] {
        &self.ids[..self.len()]
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

impl Default for RuleList {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for RuleList {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for RuleList {}

impl std::fmt::Debug for RuleList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.as_slice()).finish()
    }
}

impl TryFrom<&[u32]> for RuleList {
    type Error = RuleListFull;

    fn try_from(ids: &[u32]) -> Result<Self, Self::Error> {
        let mut list = RuleList::new();
        for id in ids {
            list.push(*id)?;
        }
        Ok(list)
    }
}

bitflags! {
    /// What the engine decided about a packet.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EngineMatch: u32 {
        const MATCHED = 1 << 0;
        const ALERT = 1 << 1;
        const DROP = 1 << 2;
    }
}

/// Engine side verdict for a packet, with the rules that matched.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetadataFromEngine {
    matched: EngineMatch,
    pub rules: RuleList,
}

impl MetadataFromEngine {
    #[must_use]
    pub fn new(matched: EngineMatch, rules: RuleList) -> Self {
        Self { matched, rules }
    }

    #[must_use]
    pub fn matched(&self) -> EngineMatch {
        self.matched & EngineMatch::all()
    }
}
