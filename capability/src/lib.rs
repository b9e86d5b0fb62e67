// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Offload capabilities: how they are encoded for exchange between the
//! engine and the data path, and how the two sides agree on a common set.

#![deny(clippy::all)]

pub mod codec;
pub mod negotiate;

pub use codec::{
    CapabilityDecl, CapabilitySet, CapabilityWord, CodecError, Layer, LayerFlags,
    MAX_CNT_MATCHED_RULES, MAX_CNT_OFFLOADS, MatchRules, OffloadIndices, decode, encode,
};
pub use negotiate::{FinalMode, LayerReport, Narrowing, Negotiation, negotiate};
