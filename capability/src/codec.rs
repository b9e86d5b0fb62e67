// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Capability codec.
//!
//! Capabilities travel between processes that do not share an address space,
//! so their wire form is an explicit shift-and-mask layout of a `u64`:
//!
//! ```text
//!  63                               32 31          16 15   12 11    8 7     4 3     0
//! +-----------------------------------+--------------+-------+-------+-------+-------+
//! |          match rules (32)         |   reserved   |  UDP  |  TCP  | IPv6  | IPv4  |
//! +-----------------------------------+--------------+-------+-------+-------+-------+
//! ```
//!
//! The layer order is fixed by [`Layer`] and must never change.

use std::fmt::Display;
use std::ops::{BitAnd, BitOr};
use std::str::FromStr;

use arrayvec::ArrayVec;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Number of offload bits carried for the protocol layers.
pub const MAX_CNT_OFFLOADS: usize = 16;
/// Number of match-rule slots the hardware can be told about.
pub const MAX_CNT_MATCHED_RULES: usize = 32;

const LAYER_WIDTH: u32 = 4;
const LAYER_MASK: u64 = (1 << LAYER_WIDTH) - 1;
const MATCH_RULES_SHIFT: u32 = 32;
const MATCH_RULES_MASK: u64 = u32::MAX as u64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("unknown capability layer id {0}")]
    UnknownLayer(u8),
    #[error("match rule slot {0} out of range (max {max})", max = MAX_CNT_MATCHED_RULES - 1)]
    RuleSlotOutOfRange(u32),
    #[error("unknown offload flag '{0}'")]
    UnknownFlag(String),
    #[error("invalid match rule '{0}'")]
    InvalidRule(String),
    #[error("more than {max} offload indices", max = MAX_CNT_OFFLOADS)]
    TooManyOffloads,
}

/// The layers capabilities are declared for, in wire order.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Layer {
    Ipv4 = 0,
    Ipv6 = 1,
    Tcp = 2,
    Udp = 3,
    MatchRules = 4,
}

impl Layer {
    /// Protocol layers, in wire order.
    pub const PROTOCOLS: [Layer; 4] = [Layer::Ipv4, Layer::Ipv6, Layer::Tcp, Layer::Udp];
    /// All layers, in wire order.
    pub const ALL: [Layer; 5] = [
        Layer::Ipv4,
        Layer::Ipv6,
        Layer::Tcp,
        Layer::Udp,
        Layer::MatchRules,
    ];

    #[must_use]
    pub const fn is_protocol(self) -> bool {
        !matches!(self, Layer::MatchRules)
    }

    const fn shift(self) -> u32 {
        match self {
            Layer::MatchRules => MATCH_RULES_SHIFT,
            l => l as u32 * LAYER_WIDTH,
        }
    }

    const fn mask(self) -> u64 {
        match self {
            Layer::MatchRules => MATCH_RULES_MASK,
            _ => LAYER_MASK,
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

impl TryFrom<u8> for Layer {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Layer::Ipv4),
            1 => Ok(Layer::Ipv6),
            2 => Ok(Layer::Tcp),
            3 => Ok(Layer::Udp),
            4 => Ok(Layer::MatchRules),
            v => Err(CodecError::UnknownLayer(v)),
        }
    }
}

impl Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Layer::Ipv4 => write!(f, "ipv4"),
            Layer::Ipv6 => write!(f, "ipv6"),
            Layer::Tcp => write!(f, "tcp"),
            Layer::Udp => write!(f, "udp"),
            Layer::MatchRules => write!(f, "match-rules"),
        }
    }
}

bitflags! {
    /// What the data path can do for one protocol layer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LayerFlags: u8 {
        /// Filter on the header fields of this layer.
        const MATCH = 1 << 0;
        /// Extract the header fields of this layer into the metadata envelope.
        const METADATA = 1 << 1;
        /// Validate the checksum of this layer.
        const CHECKSUM = 1 << 2;
        /// Drop matching packets in hardware.
        const DROP = 1 << 3;
    }
}

impl FromStr for LayerFlags {
    type Err = CodecError;

    /// Parse a comma separated list (`"match,drop"`), `"all"`, `"none"`, the
    /// empty string, or a raw numeric value.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(raw) = s.parse::<u8>() {
            return Ok(LayerFlags::from_bits_truncate(raw));
        }
        let mut flags = LayerFlags::empty();
        for token in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            flags |= match token.to_ascii_lowercase().as_str() {
                "none" => LayerFlags::empty(),
                "all" => LayerFlags::all(),
                "match" => LayerFlags::MATCH,
                "metadata" => LayerFlags::METADATA,
                "checksum" => LayerFlags::CHECKSUM,
                "drop" => LayerFlags::DROP,
                _ => return Err(CodecError::UnknownFlag(token.to_string())),
            };
        }
        Ok(flags)
    }
}

impl Display for LayerFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "none");
        }
        let names: Vec<String> = self
            .iter_names()
            .map(|(name, _)| name.to_ascii_lowercase())
            .collect();
        write!(f, "{}", names.join(","))
    }
}

/// A set of match-rule slots.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MatchRules(u32);

impl MatchRules {
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn all() -> Self {
        Self(u32::MAX)
    }

    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Add a rule slot.
    ///
    /// # Errors
    ///
    /// Fails if `slot` is not below [`MAX_CNT_MATCHED_RULES`].
    pub fn insert(&mut self, slot: u32) -> Result<(), CodecError> {
        if slot as usize >= MAX_CNT_MATCHED_RULES {
            return Err(CodecError::RuleSlotOutOfRange(slot));
        }
        self.0 |= 1 << slot;
        Ok(())
    }

    #[must_use]
    pub fn contains(self, slot: u32) -> bool {
        (slot as usize) < MAX_CNT_MATCHED_RULES && self.0 & (1 << slot) != 0
    }

    pub fn iter(self) -> impl Iterator<Item = u32> {
        (0..MAX_CNT_MATCHED_RULES as u32).filter(move |slot| self.contains(*slot))
    }
}

impl BitAnd for MatchRules {
    type Output = MatchRules;
    fn bitand(self, rhs: Self) -> Self::Output {
        MatchRules(self.0 & rhs.0)
    }
}

impl FromStr for MatchRules {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.to_ascii_lowercase().as_str() {
            "" | "none" => return Ok(MatchRules::empty()),
            "all" => return Ok(MatchRules::all()),
            _ => {}
        }
        let mut rules = MatchRules::empty();
        for token in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let slot = token
                .parse::<u32>()
                .map_err(|_| CodecError::InvalidRule(token.to_string()))?;
            rules.insert(slot)?;
        }
        Ok(rules)
    }
}

impl Display for MatchRules {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            r if r.is_empty() => write!(f, "none"),
            r if r == MatchRules::all() => write!(f, "all"),
            r => {
                let slots: Vec<String> = r.iter().map(|s| s.to_string()).collect();
                write!(f, "{}", slots.join(","))
            }
        }
    }
}

/// The wire form of a capability declaration.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CapabilityWord(u64);

impl CapabilityWord {
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// The 16 protocol offload bits, as carried by the per-port flag word.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn offload_bits(self) -> u16 {
        self.0 as u16
    }
}

impl BitOr for CapabilityWord {
    type Output = CapabilityWord;
    fn bitor(self, rhs: Self) -> Self::Output {
        CapabilityWord(self.0 | rhs.0)
    }
}

/// Place `flags` in the field of `layer`. Bits that don't fit the field are dropped.
#[must_use]
pub const fn encode(layer: Layer, flags: u32) -> CapabilityWord {
    CapabilityWord((flags as u64 & layer.mask()) << layer.shift())
}

/// Extract the raw field of `layer` from `word`.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn field(word: CapabilityWord, layer: Layer) -> u32 {
    ((word.0 >> layer.shift()) & layer.mask()) as u32
}

/// Split a word into its per-layer flags.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn decode(word: CapabilityWord) -> CapabilitySet {
    let mut set = CapabilitySet::new();
    for layer in Layer::PROTOCOLS {
        set.layers[layer.index()] = LayerFlags::from_bits_truncate(field(word, layer) as u8);
    }
    set.match_rules = MatchRules(field(word, Layer::MatchRules));
    set
}

/// Bit positions of the active protocol offloads of a word, in a fixed-capacity list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OffloadIndices(ArrayVec<u16, MAX_CNT_OFFLOADS>);

impl OffloadIndices {
    #[must_use]
    pub fn new() -> Self {
        Self(ArrayVec::new())
    }

    /// Collect the set bits of the 16 offload bits of `word`.
    #[must_use]
    pub fn of(word: CapabilityWord) -> Self {
        let bits = word.offload_bits();
        Self((0..MAX_CNT_OFFLOADS as u16).filter(|i| bits & (1 << i) != 0).collect())
    }

    /// Append an index.
    ///
    /// # Errors
    ///
    /// Fails once [`MAX_CNT_OFFLOADS`] indices are held.
    pub fn push(&mut self, index: u16) -> Result<(), CodecError> {
        self.0
            .try_push(index)
            .map_err(|_| CodecError::TooManyOffloads)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u16] {
        self.0.as_slice()
    }
}

/// Capabilities for every protocol layer plus the match-rule slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "CapabilityDecl", into = "CapabilityDecl")]
pub struct CapabilitySet {
    layers: [LayerFlags; 4],
    match_rules: MatchRules,
}

impl CapabilitySet {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            layers: [LayerFlags::empty(); 4],
            match_rules: MatchRules::empty(),
        }
    }

    /// Builder style setter for a protocol layer.
    ///
    /// Setting [`Layer::MatchRules`] through here sets the rule slots from the raw flag bits.
    #[must_use]
    pub fn with(mut self, layer: Layer, flags: LayerFlags) -> Self {
        self.set(layer, u32::from(flags.bits()));
        self
    }

    #[must_use]
    pub fn with_match_rules(mut self, rules: MatchRules) -> Self {
        self.match_rules = rules;
        self
    }

    /// Overwrite the raw field of a layer.
    #[allow(clippy::cast_possible_truncation)]
    pub fn set(&mut self, layer: Layer, raw: u32) {
        match layer {
            Layer::MatchRules => self.match_rules = MatchRules(raw),
            l => self.layers[l.index()] = LayerFlags::from_bits_truncate(raw as u8),
        }
    }

    /// The raw field of a layer.
    #[must_use]
    pub fn get(&self, layer: Layer) -> u32 {
        match layer {
            Layer::MatchRules => self.match_rules.bits(),
            l => u32::from(self.layers[l.index()].bits()),
        }
    }

    /// Flags of a protocol layer. [`Layer::MatchRules`] has no flags and yields empty.
    #[must_use]
    pub fn flags(&self, layer: Layer) -> LayerFlags {
        match layer {
            Layer::MatchRules => LayerFlags::empty(),
            l => self.layers[l.index()],
        }
    }

    #[must_use]
    pub fn match_rules(&self) -> MatchRules {
        self.match_rules
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.iter().all(|l| l.is_empty()) && self.match_rules.is_empty()
    }

    #[must_use]
    pub fn intersection(&self, other: &CapabilitySet) -> CapabilitySet {
        let mut out = CapabilitySet::new();
        for layer in Layer::ALL {
            out.set(layer, self.get(layer) & other.get(layer));
        }
        out
    }

    #[must_use]
    pub fn is_subset(&self, other: &CapabilitySet) -> bool {
        Layer::ALL
            .iter()
            .all(|l| self.get(*l) & !other.get(*l) == 0)
    }

    #[must_use]
    pub fn encode(&self) -> CapabilityWord {
        Layer::ALL
            .iter()
            .fold(CapabilityWord::default(), |word, l| {
                word | encode(*l, self.get(*l))
            })
    }
}

impl From<CapabilitySet> for CapabilityWord {
    fn from(set: CapabilitySet) -> Self {
        set.encode()
    }
}

impl From<CapabilityWord> for CapabilitySet {
    fn from(word: CapabilityWord) -> Self {
        decode(word)
    }
}

impl Display for CapabilitySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for layer in Layer::PROTOCOLS {
            write!(f, "{layer}:{} ", self.flags(layer))?;
        }
        write!(f, "match-rules:{}", self.match_rules)
    }
}

/// Human oriented form of a [`CapabilitySet`], one string per layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct CapabilityDecl {
    #[serde(default)]
    pub ipv4: String,
    #[serde(default)]
    pub ipv6: String,
    #[serde(default)]
    pub tcp: String,
    #[serde(default)]
    pub udp: String,
    #[serde(default)]
    pub match_rules: String,
}

impl TryFrom<CapabilityDecl> for CapabilitySet {
    type Error = CodecError;

    fn try_from(decl: CapabilityDecl) -> Result<Self, Self::Error> {
        Ok(CapabilitySet::new()
            .with(Layer::Ipv4, decl.ipv4.parse()?)
            .with(Layer::Ipv6, decl.ipv6.parse()?)
            .with(Layer::Tcp, decl.tcp.parse()?)
            .with(Layer::Udp, decl.udp.parse()?)
            .with_match_rules(decl.match_rules.parse()?))
    }
}

impl From<CapabilitySet> for CapabilityDecl {
    fn from(set: CapabilitySet) -> Self {
        Self {
            ipv4: set.flags(Layer::Ipv4).to_string(),
            ipv6: set.flags(Layer::Ipv6).to_string(),
            tcp: set.flags(Layer::Tcp).to_string(),
            udp: set.flags(Layer::Udp).to_string(),
            match_rules: set.match_rules.to_string(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn layout_is_stable() {
        assert_eq!(encode(Layer::Ipv4, 1).bits(), 0x1);
        assert_eq!(encode(Layer::Ipv6, 1).bits(), 0x10);
        assert_eq!(encode(Layer::Tcp, 0b1001).bits(), 0x900);
        assert_eq!(encode(Layer::Udp, 0xf).bits(), 0xf000);
        assert_eq!(encode(Layer::MatchRules, 0x8000_0001).bits(), 0x8000_0001_0000_0000);
    }

    #[test]
    fn encode_masks_excess_bits() {
        assert_eq!(encode(Layer::Ipv4, 0xff).bits(), 0xf);
        assert_eq!(field(encode(Layer::Tcp, 0x13), Layer::Tcp), 0x3);
    }

    #[test]
    fn decode_splits_layers() {
        let word = encode(Layer::Ipv4, 1) | encode(Layer::Tcp, 9) | encode(Layer::MatchRules, 6);
        let set = decode(word);
        assert_eq!(set.flags(Layer::Ipv4), LayerFlags::MATCH);
        assert_eq!(set.flags(Layer::Ipv6), LayerFlags::empty());
        assert_eq!(set.flags(Layer::Tcp), LayerFlags::MATCH | LayerFlags::DROP);
        assert_eq!(set.match_rules().iter().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(set.encode(), word);
    }

    #[test]
    fn unknown_layer_id_is_rejected() {
        assert_eq!(Layer::try_from(3), Ok(Layer::Udp));
        assert_eq!(Layer::try_from(5), Err(CodecError::UnknownLayer(5)));
    }

    #[test]
    fn decode_then_encode_is_identity_on_defined_bits() {
        bolero::check!()
            .with_type::<u64>()
            .cloned()
            .for_each(|bits| {
                let defined = bits & 0xffff_ffff_0000_ffff;
                let word = CapabilityWord::from_bits(bits);
                assert_eq!(decode(word).encode().bits(), defined);
            });
    }

    #[test]
    fn offload_indices_list_set_bits() {
        let word = encode(Layer::Ipv4, 1) | encode(Layer::Udp, 8);
        let idx = OffloadIndices::of(word);
        assert_eq!(idx.as_slice(), &[0, 15]);

        let mut full = OffloadIndices::of(CapabilityWord::from_bits(0xffff));
        assert_eq!(full.len(), MAX_CNT_OFFLOADS);
        assert_eq!(full.push(0), Err(CodecError::TooManyOffloads));
    }

    #[test]
    fn flags_parse_from_strings() {
        assert_eq!(
            "match, drop".parse::<LayerFlags>().unwrap(),
            LayerFlags::MATCH | LayerFlags::DROP
        );
        assert_eq!("".parse::<LayerFlags>().unwrap(), LayerFlags::empty());
        assert_eq!("1".parse::<LayerFlags>().unwrap(), LayerFlags::MATCH);
        assert_eq!("all".parse::<LayerFlags>().unwrap(), LayerFlags::all());
        assert!(matches!(
            "teleport".parse::<LayerFlags>(),
            Err(CodecError::UnknownFlag(_))
        ));
        assert_eq!((LayerFlags::MATCH | LayerFlags::DROP).to_string(), "match,drop");
    }

    #[test]
    fn match_rules_parse_and_bound() {
        let rules: MatchRules = "0,3,31".parse().unwrap();
        assert_eq!(rules.bits(), 0x8000_0009);
        assert_eq!(rules.to_string(), "0,3,31");
        assert_eq!(
            "32".parse::<MatchRules>(),
            Err(CodecError::RuleSlotOutOfRange(32))
        );
        assert!(matches!(
            "x".parse::<MatchRules>(),
            Err(CodecError::InvalidRule(_))
        ));
        assert!(!rules.contains(40));
    }

    #[test]
    fn capability_set_from_declaration() {
        let decl = CapabilityDecl {
            ipv4: "match".to_string(),
            tcp: "match,drop".to_string(),
            match_rules: "1".to_string(),
            ..Default::default()
        };
        let set = CapabilitySet::try_from(decl.clone()).unwrap();
        assert_eq!(set.flags(Layer::Tcp), LayerFlags::MATCH | LayerFlags::DROP);
        assert_eq!(set.match_rules(), MatchRules::from_bits(2));
        let back = CapabilityDecl::from(set);
        assert_eq!(back.ipv4, "match");
        assert_eq!(back.ipv6, "none");
    }
}
