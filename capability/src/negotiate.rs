// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Offload negotiation.
//!
//! The negotiated set is the plain intersection of what the engine requests
//! and what the backend supports. Two final sets derive from it:
//!
//! - detection (IDS): the negotiated set as is.
//! - prevention (IPS): a protocol layer survives only if the backend can also
//!   drop in hardware on that layer. Match rules survive only if at least one
//!   protocol layer does.
//!
//! Narrowing is reported, never fatal: an empty offload set is a valid outcome.

use std::fmt::Display;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::codec::{CapabilitySet, Layer, LayerFlags};
use tracectl::trace_target;
trace_target!("offload-negotiation", LevelFilter::INFO, &["capability"]);

/// Which final set applies to an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinalMode {
    /// Detection only: packets are observed, never dropped by the data path.
    Ids,
    /// Prevention: the data path may drop packets of bypassed flows.
    Ips,
}

/// Why a layer ended up with fewer capabilities than requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Narrowing {
    /// Everything requested was granted.
    None,
    /// Some requested bits are not supported by the backend.
    Unsupported(u32),
    /// The layer is excluded from prevention offload: no hardware drop.
    NoHardwareDrop,
}

/// Negotiation outcome for one layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerReport {
    pub layer: Layer,
    pub requested: u32,
    pub supported: u32,
    pub negotiated: u32,
    pub ips: u32,
}

impl LayerReport {
    /// Did negotiation grant less than requested?
    #[must_use]
    pub fn narrowed(&self) -> bool {
        self.negotiated != self.requested
    }

    /// Bits that were requested but are not supported.
    #[must_use]
    pub fn unsupported(&self) -> u32 {
        self.requested & !self.supported
    }

    /// Narrowing of the detection-mode set.
    #[must_use]
    pub fn ids_narrowing(&self) -> Narrowing {
        match self.unsupported() {
            0 => Narrowing::None,
            bits => Narrowing::Unsupported(bits),
        }
    }

    /// Narrowing of the prevention-mode set.
    #[must_use]
    pub fn ips_narrowing(&self) -> Narrowing {
        if self.negotiated != 0 && self.ips == 0 {
            Narrowing::NoHardwareDrop
        } else {
            self.ids_narrowing()
        }
    }
}

impl Display for LayerReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: requested={:#x} supported={:#x} ids={:#x} ips={:#x}",
            self.layer, self.requested, self.supported, self.negotiated, self.ips
        )
    }
}

/// Result of [`negotiate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Negotiation {
    pub requested: CapabilitySet,
    pub supported: CapabilitySet,
    pub negotiated: CapabilitySet,
    pub final_ids: CapabilitySet,
    pub final_ips: CapabilitySet,
    reports: [LayerReport; 5],
}

impl Negotiation {
    /// The set that applies for the given mode.
    #[must_use]
    pub fn final_set(&self, mode: FinalMode) -> &CapabilitySet {
        match mode {
            FinalMode::Ids => &self.final_ids,
            FinalMode::Ips => &self.final_ips,
        }
    }

    /// Per layer reports, in wire order.
    #[must_use]
    pub fn reports(&self) -> &[LayerReport] {
        &self.reports
    }

    #[must_use]
    pub fn report(&self, layer: Layer) -> &LayerReport {
        &self.reports[layer as usize]
    }

    /// Did any layer get less than requested, in the given mode?
    #[must_use]
    pub fn narrowed(&self, mode: FinalMode) -> bool {
        self.reports.iter().any(|r| match mode {
            FinalMode::Ids => r.ids_narrowing() != Narrowing::None,
            FinalMode::Ips => r.ips_narrowing() != Narrowing::None,
        })
    }
}

/// Negotiate the offloads of one interface.
#[must_use]
#[tracing::instrument(level = "debug", skip_all, fields(requested = %requested, supported = %supported))]
pub fn negotiate(requested: &CapabilitySet, supported: &CapabilitySet) -> Negotiation {
    let negotiated = requested.intersection(supported);

    let mut final_ips = CapabilitySet::new();
    for layer in Layer::PROTOCOLS {
        if supported.flags(layer).contains(LayerFlags::DROP) {
            final_ips.set(layer, negotiated.get(layer));
        }
    }
    if !final_ips.is_empty() {
        final_ips.set(Layer::MatchRules, negotiated.get(Layer::MatchRules));
    }

    let reports = Layer::ALL.map(|layer| LayerReport {
        layer,
        requested: requested.get(layer),
        supported: supported.get(layer),
        negotiated: negotiated.get(layer),
        ips: final_ips.get(layer),
    });

    for report in &reports {
        match report.ids_narrowing() {
            Narrowing::None => debug!("{report}"),
            _ => info!("Offload narrowed: {report}"),
        }
        if report.ips_narrowing() == Narrowing::NoHardwareDrop {
            warn!(
                "No hardware drop for {}: layer excluded from prevention offload",
                report.layer
            );
        }
    }

    Negotiation {
        requested: *requested,
        supported: *supported,
        negotiated,
        final_ids: negotiated,
        final_ips,
        reports,
    }
}
