// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Bypass lifecycle of flows, as the engine sees it.
//!
//! ```text
//!              ADD                 (silence)
//! Untracked ---------> Pending ---------------> Bypassed
//!     ^                 |  ^                     |   |
//!     |   FLOW_NOT_FOUND|  | ADD      SOFT_DELETE|   | EVICT / FORCE_EVICT
//!     |                 v  |                     v   v
//!     +------------- SoftDeleted / Evicted <-----+---+
//!       HARD_DELETE (from anywhere), take_evicted()
//! ```
//!
//! Every rule is idempotent: applying a message twice gives the state of
//! applying it once. Messages that make no sense for the current state are
//! absorbed, never reported as errors.

#![deny(clippy::all, clippy::pedantic)]

mod state;
mod table;

pub use state::{BypassState, Transition};
pub use table::{FlowStates, StateCounts};
