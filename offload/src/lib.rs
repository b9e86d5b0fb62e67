// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Flow bypass runtime.
//!
//! A [`Device`] ties together the negotiated offloads of an interface, its
//! shared configuration and the bypass links of its queues. Engine workers
//! drive flows through a [`BypassWorker`]; the offload process answers
//! through a [`BypassAssistant`] per queue.

#![deny(clippy::all)]

mod assistant;
pub mod config;
mod device;
pub mod diag;
mod fifo;
mod worker;

pub use assistant::{AssistantStats, BACKLOG_STALLS, BypassAssistant, FORCE_EVICTIONS, Verdict};
pub use config::{AssistantConfig, ConfigError, DeviceConfig};
pub use device::{Device, DeviceError, DeviceSetup};
pub use worker::{BACKPRESSURE, Backpressure, BypassError, BypassWorker, EVICTIONS, PollSummary};
