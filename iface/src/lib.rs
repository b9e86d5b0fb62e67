// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Interface configuration registry.
//!
//! One [`IfaceConfig`] exists per interface. It is shared by every worker
//! bound to the interface through reference-counted [`IfaceHandle`]s, hands
//! out rx queues to workers, and owns the bypass links of those queues.
//! Whoever drops the last reference runs the interface [`Teardown`].

#![deny(clippy::all)]

mod config;
mod params;

pub use config::{IfaceConfig, IfaceError, IfaceHandle, Offloads, QueueId, Released, Teardown};
pub use params::{
    ChecksumMode, CopyMode, DeviceFlags, IfaceParams, MempoolSizing, OperationMode, ParamsError,
};
