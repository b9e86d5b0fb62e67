// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Fixed layout records exchanged between the offload process and the engine.
//!
//! The offload side parses a frame once into a [`MetadataEnvelope`]; the engine
//! reads it without parsing the frame again. Every type in here is plain old
//! data: `#[repr(C)]`, `Copy`, no pointers, and every bit pattern of every
//! field is a valid value, so records can be copied through shared memory.

#![deny(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod envelope;
mod flow_key;
mod parse;
mod rules;

pub use envelope::{
    Ipv4Meta, Ipv6Meta, MetadataEnvelope, MetadataSet, PacketEvents, TcpFlags, TcpMeta, UdpMeta,
};
pub use flow_key::{FlowKey, IpProto};
pub use parse::ParseError;
pub use rules::{EngineMatch, MetadataFromEngine, RuleList, RuleListFull};
