// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Bypass message channel.
//!
//! Every rx queue of an interface has a [`BypassLink`]: a tasks ring carrying
//! messages from the engine worker to the offload process, a results ring for
//! the way back, and a fixed pool of [`BypassMessage`] slots. Rings carry
//! slot indices, never messages, so nothing is copied or allocated once the
//! link is built. Each side talks through its own endpoint, which keeps a
//! small private cache of free slots in front of the shared pool.
//!
//! Nothing here blocks or drops: a full ring gives the message back, an empty
//! ring says so, an exhausted pool says so. What to do next is up to the caller.
//!
//! [`shm`] carries plain-data records across processes over a file mapping.

#![deny(clippy::all)]

mod endpoint;
mod link;
mod message;
mod pool;
mod ring;
pub mod shm;

pub use endpoint::{
    AllocError, ChannelEndpoint, Direction, Endpoint, Offload, OffloadEndpoint, SendError,
    TryReceive, Worker,
};
pub use link::{BypassLink, ChannelError, LinkConfig};
pub use message::{BypassMessage, MessageError, MessageKind};
pub use pool::{MessagePool, PoolCache, PooledMessage};
pub use ring::Ring;
