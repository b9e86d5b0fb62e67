// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Synchronization facade.
//!
//! Every counter that is shared between worker threads (reference counts,
//! queue claim cursors) goes through this crate so that the same code can be
//! model checked with [loom] by building with `--features loom`.
//!
//! [loom]: https://docs.rs/loom

#![deny(clippy::all, clippy::pedantic)]

pub mod sync {
    #[cfg(not(feature = "loom"))]
    pub use std::sync::Arc;

    #[cfg(feature = "loom")]
    pub use loom::sync::Arc;

    pub mod atomic {
        #[cfg(not(feature = "loom"))]
        pub use std::sync::atomic::{
            AtomicBool, AtomicU16, AtomicU32, AtomicU64, AtomicUsize, Ordering, fence,
        };

        #[cfg(feature = "loom")]
        pub use loom::sync::atomic::{
            AtomicBool, AtomicU16, AtomicU32, AtomicU64, AtomicUsize, Ordering, fence,
        };
    }
}

pub mod thread {
    #[cfg(not(feature = "loom"))]
    pub use std::thread::{JoinHandle, spawn, yield_now};

    #[cfg(feature = "loom")]
    pub use loom::thread::{JoinHandle, spawn, yield_now};
}

/// Run `f` under the loom model checker when the `loom` feature is on, or
/// exactly once otherwise.
///
/// Tests written against this function exercise every interleaving loom can
/// find under `--features loom` and still run as plain tests without it.
pub fn model<F>(f: F)
where
    F: Fn() + Sync + Send + 'static,
{
    #[cfg(feature = "loom")]
    loom::model(f);

    #[cfg(not(feature = "loom"))]
    f();
}

static_assertions::assert_impl_all!(sync::Arc<sync::atomic::AtomicU32>: Send, Sync);

#[cfg(test)]
mod test {
    use crate::sync::Arc;
    use crate::sync::atomic::{AtomicU32, Ordering};
    use crate::thread;

    #[test]
    fn model_runs_closure() {
        crate::model(|| {
            let counter = Arc::new(AtomicU32::new(0));
            let other = Arc::clone(&counter);
            let handle = thread::spawn(move || {
                other.fetch_add(1, Ordering::AcqRel);
            });
            counter.fetch_add(1, Ordering::AcqRel);
            handle.join().unwrap();
            assert_eq!(counter.load(Ordering::Acquire), 2);
        });
    }
}
