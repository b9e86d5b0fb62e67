// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Static registration of tracing targets.
//!
//! Each module that logs declares itself with [`trace_target!`]. Declarations
//! are collected at link time, so [`crate::TracingControl`] knows every target
//! (and the module paths behind it) without any runtime registration call.

use linkme::distributed_slice;
use tracing_subscriber::filter::LevelFilter;

/// A named tracing target bound to the module that declared it.
#[derive(Debug)]
pub struct TraceTarget {
    /// User-facing name, as used in `name=level` directives.
    pub name: &'static str,
    /// Rust module path the events originate from.
    pub module: &'static str,
    /// Level the target starts with.
    pub level: LevelFilter,
    /// Tags to control several targets at once.
    pub tags: &'static [&'static str],
}

#[distributed_slice]
pub static TRACE_TARGETS: [TraceTarget];

/// Declare the current module as a tracing target.
///
/// ```ignore
/// use tracectl::trace_target;
/// trace_target!("bypass-channel", LevelFilter::INFO, &["bypass"]);
/// ```
#[macro_export]
macro_rules! trace_target {
    ($name:expr, LevelFilter::$level:ident, $tags:expr) => {
        const _: () = {
            #[$crate::linkme::distributed_slice($crate::targets::TRACE_TARGETS)]
            #[linkme(crate = $crate::linkme)]
            static TRACE_TARGET: $crate::targets::TraceTarget = $crate::targets::TraceTarget {
                name: $name,
                module: ::core::module_path!(),
                level: $crate::LevelFilter::$level,
                tags: $tags,
            };
        };
    };
}

pub(crate) fn registered() -> impl Iterator<Item = &'static TraceTarget> {
    TRACE_TARGETS.iter()
}
