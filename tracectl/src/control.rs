// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Runtime control of tracing levels per target and per tag.

use std::fmt::Write;
use std::str::FromStr;
use std::sync::OnceLock;

use ordermap::OrderMap;
use parking_lot::Mutex;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{Registry, fmt, reload};

use crate::targets::registered;

/// The level used for modules that did not declare a target.
pub const DEFAULT_DEFAULT_LOGLEVEL: LevelFilter = LevelFilter::INFO;

#[derive(Debug, thiserror::Error)]
pub enum TraceCtlError {
    #[error("invalid tracing directive '{0}': expected <target|tag:name|default>=<level>")]
    InvalidSyntax(String),
    #[error("invalid level '{0}'")]
    InvalidLevel(String),
    #[error("unknown tracing target '{0}'")]
    UnknownTarget(String),
    #[error("unknown tracing tag '{0}'")]
    UnknownTag(String),
    #[error("failed to reload tracing filter: {0}")]
    ReloadFailed(String),
}

#[derive(Debug)]
struct TargetState {
    modules: Vec<&'static str>,
    level: LevelFilter,
    tags: Vec<&'static str>,
}

#[derive(Debug)]
struct ControlState {
    default: LevelFilter,
    targets: OrderMap<&'static str, TargetState>,
}

impl ControlState {
    fn from_registrations() -> Self {
        let mut targets: OrderMap<&'static str, TargetState> = OrderMap::new();
        for t in registered() {
            let entry = targets.entry(t.name).or_insert_with(|| TargetState {
                modules: Vec::new(),
                level: t.level,
                tags: Vec::new(),
            });
            entry.modules.push(t.module);
            for tag in t.tags {
                if !entry.tags.contains(tag) {
                    entry.tags.push(*tag);
                }
            }
        }
        Self {
            default: DEFAULT_DEFAULT_LOGLEVEL,
            targets,
        }
    }

    fn directives(&self) -> String {
        let mut out = String::new();
        for target in self.targets.values() {
            for module in &target.modules {
                if !out.is_empty() {
                    out.push(',');
                }
                let _ = write!(out, "{module}={}", level_str(target.level));
            }
        }
        out
    }

    fn filter(&self) -> EnvFilter {
        EnvFilter::builder()
            .with_default_directive(self.default.into())
            .parse_lossy(self.directives())
    }
}

fn level_str(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::OFF => "off",
        LevelFilter::ERROR => "error",
        LevelFilter::WARN => "warn",
        LevelFilter::INFO => "info",
        LevelFilter::DEBUG => "debug",
        _ => "trace",
    }
}

fn parse_level(level: &str) -> Result<LevelFilter, TraceCtlError> {
    LevelFilter::from_str(level.trim()).map_err(|_| TraceCtlError::InvalidLevel(level.to_string()))
}

/// Process-wide tracing control. Obtain it with [`get_trace_ctl`].
pub struct TracingControl {
    state: Mutex<ControlState>,
    reload: reload::Handle<EnvFilter, Registry>,
}

impl TracingControl {
    fn init() -> Self {
        let state = ControlState::from_registrations();
        let (filter, reload) = reload::Layer::new(state.filter());
        let subscriber = Registry::default().with(filter).with(fmt::layer());
        // Tests may have installed their own subscriber already; the filter
        // state is still tracked so that queries keep working.
        let _ = tracing::subscriber::set_global_default(subscriber);
        Self {
            state: Mutex::new(state),
            reload,
        }
    }

    fn apply(&self, state: &ControlState) -> Result<(), TraceCtlError> {
        self.reload
            .reload(state.filter())
            .map_err(|e| TraceCtlError::ReloadFailed(e.to_string()))
    }

    /// Set the level of every module that has no target of its own.
    pub fn set_default_level(&self, level: LevelFilter) -> Result<(), TraceCtlError> {
        let mut state = self.state.lock();
        state.default = level;
        self.apply(&state)
    }

    /// Set the level of the target called `name`.
    pub fn set_level(&self, name: &str, level: LevelFilter) -> Result<(), TraceCtlError> {
        let mut state = self.state.lock();
        let target = state
            .targets
            .get_mut(name)
            .ok_or_else(|| TraceCtlError::UnknownTarget(name.to_string()))?;
        target.level = level;
        self.apply(&state)
    }

    /// Set the level of all the targets carrying `tag`.
    pub fn set_tag_level(&self, tag: &str, level: LevelFilter) -> Result<(), TraceCtlError> {
        let mut state = self.state.lock();
        let mut found = false;
        for target in state.targets.values_mut() {
            if target.tags.iter().any(|t| *t == tag) {
                target.level = level;
                found = true;
            }
        }
        if !found {
            return Err(TraceCtlError::UnknownTag(tag.to_string()));
        }
        self.apply(&state)
    }

    /// Get the current level of a target.
    #[must_use]
    pub fn get_level(&self, name: &str) -> Option<LevelFilter> {
        self.state.lock().targets.get(name).map(|t| t.level)
    }

    /// Configure from a comma separated list of `name=level`, `tag:name=level`
    /// and `default=level` directives. Directives are applied in order.
    pub fn setup_from_string(&self, input: &str) -> Result<(), TraceCtlError> {
        for directive in input.split(',').map(str::trim).filter(|d| !d.is_empty()) {
            let (key, level) = directive
                .split_once('=')
                .ok_or_else(|| TraceCtlError::InvalidSyntax(directive.to_string()))?;
            let level = parse_level(level)?;
            let key = key.trim();
            if key == "default" {
                self.set_default_level(level)?;
            } else if let Some(tag) = key.strip_prefix("tag:") {
                self.set_tag_level(tag, level)?;
            } else {
                self.set_level(key, level)?;
            }
        }
        Ok(())
    }

    /// Human readable list of targets and their levels.
    #[must_use]
    pub fn as_string(&self) -> String {
        let state = self.state.lock();
        let mut out = format!("default: {}\n", level_str(state.default));
        for (name, target) in &state.targets {
            let _ = writeln!(
                out,
                "{name:<24} {:<6} tags=[{}]",
                level_str(target.level),
                target.tags.join(",")
            );
        }
        out
    }
}

static TRACE_CTL: OnceLock<TracingControl> = OnceLock::new();

/// Get the process-wide [`TracingControl`], installing the subscriber on first use.
pub fn get_trace_ctl() -> &'static TracingControl {
    TRACE_CTL.get_or_init(TracingControl::init)
}
