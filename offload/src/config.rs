// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Device configuration, as loaded from YAML.
//!
//! ```yaml
//! interface:
//!   name: eth0
//!   rx-queues: 2
//!   copy-mode: ips
//!   out-iface: eth1
//! requested:
//!   ipv4: match
//!   tcp: match
//!   match-rules: "0,1"
//! supported:
//!   ipv4: match,drop
//!   match-rules: all
//! assistant:
//!   capacity: 4096
//! ```

use std::path::{Path, PathBuf};

use capability::CapabilitySet;
use iface::IfaceParams;
use serde::{Deserialize, Serialize};

use crate::device::DeviceSetup;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid device configuration: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),
}

/// Sizing of the offload side of each queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct AssistantConfig {
    /// Flow rules the data path can hold per queue.
    #[serde(default = "AssistantConfig::default_capacity")]
    pub capacity: usize,
    /// Flows seen but not offloaded that are remembered per queue.
    #[serde(default = "AssistantConfig::default_observed")]
    pub observed: usize,
}

impl AssistantConfig {
    const fn default_capacity() -> usize {
        4096
    }
    const fn default_observed() -> usize {
        16384
    }
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            capacity: Self::default_capacity(),
            observed: Self::default_observed(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct DeviceConfig {
    pub interface: IfaceParams,
    /// What the engine would like offloaded.
    #[serde(default)]
    pub requested: CapabilitySet,
    /// What the data path can do.
    #[serde(default)]
    pub supported: CapabilitySet,
    #[serde(default)]
    pub assistant: AssistantConfig,
}

impl DeviceConfig {
    /// # Errors
    ///
    /// Fails on malformed YAML, unknown keys or invalid capability declarations.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml_ng::from_str(yaml)?)
    }

    /// # Errors
    ///
    /// Fails if the file cannot be read, or as [`DeviceConfig::from_yaml_str`].
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&yaml)
    }

    #[must_use]
    pub fn into_setup(self, available_cores: u16) -> DeviceSetup {
        DeviceSetup {
            params: self.interface,
            requested: self.requested,
            supported: self.supported,
            assistant: self.assistant,
            available_cores,
        }
    }
}
