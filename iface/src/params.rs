// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Interface parameters, as configured.

use bitflags::bitflags;
use capability::FinalMode;
use channel::LinkConfig;
use serde::{Deserialize, Serialize};

const MIN_MTU: u16 = 68;
const MAX_MTU: u16 = 9216;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParamsError {
    #[error("interface {0}: no rx queue configured")]
    ZeroQueues(String),
    #[error("interface {name}: {threads} threads for {queues} rx queues")]
    ThreadsExceedQueues {
        name: String,
        threads: u16,
        queues: u16,
    },
    #[error("interface {name}: invalid mtu {mtu} (must be {MIN_MTU}..={MAX_MTU})")]
    InvalidMtu { name: String, mtu: u16 },
    #[error("interface {name}: mempool cache {cache} larger than mempool {size}")]
    MempoolCacheTooLarge { name: String, cache: u32, size: u32 },
    #[error("interface {name}: copy mode {mode:?} needs an output interface")]
    MissingOutIface { name: String, mode: CopyMode },
    #[error("interface {0}: no cores available")]
    NoCores(String),
    #[error("interface {name}: bypass link: {source}")]
    Link {
        name: String,
        source: channel::ChannelError,
    },
}

/// Who owns the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationMode {
    /// This process initializes the device and creates its rings and pools.
    #[default]
    Primary,
    /// This process attaches to queues and rings created by a primary process.
    Secondary,
}

/// What happens to packets after inspection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CopyMode {
    #[default]
    None,
    /// Copy packets to an output interface.
    Tap,
    /// Forward packets inline; the engine may drop them.
    Ips,
}

impl CopyMode {
    /// The final offload set that applies in this mode.
    #[must_use]
    pub fn final_mode(self) -> FinalMode {
        match self {
            CopyMode::None | CopyMode::Tap => FinalMode::Ids,
            CopyMode::Ips => FinalMode::Ips,
        }
    }
}

/// Checksum validation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChecksumMode {
    #[default]
    Auto,
    Enable,
    Disable,
    /// Validate in hardware.
    Offload,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DeviceFlags: u32 {
        const PROMISC = 1 << 0;
        const MULTICAST = 1 << 1;
        const RX_CHECKSUM_OFFLOAD = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct MempoolSizing {
    pub size: u32,
    pub cache_size: u32,
}

impl Default for MempoolSizing {
    fn default() -> Self {
        Self {
            size: 65535,
            cache_size: 256,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_mtu() -> u16 {
    1500
}

fn default_queues() -> u16 {
    1
}

fn default_descriptors() -> u16 {
    1024
}

/// Everything configured for one interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct IfaceParams {
    pub name: String,
    #[serde(default)]
    pub port_id: u16,
    /// NUMA socket hint; negative means any.
    #[serde(default = "IfaceParams::any_socket")]
    pub socket_id: i32,
    #[serde(default)]
    pub mode: OperationMode,
    /// Worker threads; 0 means one per available core, up to one per queue.
    #[serde(default)]
    pub threads: u16,
    #[serde(default)]
    pub copy_mode: CopyMode,
    #[serde(default)]
    pub out_iface: Option<String>,
    #[serde(default = "default_true")]
    pub promisc: bool,
    #[serde(default)]
    pub multicast: bool,
    #[serde(default)]
    pub checksum: ChecksumMode,
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    #[serde(default = "default_queues")]
    pub rx_queues: u16,
    #[serde(default = "default_queues")]
    pub tx_queues: u16,
    #[serde(default = "default_descriptors")]
    pub rx_descriptors: u16,
    #[serde(default = "default_descriptors")]
    pub tx_descriptors: u16,
    #[serde(default)]
    pub mempool: MempoolSizing,
    #[serde(default)]
    pub link: LinkConfig,
}

impl IfaceParams {
    fn any_socket() -> i32 {
        -1
    }

    /// Parameters with defaults for everything but the name.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            port_id: 0,
            socket_id: Self::any_socket(),
            mode: OperationMode::default(),
            threads: 0,
            copy_mode: CopyMode::default(),
            out_iface: None,
            promisc: true,
            multicast: false,
            checksum: ChecksumMode::default(),
            mtu: default_mtu(),
            rx_queues: default_queues(),
            tx_queues: default_queues(),
            rx_descriptors: default_descriptors(),
            tx_descriptors: default_descriptors(),
            mempool: MempoolSizing::default(),
            link: LinkConfig::default(),
        }
    }

    #[must_use]
    pub fn flags(&self) -> DeviceFlags {
        let mut flags = DeviceFlags::empty();
        flags.set(DeviceFlags::PROMISC, self.promisc);
        flags.set(DeviceFlags::MULTICAST, self.multicast);
        flags.set(
            DeviceFlags::RX_CHECKSUM_OFFLOAD,
            self.checksum == ChecksumMode::Offload,
        );
        flags
    }

    /// Check the parameters and resolve the thread count.
    ///
    /// # Errors
    ///
    /// Any configuration error; none of them is recoverable.
    pub fn resolve(mut self, available_cores: u16) -> Result<Self, ParamsError> {
        if self.rx_queues == 0 {
            return Err(ParamsError::ZeroQueues(self.name));
        }
        if self.threads == 0 {
            if available_cores == 0 {
                return Err(ParamsError::NoCores(self.name));
            }
            self.threads = available_cores.min(self.rx_queues);
        }
        if self.threads > self.rx_queues {
            return Err(ParamsError::ThreadsExceedQueues {
                name: self.name,
                threads: self.threads,
                queues: self.rx_queues,
            });
        }
        if !(MIN_MTU..=MAX_MTU).contains(&self.mtu) {
            return Err(ParamsError::InvalidMtu {
                name: self.name,
                mtu: self.mtu,
            });
        }
        if self.mempool.cache_size > self.mempool.size {
            return Err(ParamsError::MempoolCacheTooLarge {
                name: self.name,
                cache: self.mempool.cache_size,
                size: self.mempool.size,
            });
        }
        if self.copy_mode != CopyMode::None && self.out_iface.is_none() {
            return Err(ParamsError::MissingOutIface {
                name: self.name,
                mode: self.copy_mode,
            });
        }
        if let Err(source) = self.link.validate() {
            return Err(ParamsError::Link {
                name: self.name,
                source,
            });
        }
        Ok(self)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn zero_threads_means_all_cores_up_to_queues() {
        let mut params = IfaceParams::new("eth0");
        params.rx_queues = 4;
        assert_eq!(params.clone().resolve(2).unwrap().threads, 2);
        assert_eq!(params.clone().resolve(16).unwrap().threads, 4);
        assert_eq!(params.resolve(0), Err(ParamsError::NoCores("eth0".into())));
    }

    #[test]
    fn configuration_errors() {
        let mut params = IfaceParams::new("eth0");
        params.rx_queues = 0;
        assert!(matches!(params.resolve(4), Err(ParamsError::ZeroQueues(_))));

        let mut params = IfaceParams::new("eth0");
        params.rx_queues = 2;
        params.threads = 3;
        assert!(matches!(
            params.resolve(4),
            Err(ParamsError::ThreadsExceedQueues {
                threads: 3,
                queues: 2,
                ..
            })
        ));

        let mut params = IfaceParams::new("eth0");
        params.mtu = 20;
        assert!(matches!(params.resolve(4), Err(ParamsError::InvalidMtu { mtu: 20, .. })));

        let mut params = IfaceParams::new("eth0");
        params.mempool = MempoolSizing {
            size: 16,
            cache_size: 32,
        };
        assert!(matches!(
            params.resolve(4),
            Err(ParamsError::MempoolCacheTooLarge { .. })
        ));

        let mut params = IfaceParams::new("eth0");
        params.copy_mode = CopyMode::Ips;
        assert!(matches!(
            params.resolve(4),
            Err(ParamsError::MissingOutIface { .. })
        ));

        let mut params = IfaceParams::new("eth0");
        params.link.ring_size = 0;
        assert!(matches!(params.resolve(4), Err(ParamsError::Link { .. })));
    }

    #[test]
    fn flags_and_final_mode() {
        let mut params = IfaceParams::new("eth0");
        params.checksum = ChecksumMode::Offload;
        assert_eq!(
            params.flags(),
            DeviceFlags::PROMISC | DeviceFlags::RX_CHECKSUM_OFFLOAD
        );
        assert_eq!(CopyMode::Tap.final_mode(), FinalMode::Ids);
        assert_eq!(CopyMode::Ips.final_mode(), FinalMode::Ips);
    }
}
