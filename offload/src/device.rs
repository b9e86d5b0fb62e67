// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use capability::{CapabilitySet, negotiate};
use iface::{
    IfaceConfig, IfaceError, IfaceHandle, IfaceParams, Offloads, QueueId, Released, Teardown,
};
use tracing::{debug, info};

use crate::assistant::BypassAssistant;
use crate::config::AssistantConfig;
use crate::diag::sizing_table;
use crate::worker::BypassWorker;

use tracectl::trace_target;
trace_target!("bypass-device", LevelFilter::INFO, &["bypass"]);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error(transparent)]
    Iface(#[from] IfaceError),
    #[error("device {0} is closed")]
    Closed(String),
    #[error("device {name} has no queue {queue}")]
    UnknownQueue { name: String, queue: QueueId },
}

/// Everything needed to bring up the bypass side of an interface.
#[derive(Debug, Clone)]
pub struct DeviceSetup {
    pub params: IfaceParams,
    pub requested: CapabilitySet,
    pub supported: CapabilitySet,
    pub assistant: AssistantConfig,
    pub available_cores: u16,
}

/// An interface with its offloads negotiated, as held by the setup code.
#[derive(Debug)]
pub struct Device {
    name: String,
    assistant: AssistantConfig,
    iface: Option<IfaceHandle>,
}

impl Device {
    /// Negotiate offloads and build the interface configuration.
    ///
    /// `teardown` runs once the device and every worker are closed.
    ///
    /// # Errors
    ///
    /// Configuration errors. Narrowed offloads are not errors.
    pub fn setup(setup: DeviceSetup, teardown: impl Teardown + 'static) -> Result<Self, DeviceError> {
        let negotiation = negotiate(&setup.requested, &setup.supported);
        let iface = IfaceConfig::create(setup.params, setup.available_cores, teardown)?;
        let offloads = iface.set_offloads(negotiation)?;
        if offloads.active.is_empty() {
            info!("Device {}: nothing to offload", iface.name());
        }
        let params = iface.params();
        let link = params.link;
        let clamp = |n: usize| u32::try_from(n).unwrap_or(u32::MAX);
        let rows = [
            ("threads", u32::from(params.threads)),
            ("rx queues", u32::from(params.rx_queues)),
            ("rx descriptors", u32::from(params.rx_descriptors)),
            ("mempool", params.mempool.size),
            ("mempool cache", params.mempool.cache_size),
            ("bypass ring", clamp(link.ring_size)),
            ("bypass pool", clamp(link.pool_size)),
            ("bypass cache", clamp(link.cache_size)),
        ];
        debug!("Device {} sizing:\n{}", iface.name(), sizing_table(&rows));
        Ok(Self {
            name: iface.name().to_string(),
            assistant: setup.assistant,
            iface: Some(iface),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn iface(&self) -> Result<&IfaceHandle, DeviceError> {
        self.iface
            .as_ref()
            .ok_or_else(|| DeviceError::Closed(self.name.clone()))
    }

    /// The interface configuration, until the device is closed.
    #[must_use]
    pub fn config(&self) -> Option<&IfaceConfig> {
        self.iface.as_deref()
    }

    #[must_use]
    pub fn offloads(&self) -> Option<&Offloads> {
        self.config().and_then(IfaceConfig::offloads)
    }

    /// Bind an engine worker to the next free queue.
    ///
    /// # Errors
    ///
    /// [`DeviceError::Closed`] after [`Device::close`], and
    /// [`IfaceError::QueuesExhausted`] when every queue has a worker.
    pub fn attach_worker(&self) -> Result<BypassWorker, DeviceError> {
        let iface = self.iface()?.acquire();
        let queue = iface.claim_queue()?;
        let endpoint = iface
            .link(queue)
            .ok_or_else(|| DeviceError::UnknownQueue {
                name: self.name.clone(),
                queue,
            })?
            .worker_endpoint();
        Ok(BypassWorker::new(queue, endpoint, iface))
    }

    /// The offload side of `queue`.
    ///
    /// # Errors
    ///
    /// [`DeviceError::Closed`] after [`Device::close`], and
    /// [`DeviceError::UnknownQueue`] for a queue the interface does not have.
    pub fn assistant(&self, queue: QueueId) -> Result<BypassAssistant, DeviceError> {
        let endpoint = self
            .iface()?
            .link(queue)
            .ok_or_else(|| DeviceError::UnknownQueue {
                name: self.name.clone(),
                queue,
            })?
            .offload_endpoint();
        Ok(BypassAssistant::new(queue, endpoint, self.assistant))
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.iface.is_none()
    }

    /// Release the device's reference to the interface.
    ///
    /// Workers still attached keep the interface and their queues working;
    /// in-flight messages are drained at teardown. Closing a closed device
    /// does nothing and returns `None`.
    pub fn close(&mut self) -> Option<Released> {
        let Some(iface) = self.iface.take() else {
            debug!("Device {} already closed", self.name);
            return None;
        };
        let released = iface.release();
        info!("Closed device {} ({released:?})", self.name);
        Some(released)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.close();
    }
}
