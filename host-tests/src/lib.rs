//! Host-based tests for the update engine
//! These tests run on the development machine, not on the ESP32

use std::time::Duration;

use ota_core::testing::{
    ok_config, FakeTransport, ManualTimer, MemoryPartitions, RecordingDevice, ScriptedServer,
};
use ota_core::{OtaConfig, Platform, Result, Triggers, UpdateWorker, UpdaterOptions};

pub type FakeWorker = UpdateWorker<FakeTransport, MemoryPartitions, ManualTimer, RecordingDevice>;

/// A scripted server, in-memory flash and recording timer/device, with the
/// handles tests keep after the worker takes ownership of the fakes
pub struct Rig {
    pub server: ScriptedServer,
    pub partitions: MemoryPartitions,
    pub timer: ManualTimer,
    pub device: RecordingDevice,
    pub triggers: Triggers,
}

impl Rig {
    pub fn new(boot: &str) -> Self {
        Self::with_server(ScriptedServer::new(), boot)
    }

    pub fn with_server(server: ScriptedServer, boot: &str) -> Self {
        Self {
            server,
            partitions: MemoryPartitions::new(boot),
            timer: ManualTimer::default(),
            device: RecordingDevice::default(),
            triggers: Triggers::new(),
        }
    }

    /// Options with the startup settle delay shortened for threaded tests
    pub fn fast_options() -> UpdaterOptions {
        UpdaterOptions {
            startup_delay: Duration::from_millis(10),
            reboot_delay: Duration::from_millis(1),
            io_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    pub fn worker(&self, running_version: u32) -> Result<FakeWorker> {
        self.worker_with(ok_config(), UpdaterOptions::default(), running_version)
    }

    pub fn worker_with(
        &self,
        config: OtaConfig,
        options: UpdaterOptions,
        running_version: u32,
    ) -> Result<FakeWorker> {
        let platform = Platform {
            transport: self.server.transport(),
            partitions: self.partitions.clone(),
            timer: self.timer.clone(),
            device: self.device.clone(),
        };
        UpdateWorker::new(config, options, running_version, platform, self.triggers.clone())
    }
}

#[cfg(test)]
mod pinning;
#[cfg(test)]
mod scenarios;
#[cfg(test)]
mod threaded;
