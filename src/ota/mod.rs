// ESP-IDF side of the updater: TLS transport, partitions, timer and restart

pub mod manager;
pub mod timer;
pub mod tls;

use std::time::Duration;

use esp_idf_hal::delay::FreeRtos;
use ota_core::DeviceControl;

pub use manager::EspPartitions;
pub use timer::EspCheckTimer;
pub use tls::EspTlsTransport;

/// Restart via `esp_restart` after a grace period for the log output
#[derive(Debug, Default)]
pub struct EspRestart;

impl DeviceControl for EspRestart {
    fn restart(&mut self, after: Duration) {
        FreeRtos::delay_ms(after.as_millis().min(u128::from(u32::MAX)) as u32);
        unsafe { esp_idf_sys::esp_restart() };
    }
}
