use anyhow::Result;
use esp_idf_hal::delay::FreeRtos;
use ota_core::ConnectivitySignal;
use std::thread::{self, JoinHandle};

use super::wifi::WifiManager;

const POLL_MS: u32 = 10_000;

/// Keeps the station connected and mirrors the link state into the
/// updater's connectivity signal
pub struct WifiReconnectManager {
    wifi: WifiManager,
    connectivity: ConnectivitySignal,
    reconnect_attempts: u32,
}

impl WifiReconnectManager {
    pub fn new(wifi: WifiManager, connectivity: ConnectivitySignal) -> Self {
        Self { wifi, connectivity, reconnect_attempts: 0 }
    }

    /// Move the manager onto its own monitoring thread
    pub fn start_monitoring(mut self) -> Result<JoinHandle<()>> {
        self.connectivity.set(self.wifi.is_up());

        let handle = thread::Builder::new()
            .name("wifi_monitor".into())
            .stack_size(4096)
            .spawn(move || {
                log::info!("WiFi monitoring task started");
                loop {
                    self.poll();
                    FreeRtos::delay_ms(POLL_MS);
                }
            })?;

        log::info!("WiFi auto-reconnection monitoring started");
        Ok(handle)
    }

    fn poll(&mut self) {
        let connected = self.wifi.is_up();
        let was_connected = self.connectivity.is_connected();
        self.connectivity.set(connected);

        if connected {
            if self.reconnect_attempts > 0 {
                log::warn!("WiFi reconnected after {} attempts", self.reconnect_attempts);
                self.reconnect_attempts = 0;
            }
            return;
        }

        if was_connected {
            log::warn!("WiFi disconnected! Starting reconnection process...");
            self.reconnect_attempts = 0;
        }
        self.reconnect_attempts += 1;
        let attempts = self.reconnect_attempts;

        // Exponential, max 60 seconds
        let delay = std::cmp::min(60, 5 * (1 << std::cmp::min(attempts - 1, 4)));
        log::info!("Backoff {}s before reconnection attempt #{}", delay, attempts);
        FreeRtos::delay_ms(delay * 1000);

        // After 3 failed attempts, perform stop/start cycle
        if attempts % 3 == 0 {
            if let Err(e) = self.wifi.restart() {
                log::error!("WiFi restart failed: {:?}", e);
            }
        }

        match self.wifi.connect() {
            Ok(()) => self.connectivity.set(true),
            Err(e) => log::error!("WiFi reconnection failed: {:?}", e),
        }
    }
}
