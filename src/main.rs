use anyhow::Result;
use esp_idf_hal::delay::FreeRtos;
use esp_idf_hal::prelude::*;
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    nvs::EspDefaultNvsPartition,
    timer::EspTaskTimerService,
};
use esp_idf_sys as _; // Binstart
use ota_core::{ConnectivitySignal, OtaConfig, Platform, Triggers, UpdateWorker, UpdaterOptions};

use log::info;

// Generate ESP-IDF app descriptor
// Note: This macro generates warnings about cfg conditions but they're harmless
#[allow(unexpected_cfgs)]
mod app_desc {
    esp_idf_sys::esp_app_desc!();
}

mod config;
mod logging;
mod network;
mod ota;
mod version;

use crate::config::ConfigStore;
use crate::network::{WifiManager, WifiReconnectManager};
use crate::ota::{EspCheckTimer, EspPartitions, EspRestart, EspTlsTransport};

const OTA_TASK_STACK_SIZE: usize = 8192;
const MAIN_LOOP_MS: u32 = 500;

fn main() -> Result<()> {
    // Initialize ESP-IDF
    esp_idf_svc::sys::link_patches();

    // Initialize our logger with colors and timestamps
    logging::init_logger().map_err(|e| anyhow::anyhow!("Failed to initialize logger: {}", e))?;
    if let Some(level) = option_env!("OTA_LOG_LEVEL") {
        if !logging::set_max_level_from_str(level) {
            log::warn!("Unknown log level '{}', keeping debug", level);
        }
    }

    info!("ESP32 HTTPS OTA {}", version::full_version());
    info!("Free heap: {} bytes", unsafe {
        esp_idf_sys::esp_get_free_heap_size()
    });

    let peripherals = Peripherals::take()?;
    let sys_loop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;
    let timer_service = EspTaskTimerService::new()?;

    let mut store = ConfigStore::new(nvs.clone())?;
    let mut config = store.load_or_default()?;
    info!(
        "Update server: {}:{}{} (poll every {} s, auto reboot {})",
        config.ota.server_host,
        config.ota.server_port,
        config.ota.metadata_path,
        config.ota.polling_interval_seconds,
        config.ota.auto_reboot
    );

    // Set up WIFI network connection
    let connectivity = ConnectivitySignal::new();
    let mut wifi = WifiManager::new(
        peripherals.modem,
        sys_loop.clone(),
        nvs,
        config.wifi_ssid.clone(),
        config.wifi_password.clone(),
    )?;
    if let Err(e) = wifi.connect() {
        log::warn!("Initial WiFi connection failed: {:?} (monitor will retry)", e);
    }
    let _wifi_monitor = WifiReconnectManager::new(wifi, connectivity.clone()).start_monitoring()?;

    info!("Initialising OTA firmware updating");
    let triggers = Triggers::new();
    let options = UpdaterOptions::default();
    let platform = Platform {
        transport: EspTlsTransport::new(options.io_timeout.as_millis() as u32),
        partitions: EspPartitions,
        timer: EspCheckTimer::new(&timer_service, triggers.clone())?,
        device: EspRestart,
    };

    let worker = UpdateWorker::new(
        config.ota.clone(),
        options,
        version::SOFTWARE_VERSION,
        platform,
        triggers,
    )?
    .with_config_observer(Box::new(move |ota: &OtaConfig| {
        config.ota = ota.clone();
        if let Err(e) = store.save(&config) {
            log::warn!("Failed to persist updated OTA settings: {:?}", e);
        }
    }));

    let updater = worker.spawn(connectivity, Some(OTA_TASK_STACK_SIZE))?;

    // Immediately check if there's a new firmware image available
    updater.check_now()?;

    let mut was_in_progress = false;
    let mut reported_install = false;
    loop {
        let in_progress = updater.update_in_progress();
        if in_progress != was_in_progress {
            if in_progress {
                info!("Firmware download started");
            } else {
                info!("Firmware download finished");
            }
            was_in_progress = in_progress;
        }

        // Without auto reboot the application decides when to switch over
        if updater.new_firmware_installed() && !reported_install {
            info!("New firmware installed; it becomes active on the next reboot");
            reported_install = true;
        }

        FreeRtos::delay_ms(MAIN_LOOP_MS);
    }
}
