use anyhow::Result;
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault};
use ota_core::OtaConfig;
use serde::{Deserialize, Serialize};

const CONFIG_NAMESPACE: &str = "ota";
const CONFIG_KEY: &str = "config";

// Two PEM certificates plus the small fields
const MAX_CONFIG_SIZE: usize = 8192;

const ROOT_CA_PEM: &str = include_str!("../certs/root_ca.pem");
const PEER_CERT_PEM: &str = include_str!("../certs/peer.pem");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // WiFi settings
    pub wifi_ssid: String,
    pub wifi_password: String,

    // Update server and schedule
    pub ota: OtaConfig,
}

fn parse_env<T: std::str::FromStr>(name: &str, raw: &str, fallback: T) -> T {
    raw.parse().unwrap_or_else(|_| {
        log::warn!("Invalid {}='{}' in build environment, using default", name, raw);
        fallback
    })
}

impl Default for Config {
    fn default() -> Self {
        // Get WiFi credentials from environment variables set by build.rs
        // These come from wifi_config.h which should NOT be committed to git
        let wifi_ssid = env!("WIFI_SSID");
        let wifi_password = env!("WIFI_PASSWORD");

        log::info!("Config default: SSID='{}', Password={}",
            wifi_ssid,
            if wifi_password.is_empty() { "<empty>" } else { "<set>" }
        );

        let ota = OtaConfig {
            server_host: env!("OTA_SERVER_HOST").to_string(),
            server_port: parse_env("OTA_SERVER_PORT", env!("OTA_SERVER_PORT"), 443),
            root_ca_cert_pem: ROOT_CA_PEM.to_string(),
            pinned_peer_cert_pem: PEER_CERT_PEM.to_string(),
            metadata_path: env!("OTA_METADATA_PATH").to_string(),
            firmware_path: String::new(),
            polling_interval_seconds: parse_env(
                "OTA_POLLING_INTERVAL_S",
                env!("OTA_POLLING_INTERVAL_S"),
                3600,
            ),
            auto_reboot: parse_env("OTA_AUTO_REBOOT", env!("OTA_AUTO_REBOOT"), true),
        };

        Self {
            wifi_ssid: wifi_ssid.to_string(),
            wifi_password: wifi_password.to_string(),
            ota,
        }
    }
}

/// JSON record in the `ota` NVS namespace
pub struct ConfigStore {
    nvs: EspNvs<NvsDefault>,
}

impl ConfigStore {
    pub fn new(partition: EspDefaultNvsPartition) -> Result<Self> {
        let nvs = EspNvs::new(partition, CONFIG_NAMESPACE, true)?;
        Ok(Self { nvs })
    }

    pub fn load_or_default(&mut self) -> Result<Config> {
        match self.load() {
            Ok(mut config) => {
                log::info!("Loaded configuration from NVS");
                let mut dirty = false;

                // If NVS has empty WiFi credentials, use the compiled-in ones
                if config.wifi_ssid.is_empty() || config.wifi_password.is_empty() {
                    let default_config = Config::default();
                    log::warn!("NVS WiFi credentials empty, using compiled defaults: SSID='{}'", default_config.wifi_ssid);
                    config.wifi_ssid = default_config.wifi_ssid;
                    config.wifi_password = default_config.wifi_password;
                    dirty = true;
                }

                // Certificates always follow the running image
                if config.ota.root_ca_cert_pem != ROOT_CA_PEM
                    || config.ota.pinned_peer_cert_pem != PEER_CERT_PEM
                {
                    log::info!("Server certificates changed with this firmware, updating stored copy");
                    config.ota.root_ca_cert_pem = ROOT_CA_PEM.to_string();
                    config.ota.pinned_peer_cert_pem = PEER_CERT_PEM.to_string();
                    dirty = true;
                }

                if dirty {
                    if let Err(e) = self.save(&config) {
                        log::warn!("Failed to save updated config: {:?}", e);
                    }
                }

                Ok(config)
            }
            Err(e) => {
                log::warn!("Failed to load config from NVS: {:?}, using defaults", e);
                let config = Config::default();

                // Try to save default config to NVS for next time
                if let Err(save_err) = self.save(&config) {
                    log::warn!("Failed to save default config to NVS: {:?}", save_err);
                }

                Ok(config)
            }
        }
    }

    pub fn save(&mut self, config: &Config) -> Result<()> {
        let json = serde_json::to_vec(config)?;
        self.nvs.set_blob(CONFIG_KEY, &json)?;
        log::info!("Configuration saved to NVS");
        Ok(())
    }

    fn load(&self) -> Result<Config> {
        let mut buf = vec![0u8; MAX_CONFIG_SIZE];
        let data = self.nvs.get_blob(CONFIG_KEY, &mut buf)?
            .ok_or_else(|| anyhow::anyhow!("Config not found in NVS"))?;

        let config: Config = serde_json::from_slice(data)?;

        Ok(config)
    }
}
