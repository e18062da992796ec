// Station WiFi and the connectivity monitor feeding the updater

pub mod wifi;
pub mod wifi_reconnect;

pub use wifi::WifiManager;
pub use wifi_reconnect::WifiReconnectManager;
