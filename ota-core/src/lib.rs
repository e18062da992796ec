//! OTA Core - Hardware-independent firmware update engine
//!
//! TLS session with public key pinning, a streaming HTTP/1.1 client, the
//! page buffered flash programmer and the update orchestrator. Platform
//! services (TLS stack, partitions, timer, restart) come in through traits so
//! everything here runs and is tested on the host.

pub mod cert;
pub mod config;
pub mod error;
pub mod flash;
pub mod http;
pub mod metadata;
pub mod orchestrator;
pub mod signal;
pub mod timer;
pub mod tls;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::{OtaConfig, UpdaterOptions};
pub use error::{OtaError, ProtocolError, Result, SessionStateError};
pub use orchestrator::{
    ConfigObserver, CycleOutcome, DeviceControl, OtaHandle, Platform, StatusSnapshot, UpdateWorker,
};
pub use signal::{ConnectivitySignal, Trigger, Triggers};
