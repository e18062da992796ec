// Periodic check timer on the ESP-IDF timer task

use std::time::Duration;

use esp_idf_svc::timer::{EspTaskTimerService, EspTimer};
use ota_core::timer::CheckTimer;
use ota_core::{OtaError, Result, Trigger, Triggers};

/// One-shot `esp_timer` that raises the check trigger
pub struct EspCheckTimer {
    timer: EspTimer<'static>,
}

impl EspCheckTimer {
    pub fn new(service: &EspTaskTimerService, triggers: Triggers) -> anyhow::Result<Self> {
        let timer = service.timer(move || {
            log::debug!("Periodic update check due");
            triggers.request(Trigger::Check);
        })?;
        Ok(Self { timer })
    }
}

impl CheckTimer for EspCheckTimer {
    fn arm(&mut self, period: Duration) -> Result<()> {
        // esp_timer refuses to start a timer that is still running
        let _ = self.timer.cancel();
        self.timer.after(period).map_err(|e| {
            log::error!("Failed to start update check timer: {}", e);
            OtaError::invalid(format!("timer start failed: {}", e))
        })?;
        log::debug!("Next update check in {} s", period.as_secs());
        Ok(())
    }

    fn disarm(&mut self) {
        let _ = self.timer.cancel();
    }
}
