//! Update orchestration: metadata check, firmware download and commit.
//!
//! A single worker thread owns the TLS session, the HTTP buffers and the
//! flash programmer. The periodic timer and the application only ever set
//! trigger flags; everything else happens on the worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::{OtaConfig, UpdaterOptions};
use crate::error::{OtaError, Result};
use crate::flash::{CommitReport, FlashProgrammer, PartitionTable};
use crate::http::{Fragment, HttpClient, HttpRequest};
use crate::metadata::Metadata;
use crate::signal::{ConnectivitySignal, Trigger, Triggers};
use crate::timer::CheckTimer;
use crate::tls::{ServerIdentity, TlsSession, TlsTransport};

const CONNECTIVITY_POLL: Duration = Duration::from_millis(500);

/// Restart hook; on the device this does not return
pub trait DeviceControl: Send {
    fn restart(&mut self, after: Duration);
}

/// Called with the updated record whenever metadata changes the polling
/// interval or the firmware path
pub type ConfigObserver = Box<dyn FnMut(&OtaConfig) + Send>;

/// Result of one worker cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    UpToDate { version: u32 },
    UpdateAvailable { version: u32, file: String },
    /// VERSION= or FILE= missing from the metadata
    MetadataIncomplete,
    Installed(CommitReport),
    EmptyImage,
    Failed(OtaError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusSnapshot {
    pub in_progress: bool,
    pub installed: bool,
    pub last_outcome: Option<CycleOutcome>,
}

/// Flags written by the worker and read by everyone else
#[derive(Debug, Default)]
pub struct UpdateStatus {
    in_progress: AtomicBool,
    installed: AtomicBool,
    last_outcome: Mutex<Option<CycleOutcome>>,
}

impl UpdateStatus {
    pub fn update_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    pub fn new_firmware_installed(&self) -> bool {
        self.installed.load(Ordering::Acquire)
    }

    fn set_in_progress(&self, value: bool) {
        self.in_progress.store(value, Ordering::Release);
    }

    fn set_installed(&self) {
        self.installed.store(true, Ordering::Release);
    }

    fn record(&self, outcome: CycleOutcome) {
        *self.last_outcome.lock().unwrap_or_else(PoisonError::into_inner) = Some(outcome);
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            in_progress: self.update_in_progress(),
            installed: self.new_firmware_installed(),
            last_outcome: self.last_outcome.lock().unwrap_or_else(PoisonError::into_inner).clone(),
        }
    }
}

/// Platform services the worker drives
pub struct Platform<T, P, C, D> {
    pub transport: T,
    pub partitions: P,
    pub timer: C,
    pub device: D,
}

pub struct UpdateWorker<T, P, C, D>
where
    T: TlsTransport,
    P: PartitionTable,
    C: CheckTimer,
    D: DeviceControl,
{
    config: OtaConfig,
    options: UpdaterOptions,
    running_version: u32,
    session: TlsSession<T>,
    http: HttpClient,
    flash: FlashProgrammer<P>,
    timer: C,
    device: D,
    triggers: Triggers,
    status: Arc<UpdateStatus>,
    metadata_buf: Vec<u8>,
    firmware_buf: Vec<u8>,
    config_observer: Option<ConfigObserver>,
}

impl<T, P, C, D> UpdateWorker<T, P, C, D>
where
    T: TlsTransport,
    P: PartitionTable,
    C: CheckTimer,
    D: DeviceControl,
{
    pub fn new(
        config: OtaConfig,
        options: UpdaterOptions,
        running_version: u32,
        platform: Platform<T, P, C, D>,
        triggers: Triggers,
    ) -> Result<Self> {
        config.validate()?;
        let session = TlsSession::new(
            platform.transport,
            ServerIdentity::from_config(&config),
            options.io_timeout,
        )?;

        let metadata_buf = allocate(options.metadata_buffer_size)?;
        let firmware_buf = allocate(options.firmware_buffer_size)?;

        Ok(Self {
            config,
            options,
            running_version,
            session,
            http: HttpClient::new(),
            flash: FlashProgrammer::with_default_slots(platform.partitions),
            timer: platform.timer,
            device: platform.device,
            triggers,
            status: Arc::new(UpdateStatus::default()),
            metadata_buf,
            firmware_buf,
            config_observer: None,
        })
    }

    pub fn with_config_observer(mut self, observer: ConfigObserver) -> Self {
        self.config_observer = Some(observer);
        self
    }

    pub fn config(&self) -> &OtaConfig {
        &self.config
    }

    pub fn status(&self) -> Arc<UpdateStatus> {
        self.status.clone()
    }

    pub fn triggers(&self) -> &Triggers {
        &self.triggers
    }

    pub fn timer(&self) -> &C {
        &self.timer
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn flash(&self) -> &FlashProgrammer<P> {
        &self.flash
    }

    /// Arm the timer with the current interval, or disable it for interval 0
    pub fn prepare_timer(&mut self) {
        match self.config.polling_period() {
            Some(period) => {
                if let Err(e) = self.timer.arm(period) {
                    log::error!("Failed to start the periodic check timer: {}", e);
                }
            }
            None => {
                log::debug!("Periodic update checks disabled");
                self.timer.disarm();
            }
        }
    }

    /// Run one cycle for `trigger` and clear it. After a check the timer is
    /// re-armed before the check flag is cleared, so a tick that lands
    /// during the check is not lost.
    pub fn process(&mut self, trigger: Trigger) -> CycleOutcome {
        let outcome = match trigger {
            Trigger::Download => {
                log::info!("Firmware updater task will now download the new firmware image");
                let outcome = self.download_firmware().unwrap_or_else(CycleOutcome::Failed);
                self.triggers.complete(Trigger::Download);
                outcome
            }
            Trigger::Check => {
                log::info!("Firmware updater task checking for firmware update");
                let outcome = self.check_for_update().unwrap_or_else(CycleOutcome::Failed);
                self.prepare_timer();
                self.triggers.complete(Trigger::Check);
                outcome
            }
        };

        if let CycleOutcome::Failed(e) = &outcome {
            log::warn!("Update cycle failed [{}]: {}", e.as_str(), e);
        }
        self.status.record(outcome.clone());
        outcome
    }

    fn check_for_update(&mut self) -> Result<CycleOutcome> {
        let request = HttpRequest::get(&self.config.server_host, &self.config.metadata_path)?;
        let body = self.http.get_complete(&mut self.session, &request, &mut self.metadata_buf)?;
        let metadata = Metadata::parse(body);
        let mut changed = false;

        if let Some(interval) = metadata.interval_seconds {
            if interval != self.config.polling_interval_seconds {
                log::info!(
                    "Polling interval changed from {} s to {} s",
                    self.config.polling_interval_seconds,
                    interval
                );
                self.config.polling_interval_seconds = interval;
                changed = true;
            }
        }

        let outcome = self.evaluate(metadata, &mut changed);
        if changed {
            if let Some(observer) = self.config_observer.as_mut() {
                observer(&self.config);
            }
        }
        Ok(outcome)
    }

    fn evaluate(&mut self, metadata: Metadata, changed: &mut bool) -> CycleOutcome {
        let Some(version) = metadata.version else {
            log::warn!("Firmware version not provided, skipping firmware update");
            return CycleOutcome::MetadataIncomplete;
        };
        let Some(file) = metadata.file else {
            log::warn!("Firmware file name not provided, skipping firmware update");
            return CycleOutcome::MetadataIncomplete;
        };
        if self.config.firmware_path != file.as_str() {
            self.config.firmware_path = file.to_string();
            *changed = true;
        }

        if version == self.running_version {
            log::info!("Firmware is up to date (version {})", version);
            return CycleOutcome::UpToDate { version };
        }

        log::info!(
            "Firmware update available: version {} at '{}' (running version {})",
            version,
            self.config.firmware_path,
            self.running_version
        );
        self.triggers.request(Trigger::Download);
        CycleOutcome::UpdateAvailable { version, file: self.config.firmware_path.clone() }
    }

    fn download_firmware(&mut self) -> Result<CycleOutcome> {
        let result = self.stream_image();
        self.status.set_in_progress(false);
        if result.is_err() && self.flash.is_open() {
            let _ = self.flash.abort();
        }
        let outcome = result?;

        if let CycleOutcome::Installed(report) = &outcome {
            self.status.set_installed();
            log::info!(
                "New firmware installed to '{}' ({} bytes, sha256 {})",
                report.partition,
                report.bytes,
                report.sha256
            );
            if self.config.auto_reboot {
                log::info!(
                    "Automatic re-boot in {} seconds - goodbye!...",
                    self.options.reboot_delay.as_secs()
                );
                self.device.restart(self.options.reboot_delay);
            }
        }
        Ok(outcome)
    }

    fn stream_image(&mut self) -> Result<CycleOutcome> {
        let request = HttpRequest::get(&self.config.server_host, &self.config.firmware_path)?;
        let flash = &mut self.flash;
        let status = &self.status;

        let mut stream = self.http.get_streaming(&mut self.session, &request, &mut self.firmware_buf)?;
        let mut total = 0usize;
        let mut started = false;

        loop {
            match stream.next_fragment()? {
                Some(Fragment::Data(data)) => {
                    if !started {
                        if flash.is_open() {
                            log::warn!("Stale programming session found, aborting it first");
                            flash.abort()?;
                        }
                        flash.begin()?;
                        status.set_in_progress(true);
                        started = true;
                    }

                    total += data.len();
                    if let Err(e) = flash.write(data) {
                        log::error!("Flash write failed ({}), aborting firmware update!", e);
                        flash.abort()?;
                        return Err(e);
                    }
                }
                Some(Fragment::End) | None => break,
            }
        }
        drop(stream);
        log::debug!("All firmware data received ({} bytes), closing session", total);

        if total == 0 {
            log::error!("Something's not OK - the new firmware image is empty!");
            if flash.is_open() {
                flash.abort()?;
            }
            return Ok(CycleOutcome::EmptyImage);
        }

        let report = flash.commit()?;
        Ok(CycleOutcome::Installed(report))
    }

    /// Block until connected. False if shut down while waiting.
    fn wait_for_connectivity(&self, connectivity: &ConnectivitySignal) -> bool {
        while !connectivity.wait_connected(CONNECTIVITY_POLL) {
            if self.triggers.is_shut_down() {
                return false;
            }
        }
        !self.triggers.is_shut_down()
    }

    fn settle(&self, delay: Duration) {
        let mut remaining = delay;
        while !remaining.is_zero() && !self.triggers.is_shut_down() {
            let step = remaining.min(CONNECTIVITY_POLL);
            thread::sleep(step);
            remaining -= step;
        }
    }

    /// Worker loop; returns after `Triggers::shutdown`
    pub fn run(mut self, connectivity: ConnectivitySignal) {
        log::info!("Firmware updater task started (running version {})", self.running_version);

        if !self.wait_for_connectivity(&connectivity) {
            return;
        }
        self.settle(self.options.startup_delay);

        while let Some(trigger) = self.triggers.next() {
            if !self.wait_for_connectivity(&connectivity) {
                break;
            }
            self.process(trigger);
        }

        self.timer.disarm();
        log::info!("Firmware updater task stopped");
    }
}

impl<T, P, C, D> UpdateWorker<T, P, C, D>
where
    T: TlsTransport + Send + 'static,
    P: PartitionTable + Send + 'static,
    P::Writer: Send,
    C: CheckTimer + 'static,
    D: DeviceControl + 'static,
{
    /// Arm the timer and move the worker onto its own thread
    pub fn spawn(mut self, connectivity: ConnectivitySignal, stack_size: Option<usize>) -> Result<OtaHandle> {
        self.prepare_timer();
        let triggers = self.triggers.clone();
        let status = self.status.clone();

        let mut builder = thread::Builder::new().name("ota_worker".into());
        if let Some(size) = stack_size {
            builder = builder.stack_size(size);
        }
        let worker = builder.spawn(move || self.run(connectivity)).map_err(|e| {
            log::error!("Failed to spawn OTA worker: {}", e);
            OtaError::OutOfMemory
        })?;

        Ok(OtaHandle { triggers, status, worker: Some(worker) })
    }
}

fn allocate(size: usize) -> Result<Vec<u8>> {
    if size == 0 {
        return Err(OtaError::invalid("buffer size must be non-zero"));
    }
    let mut buf = Vec::new();
    buf.try_reserve_exact(size).map_err(|_| OtaError::OutOfMemory)?;
    buf.resize(size, 0);
    Ok(buf)
}

/// Application side of a running updater
pub struct OtaHandle {
    triggers: Triggers,
    status: Arc<UpdateStatus>,
    worker: Option<JoinHandle<()>>,
}

impl OtaHandle {
    /// Ask for a check as soon as possible. Coalesces with a pending request.
    pub fn check_now(&self) -> Result<()> {
        if self.triggers.is_shut_down() {
            return Err(OtaError::invalid("updater has been shut down"));
        }
        log::debug!("Manual update check requested");
        self.triggers.request(Trigger::Check);
        Ok(())
    }

    pub fn update_in_progress(&self) -> bool {
        self.status.update_in_progress()
    }

    pub fn new_firmware_installed(&self) -> bool {
        self.status.new_firmware_installed()
    }

    pub fn status(&self) -> StatusSnapshot {
        self.status.snapshot()
    }

    /// Stop the worker after its current cycle and wait for it
    pub fn shutdown(mut self) {
        self.triggers.shutdown();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;
    use crate::testing::{
        http_ok, ok_config, ConnectionScript, ManualTimer, MemoryPartitions, RecordingDevice,
        ScriptedServer,
    };

    type TestWorker = UpdateWorker<
        crate::testing::FakeTransport,
        MemoryPartitions,
        ManualTimer,
        RecordingDevice,
    >;

    fn worker(server: &ScriptedServer, partitions: &MemoryPartitions, version: u32) -> TestWorker {
        let platform = Platform {
            transport: server.transport(),
            partitions: partitions.clone(),
            timer: ManualTimer::default(),
            device: RecordingDevice::default(),
        };
        UpdateWorker::new(ok_config(), UpdaterOptions::default(), version, platform, Triggers::new())
            .unwrap()
    }

    #[test]
    fn check_schedules_download_and_updates_config() {
        let server = ScriptedServer::new();
        server.push(ConnectionScript::split(&http_ok(b"VERSION=2\nFILE=/fw/v2.bin\nINTERVAL=60\n"), 32));
        let partitions = MemoryPartitions::new("factory");
        let mut worker = worker(&server, &partitions, 1);
        worker.triggers().request(Trigger::Check);

        let outcome = worker.process(Trigger::Check);
        assert_eq!(outcome, CycleOutcome::UpdateAvailable { version: 2, file: "/fw/v2.bin".into() });
        assert_eq!(worker.config().firmware_path, "/fw/v2.bin");
        assert_eq!(worker.config().polling_interval_seconds, 60);
        assert_eq!(worker.timer().armed(), Some(Duration::from_secs(60)));
        assert_eq!(worker.triggers().peek(), Some(Trigger::Download));
        assert!(!worker.triggers().is_pending(Trigger::Check));
    }

    #[test]
    fn observer_sees_metadata_changes_only() {
        let server = ScriptedServer::new();
        let body = b"VERSION=1\nFILE=/fw/v1.bin\nINTERVAL=60\n";
        server.push(ConnectionScript::split(&http_ok(body), 64));
        server.push(ConnectionScript::split(&http_ok(body), 64));
        let partitions = MemoryPartitions::new("factory");
        let saved = Arc::new(Mutex::new(Vec::new()));
        let sink = saved.clone();
        let mut worker = worker(&server, &partitions, 1).with_config_observer(Box::new(move |config: &OtaConfig| {
            sink.lock().unwrap().push((config.polling_interval_seconds, config.firmware_path.clone()));
        }));

        worker.process(Trigger::Check);
        worker.process(Trigger::Check);
        assert_eq!(*saved.lock().unwrap(), vec![(60, "/fw/v1.bin".to_string())]);
    }

    #[test]
    fn same_version_does_nothing() {
        let server = ScriptedServer::new();
        server.push(ConnectionScript::split(&http_ok(b"VERSION=1\nFILE=/fw/v1.bin\n"), 64));
        let partitions = MemoryPartitions::new("factory");
        let mut worker = worker(&server, &partitions, 1);

        assert_eq!(worker.process(Trigger::Check), CycleOutcome::UpToDate { version: 1 });
        assert_eq!(worker.triggers().peek(), None);
    }

    #[test]
    fn incomplete_metadata_is_skipped() {
        for body in [&b"FILE=/fw.bin\n"[..], &b"VERSION=5\n"[..]] {
            let server = ScriptedServer::new();
            server.push(ConnectionScript::split(&http_ok(body), 64));
            let partitions = MemoryPartitions::new("factory");
            let mut worker = worker(&server, &partitions, 1);
            assert_eq!(worker.process(Trigger::Check), CycleOutcome::MetadataIncomplete);
            assert_eq!(worker.triggers().peek(), None);
        }
    }

    #[test]
    fn zero_interval_disables_timer() {
        let server = ScriptedServer::new();
        server.push(ConnectionScript::split(&http_ok(b"VERSION=1\nFILE=/a\nINTERVAL=0\n"), 64));
        let partitions = MemoryPartitions::new("factory");
        let mut worker = worker(&server, &partitions, 1);
        worker.process(Trigger::Check);
        assert_eq!(worker.timer().armed(), None);
        assert!(worker.timer().disarm_count() >= 1);
    }

    #[test]
    fn failed_check_still_rearms_timer() {
        let server = ScriptedServer::new();
        server.push(ConnectionScript::split(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n", 64));
        let partitions = MemoryPartitions::new("factory");
        let mut worker = worker(&server, &partitions, 1);

        let outcome = worker.process(Trigger::Check);
        assert_eq!(outcome, CycleOutcome::Failed(ProtocolError::NonOkStatus(404).into()));
        assert_eq!(worker.timer().armed(), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn download_commits_and_reboots() {
        let image: Vec<u8> = (0..10_000u32).map(|i| (i * 7) as u8).collect();
        let server = ScriptedServer::new();
        server.push(ConnectionScript::split(&http_ok(&image), 1400));
        let partitions = MemoryPartitions::new("ota_0");
        let mut worker = worker(&server, &partitions, 1);
        worker.config.firmware_path = "/fw/v2.bin".into();

        let outcome = worker.process(Trigger::Download);
        let report = match outcome {
            CycleOutcome::Installed(report) => report,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_eq!(report.partition, "ota_1");
        assert_eq!(report.bytes, image.len());
        assert_eq!(partitions.image("ota_1"), image);
        assert_eq!(partitions.boot(), "ota_1");
        assert!(worker.status().new_firmware_installed());
        assert!(!worker.status().update_in_progress());
        assert_eq!(worker.device().restarts(), vec![Duration::from_secs(2)]);
    }

    #[test]
    fn empty_image_is_rejected() {
        let server = ScriptedServer::new();
        server.push(ConnectionScript::split(&http_ok(b""), 64));
        let partitions = MemoryPartitions::new("factory");
        let mut worker = worker(&server, &partitions, 1);
        worker.config.firmware_path = "/fw/empty.bin".into();

        assert_eq!(worker.process(Trigger::Download), CycleOutcome::EmptyImage);
        assert_eq!(partitions.boot(), "factory");
        assert!(!worker.status().new_firmware_installed());
    }

    #[test]
    fn truncated_download_aborts() {
        let server = ScriptedServer::new();
        let mut raw = http_ok(&[0xAB; 6000]);
        raw.truncate(raw.len() - 1000);
        server.push(ConnectionScript::split(&raw, 1024));
        let partitions = MemoryPartitions::new("factory");
        let mut worker = worker(&server, &partitions, 1);
        worker.config.firmware_path = "/fw/v2.bin".into();

        let outcome = worker.process(Trigger::Download);
        assert!(matches!(
            outcome,
            CycleOutcome::Failed(OtaError::Protocol(ProtocolError::TruncatedBody { .. }))
        ));
        assert!(partitions.discarded("ota_0"));
        assert_eq!(partitions.boot(), "factory");
        assert!(!worker.flash().is_open());
        assert!(!worker.status().update_in_progress());
    }

    #[test]
    fn missing_firmware_path_fails_fast() {
        let server = ScriptedServer::new();
        let partitions = MemoryPartitions::new("factory");
        let mut worker = worker(&server, &partitions, 1);
        assert!(matches!(
            worker.process(Trigger::Download),
            CycleOutcome::Failed(OtaError::InvalidArgument(_))
        ));
        assert_eq!(server.opens(), 0);
    }
}
