use std::thread;
use std::time::{Duration, Instant};

use ota_core::testing::{http_ok, ok_config, ConnectionScript};
use ota_core::{ConnectivitySignal, CycleOutcome, OtaHandle};

use crate::Rig;

fn wait_for(handle: &OtaHandle, what: impl Fn(&OtaHandle) -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if what(handle) {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn check_now_runs_full_update_on_worker_thread() {
    let rig = Rig::new("factory");
    rig.server.push(ConnectionScript::split(&http_ok(b"VERSION=2\nFILE=/fw/v2.bin\n"), 32));
    rig.server.push(ConnectionScript::split(&http_ok(&[0x5A; 9000]), 1500));

    let connectivity = ConnectivitySignal::new();
    connectivity.set(true);
    let worker = rig.worker_with(ok_config(), Rig::fast_options(), 1).unwrap();
    let handle = worker.spawn(connectivity, None).unwrap();

    handle.check_now().unwrap();
    assert!(wait_for(&handle, |h| matches!(h.status().last_outcome, Some(CycleOutcome::Installed(_)))));
    assert!(handle.new_firmware_installed());
    assert!(!handle.update_in_progress());
    assert_eq!(rig.partitions.boot(), "ota_0");
    assert_eq!(rig.device.restarts(), vec![Duration::from_millis(1)]);

    handle.shutdown();
    assert_eq!(rig.timer.armed(), None);
}

#[test]
fn worker_waits_for_connectivity() {
    let rig = Rig::new("factory");
    rig.server.push(ConnectionScript::split(&http_ok(b"VERSION=1\nFILE=/fw/v1.bin\n"), 32));

    let connectivity = ConnectivitySignal::new();
    let worker = rig.worker_with(ok_config(), Rig::fast_options(), 1).unwrap();
    let handle = worker.spawn(connectivity.clone(), None).unwrap();
    handle.check_now().unwrap();

    thread::sleep(Duration::from_millis(100));
    assert_eq!(rig.server.opens(), 0);

    connectivity.set(true);
    assert!(wait_for(&handle, |h| h.status().last_outcome.is_some()));
    assert_eq!(handle.status().last_outcome, Some(CycleOutcome::UpToDate { version: 1 }));
    handle.shutdown();
}

#[test]
fn shutdown_while_offline_returns() {
    let rig = Rig::new("factory");
    let worker = rig.worker_with(ok_config(), Rig::fast_options(), 1).unwrap();
    let handle = worker.spawn(ConnectivitySignal::new(), None).unwrap();
    handle.shutdown();
    assert_eq!(rig.server.opens(), 0);
}

#[test]
fn thread_timer_drives_periodic_checks() {
    use ota_core::timer::ThreadTimer;
    use ota_core::{Platform, Triggers, UpdateWorker};

    let rig = Rig::new("factory");
    for _ in 0..2 {
        rig.server.push(ConnectionScript::split(&http_ok(b"VERSION=1\nFILE=/fw/v1.bin\n"), 32));
    }
    let triggers = Triggers::new();
    let platform = Platform {
        transport: rig.server.transport(),
        partitions: rig.partitions.clone(),
        timer: ThreadTimer::spawn(triggers.clone()).unwrap(),
        device: rig.device.clone(),
    };
    let mut config = ok_config();
    config.polling_interval_seconds = 1;

    let connectivity = ConnectivitySignal::new();
    connectivity.set(true);
    let worker = UpdateWorker::new(config, Rig::fast_options(), 1, platform, triggers).unwrap();
    let handle = worker.spawn(connectivity, None).unwrap();

    // No check_now: the first cycle comes from the timer
    assert!(wait_for(&handle, |h| h.status().last_outcome.is_some()));
    assert_eq!(handle.status().last_outcome, Some(CycleOutcome::UpToDate { version: 1 }));
    assert!(rig.server.opens() >= 1);
    handle.shutdown();
}
