use std::time::Duration;

use ota_core::testing::{http_ok, ConnectionScript, ReadStep};
use ota_core::{CycleOutcome, OtaError, Trigger};
use proptest::prelude::*;

use crate::{FakeWorker, Rig};

const METADATA_V2: &[u8] = b"VERSION=2\nFILE=/fw/v2.bin\nINTERVAL=60\n";

fn image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Firmware response with the header block in its own read, then the body
/// in reads of `sizes`
fn firmware_script(body: &[u8], sizes: &[usize]) -> ConnectionScript {
    let raw = http_ok(body);
    let header_len = raw.len() - body.len();
    let mut splits = vec![header_len];
    splits.extend_from_slice(sizes);
    ConnectionScript::sized(&raw, &splits)
}

/// Run the metadata check of scenario A and return the worker with the
/// download pending
fn checked_worker(rig: &Rig) -> FakeWorker {
    rig.server.push(ConnectionScript::split(&http_ok(METADATA_V2), 16));
    let mut worker = rig.worker(1).unwrap();
    rig.triggers.request(Trigger::Check);
    worker.process(Trigger::Check);
    worker
}

#[test]
fn scenario_a_newer_version_schedules_download() {
    let rig = Rig::new("factory");
    let worker = checked_worker(&rig);

    assert_eq!(worker.config().firmware_path, "/fw/v2.bin");
    assert_eq!(worker.config().polling_interval_seconds, 60);
    assert_eq!(rig.timer.armed(), Some(Duration::from_secs(60)));
    assert_eq!(rig.triggers.peek(), Some(Trigger::Download));
    assert!(!rig.triggers.is_pending(Trigger::Check));
    assert_eq!(
        rig.server.requests(),
        vec!["GET /ota.txt HTTP/1.1\r\nHost: updates.example.com\r\n\r\n".to_string()]
    );
}

#[test]
fn scenario_b_same_version_stays_idle() {
    let rig = Rig::new("factory");
    rig.server.push(ConnectionScript::split(&http_ok(b"VERSION=1\nFILE=/fw/v1.bin\n"), 7));
    let mut worker = rig.worker(1).unwrap();
    rig.triggers.request(Trigger::Check);

    assert_eq!(worker.process(Trigger::Check), CycleOutcome::UpToDate { version: 1 });
    assert_eq!(rig.triggers.peek(), None);
    assert_eq!(rig.timer.armed(), Some(Duration::from_secs(3600)));
    assert!(!worker.status().update_in_progress());
}

#[test]
fn scenario_c_single_page_image_is_installed() {
    let rig = Rig::new("factory");
    let mut worker = checked_worker(&rig);
    let body = image(4096);
    rig.server.push(firmware_script(&body, &[1000, 1500, 1596]));

    let outcome = worker.process(Trigger::Download);
    let report = match outcome {
        CycleOutcome::Installed(report) => report,
        other => panic!("expected install, got {:?}", other),
    };

    assert_eq!(report.partition, "ota_0");
    assert_eq!(report.bytes, 4096);
    assert_eq!(rig.partitions.flushes("ota_0"), vec![4096]);
    assert_eq!(rig.partitions.image("ota_0"), body);
    assert_eq!(rig.partitions.boot(), "ota_0");
    assert!(worker.status().new_firmware_installed());
    assert!(!worker.status().update_in_progress());
    assert!(!rig.triggers.is_pending(Trigger::Download));
    assert_eq!(rig.device.restarts(), vec![Duration::from_secs(2)]);
    assert_eq!(rig.server.requests().last().map(String::as_str),
        Some("GET /fw/v2.bin HTTP/1.1\r\nHost: updates.example.com\r\n\r\n"));
}

#[test]
fn scenario_d_flash_failure_keeps_current_firmware() {
    let rig = Rig::new("factory");
    let mut worker = checked_worker(&rig);
    rig.partitions.fail_write_after(0);
    rig.server.push(firmware_script(&image(4096), &[1000, 1500, 1596]));

    let outcome = worker.process(Trigger::Download);

    assert!(matches!(outcome, CycleOutcome::Failed(OtaError::StorageWrite(_))));
    assert!(rig.partitions.discarded("ota_0"));
    assert_eq!(rig.partitions.boot(), "factory");
    assert!(!worker.status().new_firmware_installed());
    assert!(!worker.status().update_in_progress());
    assert!(!worker.flash().is_open());
    assert!(rig.device.restarts().is_empty());
}

#[test]
fn failed_validation_does_not_switch_boot_partition() {
    let rig = Rig::new("ota_0");
    let mut worker = checked_worker(&rig);
    rig.partitions.fail_finish();
    rig.server.push(firmware_script(&image(5000), &[2048]));

    let outcome = worker.process(Trigger::Download);

    assert!(matches!(outcome, CycleOutcome::Failed(OtaError::StorageWrite(_))));
    assert_eq!(rig.partitions.boot(), "ota_0");
    assert!(!worker.status().new_firmware_installed());
}

#[test]
fn empty_image_on_keep_alive_server_is_rejected_at_once() {
    let rig = Rig::new("factory");
    let mut worker = checked_worker(&rig);
    let mut script = ConnectionScript::split(&http_ok(b""), 4096);
    script.reads.extend(std::iter::repeat(ReadStep::Retry).take(10_000));
    rig.server.push(script);

    let outcome = worker.process(Trigger::Download);

    assert_eq!(outcome, CycleOutcome::EmptyImage);
    assert!(rig.server.unread_reads() > 0);
    assert_eq!(rig.partitions.boot(), "factory");
    assert!(!worker.flash().is_open());
    assert!(!worker.status().update_in_progress());
}

#[test]
fn slots_rotate_across_updates() {
    let rig = Rig::new("factory");
    let mut worker = checked_worker(&rig);

    rig.server.push(firmware_script(&image(100), &[]));
    assert!(matches!(worker.process(Trigger::Download), CycleOutcome::Installed(_)));
    assert_eq!(rig.partitions.boot(), "ota_0");

    rig.server.push(firmware_script(&image(100), &[]));
    assert!(matches!(worker.process(Trigger::Download), CycleOutcome::Installed(_)));
    assert_eq!(rig.partitions.boot(), "ota_1");

    rig.server.push(firmware_script(&image(100), &[]));
    assert!(matches!(worker.process(Trigger::Download), CycleOutcome::Installed(_)));
    assert_eq!(rig.partitions.boot(), "ota_0");
}

#[test]
fn unreachable_server_is_retried_on_next_period() {
    let rig = Rig::new("factory");
    let mut worker = rig.worker(1).unwrap();
    rig.triggers.request(Trigger::Check);

    // No connection scripted: the fake refuses to connect
    let outcome = worker.process(Trigger::Check);
    assert!(matches!(outcome, CycleOutcome::Failed(OtaError::Transport(_))));
    assert_eq!(rig.timer.armed(), Some(Duration::from_secs(3600)));
    assert_eq!(rig.triggers.peek(), None);
    assert_eq!(worker.status().snapshot().last_outcome, Some(outcome));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn any_read_pattern_installs_the_same_image(
        len in 1usize..12_000,
        sizes in proptest::collection::vec(1usize..3000, 0..8),
    ) {
        let rig = Rig::new("factory");
        let mut worker = checked_worker(&rig);
        let body = image(len);
        rig.server.push(firmware_script(&body, &sizes));

        let installed = matches!(worker.process(Trigger::Download), CycleOutcome::Installed(_));
        prop_assert!(installed);
        prop_assert_eq!(rig.partitions.image("ota_0"), body);

        let flushes = rig.partitions.flushes("ota_0");
        let (last, full) = flushes.split_last().unwrap();
        prop_assert!(full.iter().all(|n| *n == 4096));
        prop_assert!(*last > 0 && *last <= 4096);
    }
}
