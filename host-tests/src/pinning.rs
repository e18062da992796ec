use ota_core::testing::{http_ok, ConnectionScript, ScriptedServer, OTHER_CERT_PEM};
use ota_core::{CycleOutcome, OtaError, Trigger};

use crate::Rig;

#[test]
fn pinning_mismatch_sends_nothing() {
    let rig = Rig::with_server(ScriptedServer::with_peer_certificate(OTHER_CERT_PEM), "factory");
    rig.server.push(ConnectionScript::split(&http_ok(b"VERSION=9\nFILE=/evil.bin\n"), 64));
    let mut worker = rig.worker(1).unwrap();

    let outcome = worker.process(Trigger::Check);

    assert!(matches!(
        outcome,
        CycleOutcome::Failed(OtaError::CertificatePinningMismatch { .. })
    ));
    assert!(rig.server.requests().is_empty());
    assert_eq!(rig.triggers.peek(), None);
    assert_eq!(worker.config().firmware_path, "");
}

#[test]
fn untrusted_chain_is_rejected_before_pinning() {
    let rig = Rig::new("factory");
    rig.server.set_chain_valid(false);
    rig.server.push(ConnectionScript::split(&http_ok(b"VERSION=2\nFILE=/fw.bin\n"), 64));
    let mut worker = rig.worker(1).unwrap();

    let outcome = worker.process(Trigger::Check);

    assert!(matches!(outcome, CycleOutcome::Failed(OtaError::Transport(_))));
    assert!(rig.server.requests().is_empty());
}

#[test]
fn session_recovers_after_rejected_peer() {
    let rig = Rig::new("factory");
    rig.server.set_chain_valid(false);
    rig.server.push(ConnectionScript::default());
    let mut worker = rig.worker(1).unwrap();
    assert!(matches!(worker.process(Trigger::Check), CycleOutcome::Failed(_)));

    rig.server.set_chain_valid(true);
    rig.server.push(ConnectionScript::split(&http_ok(b"VERSION=1\nFILE=/fw.bin\n"), 64));
    assert_eq!(worker.process(Trigger::Check), CycleOutcome::UpToDate { version: 1 });
    assert_eq!(rig.server.opens(), 2);
}
