//! In-memory stand-ins for the platform services, shared by the unit tests
//! and the host test crate.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::cert::pem_to_der;
use crate::config::OtaConfig;
use crate::error::{OtaError, Result};
use crate::flash::{PartitionTable, PartitionWriter};
use crate::orchestrator::DeviceControl;
use crate::timer::CheckTimer;
use crate::tls::{ServerIdentity, TlsTransport, TransportStatus};

pub const PEER_CERT_PEM: &str = include_str!("../testdata/peer.pem");
pub const ROOT_CA_PEM: &str = include_str!("../testdata/root_ca.pem");
/// Certificate with a different (P-256) key
pub const OTHER_CERT_PEM: &str = include_str!("../testdata/ec_peer.pem");

pub const TEST_HOST: &str = "updates.example.com";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub fn identity() -> ServerIdentity {
    ServerIdentity {
        host: TEST_HOST.to_string(),
        port: 443,
        root_ca_pem: ROOT_CA_PEM.to_string(),
        pinned_peer_pem: PEER_CERT_PEM.to_string(),
    }
}

pub fn ok_config() -> OtaConfig {
    OtaConfig {
        server_host: TEST_HOST.to_string(),
        root_ca_cert_pem: ROOT_CA_PEM.to_string(),
        pinned_peer_cert_pem: PEER_CERT_PEM.to_string(),
        ..Default::default()
    }
}

/// `200 OK` response carrying `body`
pub fn http_ok(body: &[u8]) -> Vec<u8> {
    let mut raw = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", body.len()).into_bytes();
    raw.extend_from_slice(body);
    raw
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadStep {
    Data(Vec<u8>),
    Retry,
    Fail(String),
}

/// What the server does on one TCP connection. Once `reads` runs dry the
/// server closes the connection.
#[derive(Debug, Clone, Default)]
pub struct ConnectionScript {
    pub reads: VecDeque<ReadStep>,
    pub handshake_retries: usize,
    /// Accept at most this many bytes per send
    pub write_limit: Option<usize>,
}

impl ConnectionScript {
    pub fn from_chunks(chunks: Vec<Vec<u8>>) -> Self {
        Self {
            reads: chunks.into_iter().filter(|c| !c.is_empty()).map(ReadStep::Data).collect(),
            ..Default::default()
        }
    }

    /// Deliver `raw` in reads of `size` bytes
    pub fn split(raw: &[u8], size: usize) -> Self {
        Self::from_chunks(raw.chunks(size.max(1)).map(|c| c.to_vec()).collect())
    }

    /// Deliver `raw` in reads of the given sizes, the remainder in one last read
    pub fn sized(raw: &[u8], sizes: &[usize]) -> Self {
        let mut chunks = Vec::new();
        let mut rest = raw;
        for size in sizes {
            let (head, tail) = rest.split_at((*size).min(rest.len()));
            chunks.push(head.to_vec());
            rest = tail;
        }
        chunks.push(rest.to_vec());
        Self::from_chunks(chunks)
    }
}

struct LiveConnection {
    script: ConnectionScript,
    sent: Vec<u8>,
}

struct ServerState {
    peer_cert_der: Vec<u8>,
    chain_valid: bool,
    pending: VecDeque<ConnectionScript>,
    current: Option<LiveConnection>,
    requests: Vec<String>,
    opens: usize,
    closes: usize,
    initializations: usize,
    unread: usize,
}

/// Scripted TLS peer. Clones share the same state, so a test keeps one
/// handle while the session owns the transport.
#[derive(Clone)]
pub struct ScriptedServer {
    state: Arc<Mutex<ServerState>>,
}

impl ScriptedServer {
    pub fn new() -> Self {
        Self::with_peer_certificate(PEER_CERT_PEM)
    }

    pub fn with_peer_certificate(pem: &str) -> Self {
        let peer_cert_der = pem_to_der(pem).map(|(_, der)| der).unwrap_or_default();
        Self {
            state: Arc::new(Mutex::new(ServerState {
                peer_cert_der,
                chain_valid: true,
                pending: VecDeque::new(),
                current: None,
                requests: Vec::new(),
                opens: 0,
                closes: 0,
                initializations: 0,
                unread: 0,
            })),
        }
    }

    pub fn transport(&self) -> FakeTransport {
        FakeTransport { state: self.state.clone() }
    }

    /// Queue the behaviour of the next connection
    pub fn push(&self, script: ConnectionScript) {
        lock(&self.state).pending.push_back(script);
    }

    pub fn set_chain_valid(&self, valid: bool) {
        lock(&self.state).chain_valid = valid;
    }

    /// Everything a client wrote, one entry per finished connection
    pub fn requests(&self) -> Vec<String> {
        lock(&self.state).requests.clone()
    }

    pub fn opens(&self) -> usize {
        lock(&self.state).opens
    }

    pub fn closes(&self) -> usize {
        lock(&self.state).closes
    }

    pub fn initializations(&self) -> usize {
        lock(&self.state).initializations
    }

    /// Scripted reads the client left unconsumed on the last closed connection
    pub fn unread_reads(&self) -> usize {
        lock(&self.state).unread
    }
}

impl Default for ScriptedServer {
    fn default() -> Self {
        Self::new()
    }
}

pub struct FakeTransport {
    state: Arc<Mutex<ServerState>>,
}

impl TlsTransport for FakeTransport {
    fn initialize(&mut self, _identity: &ServerIdentity) -> Result<()> {
        lock(&self.state).initializations += 1;
        Ok(())
    }

    fn open(&mut self, _host: &str, _port: u16) -> Result<()> {
        let mut state = lock(&self.state);
        state.opens += 1;
        let script = state
            .pending
            .pop_front()
            .ok_or_else(|| OtaError::transport("connection refused"))?;
        state.current = Some(LiveConnection { script, sent: Vec::new() });
        Ok(())
    }

    fn handshake(&mut self) -> TransportStatus<()> {
        let mut state = lock(&self.state);
        match state.current.as_mut() {
            None => TransportStatus::Failed("not connected".into()),
            Some(live) if live.script.handshake_retries > 0 => {
                live.script.handshake_retries -= 1;
                TransportStatus::Retry
            }
            Some(_) => TransportStatus::Ready(()),
        }
    }

    fn verify_chain(&self) -> Result<()> {
        if lock(&self.state).chain_valid {
            Ok(())
        } else {
            Err(OtaError::transport("certificate chain verification failed"))
        }
    }

    fn peer_certificate(&self) -> Option<Vec<u8>> {
        Some(lock(&self.state).peer_cert_der.clone())
    }

    fn send(&mut self, data: &[u8]) -> TransportStatus<usize> {
        let mut state = lock(&self.state);
        let Some(live) = state.current.as_mut() else {
            return TransportStatus::Failed("not connected".into());
        };
        let n = live.script.write_limit.unwrap_or(data.len()).min(data.len());
        live.sent.extend_from_slice(&data[..n]);
        TransportStatus::Ready(n)
    }

    fn recv(&mut self, buf: &mut [u8]) -> TransportStatus<usize> {
        let mut state = lock(&self.state);
        let Some(live) = state.current.as_mut() else {
            return TransportStatus::Failed("not connected".into());
        };
        match live.script.reads.pop_front() {
            None => TransportStatus::Ready(0),
            Some(ReadStep::Retry) => TransportStatus::Retry,
            Some(ReadStep::Fail(msg)) => TransportStatus::Failed(msg),
            Some(ReadStep::Data(mut data)) => {
                if data.len() > buf.len() {
                    let rest = data.split_off(buf.len());
                    live.script.reads.push_front(ReadStep::Data(rest));
                }
                buf[..data.len()].copy_from_slice(&data);
                TransportStatus::Ready(data.len())
            }
        }
    }

    fn close(&mut self) {
        let mut state = lock(&self.state);
        if let Some(live) = state.current.take() {
            state.closes += 1;
            state.unread = live.script.reads.len();
            if !live.sent.is_empty() {
                state.requests.push(String::from_utf8_lossy(&live.sent).into_owned());
            }
        }
    }

    fn reset(&mut self) {}
}

#[derive(Default)]
struct FlashState {
    labels: Vec<String>,
    boot: String,
    images: HashMap<String, Vec<u8>>,
    flushes: HashMap<String, Vec<usize>>,
    discarded: HashSet<String>,
    writes_before_failure: Option<usize>,
    fail_finish: bool,
}

/// Partition table kept in memory, recording every write
#[derive(Clone)]
pub struct MemoryPartitions {
    state: Arc<Mutex<FlashState>>,
}

impl MemoryPartitions {
    pub fn new(boot: &str) -> Self {
        let state = FlashState {
            labels: vec!["factory".into(), "ota_0".into(), "ota_1".into()],
            boot: boot.to_string(),
            ..Default::default()
        };
        Self { state: Arc::new(Mutex::new(state)) }
    }

    pub fn boot(&self) -> String {
        lock(&self.state).boot.clone()
    }

    /// Length of every write that reached `label`
    pub fn flushes(&self, label: &str) -> Vec<usize> {
        lock(&self.state).flushes.get(label).cloned().unwrap_or_default()
    }

    pub fn image(&self, label: &str) -> Vec<u8> {
        lock(&self.state).images.get(label).cloned().unwrap_or_default()
    }

    pub fn discarded(&self, label: &str) -> bool {
        lock(&self.state).discarded.contains(label)
    }

    /// Let `n` writes succeed, fail every one after that
    pub fn fail_write_after(&self, n: usize) {
        lock(&self.state).writes_before_failure = Some(n);
    }

    /// Make image validation fail
    pub fn fail_finish(&self) {
        lock(&self.state).fail_finish = true;
    }
}

impl PartitionTable for MemoryPartitions {
    type Writer = MemoryWriter;

    fn boot_partition(&self) -> Result<String> {
        Ok(self.boot())
    }

    fn open_writer(&mut self, label: &str) -> Result<MemoryWriter> {
        let mut state = lock(&self.state);
        if !state.labels.iter().any(|l| l == label) {
            return Err(OtaError::PartitionNotFound(label.to_string()));
        }
        state.images.insert(label.to_string(), Vec::new());
        state.flushes.insert(label.to_string(), Vec::new());
        state.discarded.remove(label);
        Ok(MemoryWriter { state: self.state.clone(), label: label.to_string() })
    }

    fn set_boot_partition(&mut self, label: &str) -> Result<()> {
        lock(&self.state).boot = label.to_string();
        Ok(())
    }
}

pub struct MemoryWriter {
    state: Arc<Mutex<FlashState>>,
    label: String,
}

impl PartitionWriter for MemoryWriter {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        let mut state = lock(&self.state);
        if let Some(left) = state.writes_before_failure.as_mut() {
            if *left == 0 {
                return Err(OtaError::StorageWrite("simulated flash failure".into()));
            }
            *left -= 1;
        }
        state.images.entry(self.label.clone()).or_default().extend_from_slice(data);
        state.flushes.entry(self.label.clone()).or_default().push(data.len());
        Ok(())
    }

    fn finish(self) -> Result<()> {
        if lock(&self.state).fail_finish {
            return Err(OtaError::StorageWrite("image validation failed".into()));
        }
        Ok(())
    }

    fn discard(self) {
        lock(&self.state).discarded.insert(self.label.clone());
    }
}

#[derive(Debug, Default)]
struct TimerLog {
    armed: Option<Duration>,
    disarms: usize,
}

/// Timer that never fires on its own; tests request checks directly
#[derive(Debug, Clone, Default)]
pub struct ManualTimer {
    log: Arc<Mutex<TimerLog>>,
}

impl ManualTimer {
    pub fn armed(&self) -> Option<Duration> {
        lock(&self.log).armed
    }

    pub fn disarm_count(&self) -> usize {
        lock(&self.log).disarms
    }
}

impl CheckTimer for ManualTimer {
    fn arm(&mut self, period: Duration) -> Result<()> {
        let mut log = lock(&self.log);
        log.armed = Some(period);
        Ok(())
    }

    fn disarm(&mut self) {
        let mut log = lock(&self.log);
        log.armed = None;
        log.disarms += 1;
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordingDevice {
    restarts: Arc<Mutex<Vec<Duration>>>,
}

impl RecordingDevice {
    pub fn restarts(&self) -> Vec<Duration> {
        lock(&self.restarts).clone()
    }
}

impl DeviceControl for RecordingDevice {
    fn restart(&mut self, after: Duration) {
        log::info!("(test) restart requested in {:?}", after);
        lock(&self.restarts).push(after);
    }
}
