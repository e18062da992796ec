//! TLS session with certificate pinning.
//!
//! `TlsSession` owns one connection to one server identity. The platform
//! supplies the actual TLS stack through [`TlsTransport`]; the session drives
//! it through initialization, handshake, chain validation and pinning, and
//! turns transient "retry" conditions into a bounded poll loop.

use std::ops::ControlFlow;
use std::thread;
use std::time::{Duration, Instant};

use crate::cert::PinnedKey;
use crate::config::OtaConfig;
use crate::error::{OtaError, Result, SessionStateError};

/// Result of a single non-blocking transport step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportStatus<T> {
    Ready(T),
    /// Would block, try again (WANT_READ / WANT_WRITE)
    Retry,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerIdentity {
    pub host: String,
    pub port: u16,
    pub root_ca_pem: String,
    pub pinned_peer_pem: String,
}

impl ServerIdentity {
    pub fn from_config(config: &OtaConfig) -> Self {
        Self {
            host: config.server_host.clone(),
            port: config.server_port,
            root_ca_pem: config.root_ca_cert_pem.clone(),
            pinned_peer_pem: config.pinned_peer_cert_pem.clone(),
        }
    }
}

/// Platform TLS stack (mbedTLS on the device, scripted fakes in tests)
pub trait TlsTransport {
    /// Load the root CA, seed the RNG and set up the client configuration
    fn initialize(&mut self, identity: &ServerIdentity) -> Result<()>;
    /// Open the TCP connection
    fn open(&mut self, host: &str, port: u16) -> Result<()>;
    fn handshake(&mut self) -> TransportStatus<()>;
    /// Chain validation of the completed handshake against the root CA
    fn verify_chain(&self) -> Result<()>;
    /// DER encoded certificate presented by the peer
    fn peer_certificate(&self) -> Option<Vec<u8>>;
    fn send(&mut self, data: &[u8]) -> TransportStatus<usize>;
    /// `Ready(0)` means the peer closed the connection
    fn recv(&mut self, buf: &mut [u8]) -> TransportStatus<usize>;
    /// Close the connection; initialization state is kept
    fn close(&mut self);
    /// Release everything `initialize` set up
    fn reset(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initialized,
    Connected,
}

/// Poll loop for transient transport conditions
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub timeout: Duration,
}

impl RetryPolicy {
    const YIELD_ROUNDS: u32 = 16;
    const BACKOFF: Duration = Duration::from_millis(5);

    pub fn run<R>(&self, what: &str, mut op: impl FnMut() -> TransportStatus<R>) -> Result<R> {
        let started = Instant::now();
        let mut rounds = 0u32;
        loop {
            match op() {
                TransportStatus::Ready(value) => return Ok(value),
                TransportStatus::Failed(msg) => {
                    return Err(OtaError::transport(format!("{}: {}", what, msg)))
                }
                TransportStatus::Retry => {
                    rounds += 1;
                    if started.elapsed() >= self.timeout {
                        return Err(OtaError::transport(format!(
                            "{}: no progress after {:?} ({} retries)",
                            what, self.timeout, rounds
                        )));
                    }
                    if rounds < Self::YIELD_ROUNDS {
                        thread::yield_now();
                    } else {
                        thread::sleep(Self::BACKOFF);
                    }
                }
            }
        }
    }
}

pub struct TlsSession<T: TlsTransport> {
    transport: T,
    identity: ServerIdentity,
    pinned: Option<PinnedKey>,
    state: SessionState,
    retry: RetryPolicy,
}

impl<T: TlsTransport> TlsSession<T> {
    pub fn new(transport: T, identity: ServerIdentity, io_timeout: Duration) -> Result<Self> {
        if identity.host.is_empty() {
            return Err(OtaError::invalid("TLS session: server host missing"));
        }
        if identity.port == 0 {
            return Err(OtaError::invalid("TLS session: invalid server port"));
        }
        if identity.root_ca_pem.is_empty() || identity.pinned_peer_pem.is_empty() {
            return Err(OtaError::invalid("TLS session: certificate material missing"));
        }
        log::debug!("TLS session created for server: {}", identity.host);
        Ok(Self {
            transport,
            identity,
            pinned: None,
            state: SessionState::Uninitialized,
            retry: RetryPolicy { timeout: io_timeout },
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn ensure_initialized(&mut self) -> Result<()> {
        if self.state != SessionState::Uninitialized {
            return Ok(());
        }

        let pinned = PinnedKey::from_pem(&self.identity.pinned_peer_pem)?;
        if let Err(e) = self.transport.initialize(&self.identity) {
            log::error!("TLS init failed for '{}': {}", self.identity.host, e);
            self.transport.reset();
            return Err(e);
        }

        self.pinned = Some(pinned);
        self.state = SessionState::Initialized;
        log::debug!("TLS context initialised for server: {}", self.identity.host);
        Ok(())
    }

    /// Connect, handshake, validate the chain and check the pinned key.
    /// Nothing is ever sent over a channel that fails any of these steps.
    pub fn connect(&mut self) -> Result<()> {
        if self.state == SessionState::Connected {
            log::debug!("TLS connect: dropping previous connection first");
            self.disconnect();
        }
        self.ensure_initialized()?;

        if let Err(e) = self.transport.open(&self.identity.host, self.identity.port) {
            log::error!("Failed to connect to '{}:{}': {}", self.identity.host, self.identity.port, e);
            self.transport.close();
            return Err(e);
        }
        log::debug!("TCP connection to '{}' open, starting handshake", self.identity.host);

        if let Err(e) = self.establish() {
            log::error!("TLS connect to '{}' failed: {}", self.identity.host, e);
            self.transport.close();
            return Err(e);
        }

        self.state = SessionState::Connected;
        log::info!("Started valid TLS session with server '{}'", self.identity.host);
        Ok(())
    }

    fn establish(&mut self) -> Result<()> {
        let policy = self.retry;
        let transport = &mut self.transport;
        policy.run("handshake", || transport.handshake())?;

        self.transport.verify_chain()?;

        let peer = self
            .transport
            .peer_certificate()
            .ok_or_else(|| OtaError::transport("peer certificate unavailable"))?;
        match &self.pinned {
            Some(pinned) => pinned.verify_peer(&peer),
            None => Err(OtaError::invalid("pinned key not loaded")),
        }
    }

    /// Close the connection; the session stays initialized for reuse
    pub fn disconnect(&mut self) {
        if self.state == SessionState::Uninitialized {
            return;
        }
        self.transport.close();
        if self.state == SessionState::Connected {
            log::info!("Ended TLS session with server '{}'", self.identity.host);
        }
        self.state = SessionState::Initialized;
    }

    /// Write the whole request and hand back the reader for the response
    pub fn exchange(&mut self, request: &[u8]) -> Result<Exchange<'_, T>> {
        if self.state != SessionState::Connected {
            return Err(SessionStateError::NotConnected.into());
        }

        let policy = self.retry;
        let mut written = 0;
        while written < request.len() {
            let transport = &mut self.transport;
            let remaining = &request[written..];
            match policy.run("write", || transport.send(remaining)) {
                Ok(0) => {
                    self.disconnect();
                    return Err(OtaError::transport("write: connection closed"));
                }
                Ok(n) => {
                    written += n.min(remaining.len());
                    if written < request.len() {
                        log::debug!(
                            "TLS partial write: {} bytes written, {} remaining",
                            n,
                            request.len() - written
                        );
                    }
                }
                Err(e) => {
                    log::error!("TLS write failed, disconnecting: {}", e);
                    self.disconnect();
                    return Err(e);
                }
            }
        }

        Ok(Exchange { session: self, next_index: 0, open: true })
    }

    /// Send `request` and feed every received chunk to `sink` until it breaks
    /// or the peer closes the connection.
    pub fn send_request<F>(&mut self, request: &[u8], buf: &mut [u8], mut sink: F) -> Result<()>
    where
        F: FnMut(usize, &[u8]) -> ControlFlow<()>,
    {
        let mut exchange = self.exchange(request)?;
        while let Some(chunk) = exchange.read_chunk(buf)? {
            if sink(chunk.index, &buf[..chunk.len]).is_break() {
                break;
            }
        }
        Ok(())
    }
}

impl<T: TlsTransport> Drop for TlsSession<T> {
    fn drop(&mut self) {
        self.disconnect();
        self.transport.reset();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub len: usize,
}

/// Response side of one request. Dropping it disconnects the session.
pub struct Exchange<'s, T: TlsTransport> {
    session: &'s mut TlsSession<T>,
    next_index: usize,
    open: bool,
}

impl<'s, T: TlsTransport> Exchange<'s, T> {
    /// Next chunk of response bytes in `buf[..len]`, None after a clean EOF
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> Result<Option<Chunk>> {
        if !self.open {
            return Ok(None);
        }

        let policy = self.session.retry;
        let transport = &mut self.session.transport;
        match policy.run("read", || transport.recv(buf)) {
            Ok(0) => {
                log::debug!("TLS read: EOF");
                self.finish();
                Ok(None)
            }
            Ok(len) => {
                let chunk = Chunk { index: self.next_index, len };
                self.next_index += 1;
                log::trace!("TLS read: chunk {} with {} bytes", chunk.index, len);
                Ok(Some(chunk))
            }
            Err(e) => {
                log::error!("TLS read failed, disconnecting: {}", e);
                self.finish();
                Err(e)
            }
        }
    }

    /// Stop receiving and close the connection
    pub fn finish(&mut self) {
        if self.open {
            self.open = false;
            self.session.disconnect();
        }
    }
}

impl<'s, T: TlsTransport> Drop for Exchange<'s, T> {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{identity, ConnectionScript, ReadStep, ScriptedServer, OTHER_CERT_PEM};

    fn session(server: &ScriptedServer) -> TlsSession<crate::testing::FakeTransport> {
        TlsSession::new(server.transport(), identity(), Duration::from_secs(2)).unwrap()
    }

    #[test]
    fn connect_and_collect_chunks() {
        let server = ScriptedServer::new();
        server.push(ConnectionScript::from_chunks(vec![b"hello ".to_vec(), b"world".to_vec()]));
        let mut tls = session(&server);

        tls.connect().unwrap();
        assert_eq!(tls.state(), SessionState::Connected);

        let mut seen = Vec::new();
        let mut buf = [0u8; 64];
        tls.send_request(b"PING", &mut buf, |index, data| {
            seen.push((index, data.to_vec()));
            ControlFlow::Continue(())
        })
        .unwrap();

        assert_eq!(seen, vec![(0, b"hello ".to_vec()), (1, b"world".to_vec())]);
        assert_eq!(server.requests(), vec!["PING".to_string()]);
        // EOF disconnects but keeps the session reusable
        assert_eq!(tls.state(), SessionState::Initialized);
        assert_eq!(server.initializations(), 1);
    }

    #[test]
    fn reconnect_reuses_initialization() {
        let server = ScriptedServer::new();
        server.push(ConnectionScript::from_chunks(vec![b"a".to_vec()]));
        server.push(ConnectionScript::from_chunks(vec![b"b".to_vec()]));
        let mut tls = session(&server);

        for _ in 0..2 {
            tls.connect().unwrap();
            let mut buf = [0u8; 8];
            tls.send_request(b"x", &mut buf, |_, _| ControlFlow::Continue(())).unwrap();
        }
        assert_eq!(server.initializations(), 1);
        assert_eq!(server.opens(), 2);
    }

    #[test]
    fn sink_can_stop_early() {
        let server = ScriptedServer::new();
        server.push(ConnectionScript::from_chunks(vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]));
        let mut tls = session(&server);
        tls.connect().unwrap();

        let mut calls = 0;
        let mut buf = [0u8; 8];
        tls.send_request(b"x", &mut buf, |_, _| {
            calls += 1;
            ControlFlow::Break(())
        })
        .unwrap();
        assert_eq!(calls, 1);
        assert_eq!(tls.state(), SessionState::Initialized);
    }

    #[test]
    fn pinning_mismatch_fails_without_sending() {
        let server = ScriptedServer::with_peer_certificate(OTHER_CERT_PEM);
        server.push(ConnectionScript::from_chunks(vec![b"secret".to_vec()]));
        let mut tls = session(&server);

        let err = tls.connect().unwrap_err();
        assert!(matches!(err, OtaError::CertificatePinningMismatch { .. }));
        assert_ne!(tls.state(), SessionState::Connected);
        assert!(server.requests().is_empty());

        let mut buf = [0u8; 8];
        let err = tls
            .send_request(b"GET", &mut buf, |_, _| ControlFlow::Continue(()))
            .unwrap_err();
        assert_eq!(err, OtaError::SessionState(SessionStateError::NotConnected));
        assert!(server.requests().is_empty());
    }

    #[test]
    fn chain_failure_is_transport_error() {
        let server = ScriptedServer::new();
        server.set_chain_valid(false);
        server.push(ConnectionScript::from_chunks(vec![]));
        let mut tls = session(&server);
        assert!(matches!(tls.connect(), Err(OtaError::Transport(_))));
        assert_eq!(server.closes(), 1);
    }

    #[test]
    fn transient_conditions_are_retried() {
        let server = ScriptedServer::new();
        let mut script = ConnectionScript::from_chunks(vec![]);
        script.handshake_retries = 3;
        script.write_limit = Some(3);
        script.reads = vec![
            ReadStep::Retry,
            ReadStep::Data(b"ok".to_vec()),
            ReadStep::Retry,
        ]
        .into();
        server.push(script);
        let mut tls = session(&server);
        tls.connect().unwrap();

        let mut got = Vec::new();
        let mut buf = [0u8; 8];
        tls.send_request(b"GET /x", &mut buf, |_, data| {
            got.extend_from_slice(data);
            ControlFlow::Continue(())
        })
        .unwrap();
        assert_eq!(got, b"ok");
        assert_eq!(server.requests(), vec!["GET /x".to_string()]);
    }

    #[test]
    fn read_failure_disconnects() {
        let server = ScriptedServer::new();
        let mut script = ConnectionScript::from_chunks(vec![b"part".to_vec()]);
        script.reads.push_back(ReadStep::Fail("connection reset".to_string()));
        server.push(script);
        let mut tls = session(&server);
        tls.connect().unwrap();

        let mut buf = [0u8; 8];
        let result = tls.send_request(b"x", &mut buf, |_, _| ControlFlow::Continue(()));
        assert!(matches!(result, Err(OtaError::Transport(_))));
        assert_eq!(tls.state(), SessionState::Initialized);
    }

    #[test]
    fn stuck_transport_times_out() {
        let server = ScriptedServer::new();
        let mut script = ConnectionScript::from_chunks(vec![]);
        script.reads = std::iter::repeat(ReadStep::Retry).take(100_000).collect();
        server.push(script);
        let mut tls =
            TlsSession::new(server.transport(), identity(), Duration::from_millis(50)).unwrap();
        tls.connect().unwrap();

        let mut buf = [0u8; 8];
        let result = tls.send_request(b"x", &mut buf, |_, _| ControlFlow::Continue(()));
        assert!(matches!(result, Err(OtaError::Transport(_))));
    }

    #[test]
    fn refused_connection_keeps_session_initialized() {
        let server = ScriptedServer::new();
        let mut tls = session(&server);
        // No script queued: the fake refuses the TCP connection
        assert!(matches!(tls.connect(), Err(OtaError::Transport(_))));
        assert_eq!(tls.state(), SessionState::Initialized);
    }

    #[test]
    fn new_rejects_missing_identity() {
        let server = ScriptedServer::new();
        let mut id = identity();
        id.port = 0;
        assert!(TlsSession::new(server.transport(), id, Duration::from_secs(1)).is_err());
    }
}
