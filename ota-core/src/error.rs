// Error taxonomy shared by the TLS, HTTP, flash and orchestrator layers

use core::fmt;

pub type Result<T> = core::result::Result<T, OtaError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtaError {
    /// Malformed caller input (empty host, bad path, invalid PEM, ...)
    InvalidArgument(String),
    OutOfMemory,
    /// Connect, handshake or I/O failure on the transport
    Transport(String),
    /// Peer public key differs from the pinned key
    CertificatePinningMismatch { expected_len: usize, actual_len: usize },
    Protocol(ProtocolError),
    SessionState(SessionStateError),
    StorageWrite(String),
    PartitionNotFound(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolError {
    InvalidStatusLine,
    VersionNotSupported(u32),
    /// Payload is the status code the server sent
    NonOkStatus(u16),
    BufferTooSmall { capacity: usize, required: usize },
    MissingContentLength,
    TruncatedBody { expected: usize, received: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStateError {
    AlreadyOpen,
    NotOpen,
    NotConnected,
}

impl OtaError {
    pub fn invalid(message: impl Into<String>) -> Self {
        OtaError::InvalidArgument(message.into())
    }

    pub fn transport(message: impl Into<String>) -> Self {
        OtaError::Transport(message.into())
    }

    /// Short stable code used in log lines
    pub fn as_str(&self) -> &'static str {
        match self {
            OtaError::InvalidArgument(_) => "INVALID_ARGUMENT",
            OtaError::OutOfMemory => "OUT_OF_MEMORY",
            OtaError::Transport(_) => "TRANSPORT",
            OtaError::CertificatePinningMismatch { .. } => "PINNING_MISMATCH",
            OtaError::Protocol(_) => "PROTOCOL",
            OtaError::SessionState(_) => "SESSION_STATE",
            OtaError::StorageWrite(_) => "STORAGE_WRITE",
            OtaError::PartitionNotFound(_) => "PARTITION_NOT_FOUND",
        }
    }
}

impl fmt::Display for OtaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OtaError::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            OtaError::OutOfMemory => write!(f, "out of memory"),
            OtaError::Transport(msg) => write!(f, "transport error: {}", msg),
            OtaError::CertificatePinningMismatch { expected_len, actual_len } => write!(
                f,
                "certificate pinning mismatch (expected {} byte key, got {} bytes)",
                expected_len, actual_len
            ),
            OtaError::Protocol(e) => write!(f, "protocol error: {}", e),
            OtaError::SessionState(e) => write!(f, "session state error: {}", e),
            OtaError::StorageWrite(msg) => write!(f, "storage write failed: {}", msg),
            OtaError::PartitionNotFound(label) => write!(f, "partition not found: {}", label),
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::InvalidStatusLine => write!(f, "invalid HTTP status line"),
            ProtocolError::VersionNotSupported(major) => {
                write!(f, "HTTP major version {} not supported", major)
            }
            ProtocolError::NonOkStatus(code) => write!(f, "non-200 status code {}", code),
            ProtocolError::BufferTooSmall { capacity, required } => write!(
                f,
                "response buffer too small ({} bytes, {} required)",
                capacity, required
            ),
            ProtocolError::MissingContentLength => write!(f, "Content-Length header missing"),
            ProtocolError::TruncatedBody { expected, received } => write!(
                f,
                "connection closed after {} of {} body bytes",
                received, expected
            ),
        }
    }
}

impl fmt::Display for SessionStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SessionStateError::AlreadyOpen => "session already open",
            SessionStateError::NotOpen => "no open session",
            SessionStateError::NotConnected => "not connected",
        };
        f.write_str(text)
    }
}

impl std::error::Error for OtaError {}
impl std::error::Error for ProtocolError {}
impl std::error::Error for SessionStateError {}

impl From<ProtocolError> for OtaError {
    fn from(e: ProtocolError) -> Self {
        OtaError::Protocol(e)
    }
}

impl From<SessionStateError> for OtaError {
    fn from(e: SessionStateError) -> Self {
        OtaError::SessionState(e)
    }
}
