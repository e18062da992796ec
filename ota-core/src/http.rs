//! Minimal HTTP/1.1 GET client over a [`TlsSession`].
//!
//! The response parser works on a caller supplied buffer and is fed one
//! transport chunk at a time. Headers are accumulated until the blank line,
//! the status line and Content-Length are validated, and the body is either
//! collected completely or handed out fragment by fragment.

use crate::error::{OtaError, ProtocolError, Result};
use crate::tls::{Exchange, TlsSession, TlsTransport};

/// Size of one read from the TLS layer
pub const TLS_CHUNK_SIZE: usize = 4096;

const HEADER_END: &[u8] = b"\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub host: String,
    pub path: String,
}

impl HttpRequest {
    pub fn new(method: Method, host: &str, path: &str) -> Result<Self> {
        if host.is_empty() {
            return Err(OtaError::invalid("HTTP request: host missing"));
        }
        if path.is_empty() {
            return Err(OtaError::invalid("HTTP request: path missing"));
        }
        Ok(Self { method, host: host.to_string(), path: path.to_string() })
    }

    pub fn get(host: &str, path: &str) -> Result<Self> {
        Self::new(Method::Get, host, path)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        format!("{} {} HTTP/1.1\r\nHost: {}\r\n\r\n", self.method.as_str(), self.path, self.host)
            .into_bytes()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    /// Deliver the body once, after all Content-Length bytes arrived
    WaitForCompleteBody,
    /// Deliver body bytes as they arrive
    StreamBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHead {
    pub version_major: u32,
    pub version_minor: u32,
    pub status: u16,
    pub content_length: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    ParsingHeaders,
    ParsingBody,
}

/// Outcome of feeding one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feed {
    NeedMore,
    /// Body bytes are available at the front of the buffer
    Body(usize),
}

#[derive(Debug)]
pub struct ResponseParser {
    mode: ResponseMode,
    phase: Phase,
    head: Option<ResponseHead>,
    /// Bytes currently held at the front of the buffer
    buffered: usize,
    /// Body bytes received so far, including drained fragments
    body_received: usize,
}

impl ResponseParser {
    pub fn new(mode: ResponseMode) -> Self {
        Self { mode, phase: Phase::ParsingHeaders, head: None, buffered: 0, body_received: 0 }
    }

    fn reset(&mut self) {
        self.phase = Phase::ParsingHeaders;
        self.head = None;
        self.buffered = 0;
        self.body_received = 0;
    }

    pub fn head(&self) -> Option<&ResponseHead> {
        self.head.as_ref()
    }

    pub fn headers_complete(&self) -> bool {
        self.phase == Phase::ParsingBody
    }

    pub fn body_received(&self) -> usize {
        self.body_received
    }

    pub fn body_complete(&self) -> bool {
        match &self.head {
            Some(head) => self.body_received >= head.content_length,
            None => false,
        }
    }

    /// Forget delivered body bytes so the buffer can take the next chunk
    pub fn drain(&mut self) {
        self.buffered = 0;
    }

    /// Append `chunk` to `buf` and advance the parse. Chunk index 0 starts a
    /// new response and clears all previous state.
    pub fn feed(
        &mut self,
        index: usize,
        chunk: &[u8],
        buf: &mut [u8],
    ) -> core::result::Result<Feed, ProtocolError> {
        if index == 0 {
            self.reset();
            buf.fill(0);
        }

        let required = self.buffered + chunk.len();
        if required > buf.len() {
            return Err(ProtocolError::BufferTooSmall { capacity: buf.len(), required });
        }
        buf[self.buffered..required].copy_from_slice(chunk);
        self.buffered = required;

        if self.phase == Phase::ParsingHeaders {
            let end = match find(&buf[..self.buffered], HEADER_END) {
                Some(end) => end,
                None => return Ok(Feed::NeedMore),
            };

            let head = parse_head(&buf[..end])?;
            log::debug!(
                "HTTP/{}.{} {}, Content-Length: {}",
                head.version_major,
                head.version_minor,
                head.status,
                head.content_length
            );

            // Move whatever body bytes came with the headers to the front
            let header_len = end + HEADER_END.len();
            buf.copy_within(header_len..self.buffered, 0);
            self.buffered -= header_len;
            self.body_received = self.buffered;
            self.head = Some(head);
            self.phase = Phase::ParsingBody;
        } else {
            self.body_received += chunk.len();
        }

        let content_length = self.head.map(|h| h.content_length).unwrap_or(0);
        let ready = match self.mode {
            ResponseMode::WaitForCompleteBody => self.buffered >= content_length,
            ResponseMode::StreamBody => self.buffered > 0,
        };
        if ready {
            Ok(Feed::Body(self.buffered))
        } else {
            Ok(Feed::NeedMore)
        }
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn parse_head(header: &[u8]) -> core::result::Result<ResponseHead, ProtocolError> {
    let text = String::from_utf8_lossy(header);
    let mut lines = text.split("\r\n");

    let status_line = lines.next().unwrap_or_default();
    let (version_major, version_minor, status) = parse_status_line(status_line)?;
    if version_major != 1 {
        return Err(ProtocolError::VersionNotSupported(version_major));
    }
    if status != 200 {
        return Err(ProtocolError::NonOkStatus(status));
    }

    let content_length = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .ok_or(ProtocolError::MissingContentLength)?;

    Ok(ResponseHead { version_major, version_minor, status, content_length })
}

/// `HTTP/<major>.<minor> <code>`, anything after the code is ignored
fn parse_status_line(line: &str) -> core::result::Result<(u32, u32, u16), ProtocolError> {
    let rest = line.strip_prefix("HTTP/").ok_or(ProtocolError::InvalidStatusLine)?;
    let mut tokens = rest.split_whitespace();
    let version = tokens.next().ok_or(ProtocolError::InvalidStatusLine)?;
    let code = tokens.next().ok_or(ProtocolError::InvalidStatusLine)?;

    let (major, minor) = version.split_once('.').ok_or(ProtocolError::InvalidStatusLine)?;
    let major = major.parse().map_err(|_| ProtocolError::InvalidStatusLine)?;
    let minor = minor.parse().map_err(|_| ProtocolError::InvalidStatusLine)?;
    let code = code.parse().map_err(|_| ProtocolError::InvalidStatusLine)?;
    Ok((major, minor, code))
}

/// Log a failed request the way operators expect to read it
pub fn log_request_error(request_id: u32, request: &HttpRequest, error: &OtaError) {
    match error {
        OtaError::Protocol(ProtocolError::NonOkStatus(401)) => {
            log::error!("Request {}: authentication with server failed (401) for '{}'", request_id, request.path)
        }
        OtaError::Protocol(ProtocolError::NonOkStatus(403)) => {
            log::error!("Request {}: access to '{}' forbidden (403)", request_id, request.path)
        }
        OtaError::Protocol(ProtocolError::NonOkStatus(404)) => {
            log::error!("Request {}: file '{}' not found on server (404)", request_id, request.path)
        }
        other => log::error!(
            "Request {}: GET '{}' from '{}' failed [{}]: {}",
            request_id,
            request.path,
            request.host,
            other.as_str(),
            other
        ),
    }
}

pub struct HttpClient {
    rx: Vec<u8>,
    next_request_id: u32,
}

impl HttpClient {
    pub fn new() -> Self {
        Self { rx: vec![0; TLS_CHUNK_SIZE], next_request_id: 1 }
    }

    fn next_id(&mut self) -> u32 {
        let id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1).max(1);
        id
    }

    /// GET `request` and return the complete body stored at the front of `buf`
    pub fn get_complete<'b, T: TlsTransport>(
        &mut self,
        session: &mut TlsSession<T>,
        request: &HttpRequest,
        buf: &'b mut [u8],
    ) -> Result<&'b [u8]> {
        let id = self.next_id();
        log::info!("Request {}: GET https://{}{}", id, request.host, request.path);

        match Self::collect_body(session, &mut self.rx, request, buf) {
            Ok(len) => {
                log::debug!("Request {}: {} body bytes", id, len);
                let body: &'b [u8] = buf;
                Ok(&body[..len])
            }
            Err(e) => {
                log_request_error(id, request, &e);
                Err(e)
            }
        }
    }

    fn collect_body<T: TlsTransport>(
        session: &mut TlsSession<T>,
        rx: &mut [u8],
        request: &HttpRequest,
        buf: &mut [u8],
    ) -> Result<usize> {
        session.connect()?;
        let mut exchange = session.exchange(&request.to_bytes())?;
        let mut parser = ResponseParser::new(ResponseMode::WaitForCompleteBody);

        while let Some(chunk) = exchange.read_chunk(rx)? {
            match parser.feed(chunk.index, &rx[..chunk.len], buf)? {
                Feed::NeedMore => {}
                Feed::Body(len) => {
                    exchange.finish();
                    let content_length = parser.head().map(|h| h.content_length).unwrap_or(len);
                    return Ok(len.min(content_length));
                }
            }
        }
        Err(closed_early(&parser))
    }

    /// GET `request` and stream its body through `buf`
    pub fn get_streaming<'a, T: TlsTransport>(
        &'a mut self,
        session: &'a mut TlsSession<T>,
        request: &HttpRequest,
        buf: &'a mut [u8],
    ) -> Result<BodyStream<'a, T>> {
        let id = self.next_id();
        log::info!("Request {}: GET https://{}{} (streaming)", id, request.host, request.path);

        let started = match session.connect() {
            Ok(()) => session.exchange(&request.to_bytes()),
            Err(e) => Err(e),
        };
        match started {
            Ok(exchange) => Ok(BodyStream {
                exchange,
                parser: ResponseParser::new(ResponseMode::StreamBody),
                rx: &mut self.rx[..],
                buf,
                request: request.clone(),
                request_id: id,
                delivered: false,
            }),
            Err(e) => {
                log_request_error(id, request, &e);
                Err(e)
            }
        }
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new()
    }
}

fn closed_early(parser: &ResponseParser) -> OtaError {
    match parser.head() {
        Some(head) => ProtocolError::TruncatedBody {
            expected: head.content_length,
            received: parser.body_received(),
        }
        .into(),
        None => OtaError::transport("connection closed before response headers were complete"),
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Fragment<'a> {
    Data(&'a [u8]),
    /// All Content-Length bytes were delivered
    End,
}

/// Body of a streaming response
pub struct BodyStream<'a, T: TlsTransport> {
    exchange: Exchange<'a, T>,
    parser: ResponseParser,
    rx: &'a mut [u8],
    buf: &'a mut [u8],
    request: HttpRequest,
    request_id: u32,
    /// A Data fragment is still sitting in `buf`
    delivered: bool,
}

impl<'a, T: TlsTransport> BodyStream<'a, T> {
    /// Next fragment of the body. `Ok(None)` means the connection closed
    /// without any body bytes left to report.
    pub fn next_fragment(&mut self) -> Result<Option<Fragment<'_>>> {
        if self.delivered {
            self.delivered = false;
            if self.parser.body_complete() {
                self.exchange.finish();
                return Ok(Some(Fragment::End));
            }
            self.parser.drain();
        }

        loop {
            let chunk = match self.exchange.read_chunk(self.rx) {
                Ok(Some(chunk)) => chunk,
                Ok(None) => {
                    if self.parser.headers_complete() && self.parser.body_complete() {
                        return Ok(None);
                    }
                    let e = closed_early(&self.parser);
                    log_request_error(self.request_id, &self.request, &e);
                    return Err(e);
                }
                Err(e) => {
                    log_request_error(self.request_id, &self.request, &e);
                    return Err(e);
                }
            };

            match self.parser.feed(chunk.index, &self.rx[..chunk.len], self.buf) {
                Ok(Feed::NeedMore) => {
                    // A zero length body is complete as soon as the headers are
                    if self.parser.headers_complete() && self.parser.body_complete() {
                        self.exchange.finish();
                        return Ok(Some(Fragment::End));
                    }
                }
                Ok(Feed::Body(len)) => {
                    self.delivered = true;
                    return Ok(Some(Fragment::Data(&self.buf[..len])));
                }
                Err(e) => {
                    self.exchange.finish();
                    let e = OtaError::from(e);
                    log_request_error(self.request_id, &self.request, &e);
                    return Err(e);
                }
            }
        }
    }
}
