// esp-tls (mbedTLS) transport for the update session

use core::ffi::{c_int, c_void};
use std::ffi::CString;

use esp_idf_sys::{
    esp_tls_cfg_t, esp_tls_conn_destroy, esp_tls_conn_new_async, esp_tls_conn_read,
    esp_tls_conn_write, esp_tls_get_ssl_context, esp_tls_init, esp_tls_t,
    mbedtls_ssl_context, mbedtls_ssl_get_peer_cert, mbedtls_ssl_get_verify_result,
    MBEDTLS_ERR_SSL_PEER_CLOSE_NOTIFY, MBEDTLS_ERR_SSL_WANT_READ, MBEDTLS_ERR_SSL_WANT_WRITE,
};
use ota_core::tls::{ServerIdentity, TlsTransport, TransportStatus};
use ota_core::{OtaError, Result};

pub struct EspTlsTransport {
    /// Root CA with its NUL terminator; `cfg` points into it
    root_ca: Option<CString>,
    cfg: esp_tls_cfg_t,
    host: CString,
    port: u16,
    tls: *mut esp_tls_t,
    timeout_ms: u32,
}

// The raw handles are only touched by the thread that owns the transport
unsafe impl Send for EspTlsTransport {}

impl EspTlsTransport {
    pub fn new(timeout_ms: u32) -> Self {
        Self {
            root_ca: None,
            cfg: unsafe { core::mem::zeroed() },
            host: CString::default(),
            port: 0,
            tls: core::ptr::null_mut(),
            timeout_ms,
        }
    }

    fn ssl_context(&self) -> Option<*mut mbedtls_ssl_context> {
        if self.tls.is_null() {
            return None;
        }
        let ssl = unsafe { esp_tls_get_ssl_context(self.tls) } as *mut mbedtls_ssl_context;
        (!ssl.is_null()).then_some(ssl)
    }
}

fn io_status(n: isize) -> TransportStatus<usize> {
    if n >= 0 {
        return TransportStatus::Ready(n as usize);
    }
    match n as i32 {
        MBEDTLS_ERR_SSL_WANT_READ | MBEDTLS_ERR_SSL_WANT_WRITE => TransportStatus::Retry,
        MBEDTLS_ERR_SSL_PEER_CLOSE_NOTIFY => TransportStatus::Ready(0),
        code => TransportStatus::Failed(format!("mbedtls error -0x{:04x}", -code)),
    }
}

impl TlsTransport for EspTlsTransport {
    fn initialize(&mut self, identity: &ServerIdentity) -> Result<()> {
        let root_ca = CString::new(identity.root_ca_pem.as_bytes())
            .map_err(|_| OtaError::invalid("root CA contains a NUL byte"))?;

        let mut cfg: esp_tls_cfg_t = unsafe { core::mem::zeroed() };
        cfg.__bindgen_anon_1.cacert_pem_buf = root_ca.as_ptr() as *const u8;
        // PEM buffers are passed including the terminator
        cfg.__bindgen_anon_2.cacert_pem_bytes = root_ca.as_bytes_with_nul().len() as _;
        cfg.non_block = true;
        cfg.timeout_ms = self.timeout_ms as c_int;

        self.cfg = cfg;
        self.root_ca = Some(root_ca);
        log::debug!("TLS client configured with {} byte root CA", identity.root_ca_pem.len());
        Ok(())
    }

    fn open(&mut self, host: &str, port: u16) -> Result<()> {
        if self.root_ca.is_none() {
            return Err(OtaError::transport("TLS client not initialized"));
        }
        self.close();

        self.host = CString::new(host).map_err(|_| OtaError::invalid("host contains a NUL byte"))?;
        self.port = port;
        self.tls = unsafe { esp_tls_init() };
        if self.tls.is_null() {
            log::error!("esp_tls_init failed");
            return Err(OtaError::OutOfMemory);
        }
        Ok(())
    }

    fn handshake(&mut self) -> TransportStatus<()> {
        if self.tls.is_null() {
            return TransportStatus::Failed("not connected".into());
        }
        let host = self.host.as_bytes();
        let ret = unsafe {
            esp_tls_conn_new_async(
                self.host.as_ptr(),
                host.len() as c_int,
                c_int::from(self.port),
                &self.cfg,
                self.tls,
            )
        };
        match ret {
            1 => TransportStatus::Ready(()),
            0 => TransportStatus::Retry,
            _ => TransportStatus::Failed(format!("connection to {}:{} failed", self.host.to_string_lossy(), self.port)),
        }
    }

    fn verify_chain(&self) -> Result<()> {
        let ssl = self.ssl_context().ok_or_else(|| OtaError::transport("no TLS context"))?;
        let flags = unsafe { mbedtls_ssl_get_verify_result(ssl) };
        if flags != 0 {
            log::error!("Server certificate verification failed, flags 0x{:08x}", flags);
            return Err(OtaError::transport(format!("certificate verification failed (0x{:x})", flags)));
        }
        Ok(())
    }

    fn peer_certificate(&self) -> Option<Vec<u8>> {
        let ssl = self.ssl_context()?;
        unsafe {
            let crt = mbedtls_ssl_get_peer_cert(ssl);
            if crt.is_null() || (*crt).raw.p.is_null() {
                return None;
            }
            let raw = &(*crt).raw;
            Some(core::slice::from_raw_parts(raw.p, raw.len as usize).to_vec())
        }
    }

    fn send(&mut self, data: &[u8]) -> TransportStatus<usize> {
        if self.tls.is_null() {
            return TransportStatus::Failed("not connected".into());
        }
        let n = unsafe { esp_tls_conn_write(self.tls, data.as_ptr() as *const c_void, data.len()) };
        io_status(n as isize)
    }

    fn recv(&mut self, buf: &mut [u8]) -> TransportStatus<usize> {
        if self.tls.is_null() {
            return TransportStatus::Failed("not connected".into());
        }
        let n = unsafe { esp_tls_conn_read(self.tls, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        io_status(n as isize)
    }

    fn close(&mut self) {
        if !self.tls.is_null() {
            unsafe { esp_tls_conn_destroy(self.tls) };
            self.tls = core::ptr::null_mut();
        }
    }

    fn reset(&mut self) {
        self.close();
        self.cfg = unsafe { core::mem::zeroed() };
        self.root_ca = None;
    }
}

impl Drop for EspTlsTransport {
    fn drop(&mut self) {
        self.close();
    }
}
