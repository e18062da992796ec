//! Certificate material handling for public key pinning.
//!
//! Pinning compares the DER encoded SubjectPublicKeyInfo of the peer
//! certificate with the one of the configured certificate. Only the key is
//! compared, so a re-issued certificate that keeps the key stays accepted.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha2::{Digest, Sha256};

use crate::error::{OtaError, Result};

const TAG_SEQUENCE: u8 = 0x30;
const TAG_VERSION: u8 = 0xA0;

/// Decode the first PEM block of `pem`, returning its label and DER bytes
pub fn pem_to_der(pem: &str) -> Result<(String, Vec<u8>)> {
    let begin = pem
        .find("-----BEGIN ")
        .ok_or_else(|| OtaError::invalid("PEM begin marker missing"))?;
    let rest = &pem[begin + "-----BEGIN ".len()..];
    let label_end = rest
        .find("-----")
        .ok_or_else(|| OtaError::invalid("PEM label not terminated"))?;
    let label = rest[..label_end].to_string();
    let body = &rest[label_end + 5..];

    let end_marker = format!("-----END {}-----", label);
    let end = body
        .find(&end_marker)
        .ok_or_else(|| OtaError::invalid(format!("PEM end marker for '{}' missing", label)))?;

    let encoded: String = body[..end].chars().filter(|c| !c.is_whitespace()).collect();
    let der = STANDARD
        .decode(encoded.as_bytes())
        .map_err(|e| OtaError::invalid(format!("PEM body is not valid base64: {}", e)))?;
    Ok((label, der))
}

struct Tlv<'a> {
    tag: u8,
    value: &'a [u8],
    raw: &'a [u8],
}

struct DerReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> DerReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read(&mut self) -> Result<Tlv<'a>> {
        let start = self.pos;
        let tag = *self
            .data
            .get(self.pos)
            .ok_or_else(|| OtaError::invalid("DER truncated before tag"))?;
        let first = *self
            .data
            .get(self.pos + 1)
            .ok_or_else(|| OtaError::invalid("DER truncated before length"))?;
        self.pos += 2;

        let len = if first < 0x80 {
            first as usize
        } else {
            let count = (first & 0x7f) as usize;
            if count == 0 || count > 4 {
                return Err(OtaError::invalid("unsupported DER length encoding"));
            }
            let bytes = self
                .data
                .get(self.pos..self.pos + count)
                .ok_or_else(|| OtaError::invalid("DER truncated in length"))?;
            self.pos += count;
            bytes.iter().fold(0usize, |acc, b| (acc << 8) | *b as usize)
        };

        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| OtaError::invalid("DER element exceeds input"))?;
        let value = &self.data[self.pos..end];
        self.pos = end;
        Ok(Tlv { tag, value, raw: &self.data[start..end] })
    }

    fn expect(&mut self, tag: u8, what: &str) -> Result<Tlv<'a>> {
        let tlv = self.read()?;
        if tlv.tag != tag {
            return Err(OtaError::invalid(format!(
                "{}: expected DER tag 0x{:02x}, found 0x{:02x}",
                what, tag, tlv.tag
            )));
        }
        Ok(tlv)
    }

    fn peek_tag(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }
}

/// Locate the SubjectPublicKeyInfo inside a DER X.509 certificate
pub fn subject_public_key_info(cert_der: &[u8]) -> Result<&[u8]> {
    let certificate = DerReader::new(cert_der).expect(TAG_SEQUENCE, "certificate")?;
    let tbs = DerReader::new(certificate.value).expect(TAG_SEQUENCE, "tbsCertificate")?;

    let mut fields = DerReader::new(tbs.value);
    if fields.peek_tag() == Some(TAG_VERSION) {
        fields.read()?;
    }
    fields.read()?; // serialNumber
    fields.expect(TAG_SEQUENCE, "signature")?;
    fields.expect(TAG_SEQUENCE, "issuer")?;
    fields.expect(TAG_SEQUENCE, "validity")?;
    fields.expect(TAG_SEQUENCE, "subject")?;
    let spki = fields.expect(TAG_SEQUENCE, "subjectPublicKeyInfo")?;
    Ok(spki.raw)
}

/// The public key a peer has to present for the connection to be trusted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinnedKey {
    der: Vec<u8>,
}

impl PinnedKey {
    /// Accepts a CERTIFICATE or a PUBLIC KEY PEM block
    pub fn from_pem(pem: &str) -> Result<Self> {
        let (label, der) = pem_to_der(pem)?;
        match label.as_str() {
            "CERTIFICATE" => Self::from_certificate_der(&der),
            "PUBLIC KEY" => {
                // Validates the outer structure
                DerReader::new(&der).expect(TAG_SEQUENCE, "public key")?;
                Ok(Self { der })
            }
            other => Err(OtaError::invalid(format!("unsupported PEM block '{}'", other))),
        }
    }

    pub fn from_certificate_der(cert_der: &[u8]) -> Result<Self> {
        let spki = subject_public_key_info(cert_der)?;
        Ok(Self { der: spki.to_vec() })
    }

    pub fn as_der(&self) -> &[u8] {
        &self.der
    }

    /// Compare against the certificate presented by the peer.
    /// Length and content must both match.
    pub fn verify_peer(&self, peer_cert_der: &[u8]) -> Result<()> {
        let actual = subject_public_key_info(peer_cert_der)?;
        if actual.len() == self.der.len() && actual == self.der.as_slice() {
            return Ok(());
        }

        log::error!("Actual public key differs from the pinned public key!");
        log::error!("EXPECTED public key ({} bytes):", self.der.len());
        for line in hex_dump(&self.der) {
            log::error!("{}", line);
        }
        log::error!("ACTUAL   public key ({} bytes):", actual.len());
        for line in hex_dump(actual) {
            log::error!("{}", line);
        }

        Err(OtaError::CertificatePinningMismatch {
            expected_len: self.der.len(),
            actual_len: actual.len(),
        })
    }

    pub fn fingerprint(&self) -> String {
        sha256_hex(&self.der)
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    to_hex(&Sha256::digest(bytes))
}

pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// 16 bytes per line followed by the printable ASCII column
pub fn hex_dump(bytes: &[u8]) -> Vec<String> {
    bytes
        .chunks(16)
        .map(|chunk| {
            let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
            let ascii: String = chunk
                .iter()
                .map(|&b| if (32..127).contains(&b) { b as char } else { '.' })
                .collect();
            format!("{:<47}  {}", hex.join(" "), ascii)
        })
        .collect()
}
