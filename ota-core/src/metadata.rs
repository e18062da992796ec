//! The metadata file published next to the firmware images.
//!
//! ```text
//! VERSION=2
//! FILE=/fw/v2.bin
//! INTERVAL=60
//! ```
//!
//! One `KEY=value` per line, order does not matter, unknown keys are ignored.

use core::fmt::Write as _;

pub const KEY_VERSION: &str = "VERSION";
pub const KEY_FILE: &str = "FILE";
pub const KEY_INTERVAL: &str = "INTERVAL";

/// Longest firmware path accepted from the server
pub const MAX_FILE_PATH: usize = 256;

pub type FilePath = heapless::String<MAX_FILE_PATH>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    pub interval_seconds: Option<u32>,
    pub version: Option<u32>,
    pub file: Option<FilePath>,
}

/// Leading decimal digits of `value`, like atoi without the sign
fn leading_number(value: &str) -> Option<u32> {
    let digits: &str = {
        let value = value.trim_start();
        let end = value.find(|c: char| !c.is_ascii_digit()).unwrap_or(value.len());
        &value[..end]
    };
    digits.parse().ok()
}

impl Metadata {
    pub fn parse(body: &[u8]) -> Self {
        let text = String::from_utf8_lossy(body);
        let mut metadata = Metadata::default();

        for line in text.lines() {
            let Some((key, value)) = line.trim().split_once('=') else {
                continue;
            };
            match key.trim() {
                KEY_INTERVAL => metadata.interval_seconds = leading_number(value),
                KEY_VERSION => metadata.version = leading_number(value),
                KEY_FILE => {
                    let value = value.trim();
                    if value.is_empty() {
                        continue;
                    }
                    let mut path = FilePath::new();
                    if path.push_str(value).is_ok() {
                        metadata.file = Some(path);
                    } else {
                        log::warn!("FILE= entry longer than {} bytes ignored", MAX_FILE_PATH);
                    }
                }
                _ => {}
            }
        }
        metadata
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(version) = self.version {
            let _ = writeln!(out, "{}={}", KEY_VERSION, version);
        }
        if let Some(file) = &self.file {
            let _ = writeln!(out, "{}={}", KEY_FILE, file);
        }
        if let Some(interval) = self.interval_seconds {
            let _ = writeln!(out, "{}={}", KEY_INTERVAL, interval);
        }
        out
    }
}
