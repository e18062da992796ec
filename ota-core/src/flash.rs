//! Page buffered programming of the inactive firmware slot.
//!
//! Bytes are staged in a 4 KiB page buffer and written to the target
//! partition whenever the page is full. `commit` writes the last partial
//! page, validates the image and only then switches the boot partition.

use sha2::{Digest, Sha256};

use crate::cert::to_hex;
use crate::error::{OtaError, Result, SessionStateError};

pub const PAGE_SIZE: usize = 4096;

pub const FACTORY_LABEL: &str = "factory";

/// Sequential write handle on one partition (esp_ota_begin .. esp_ota_end)
pub trait PartitionWriter {
    /// Append `data` at the current write offset
    fn write(&mut self, data: &[u8]) -> Result<()>;
    /// Close the handle and validate the written image
    fn finish(self) -> Result<()>
    where
        Self: Sized;
    /// Close the handle without validation or activation
    fn discard(self)
    where
        Self: Sized;
}

/// Named, erasable firmware partitions plus the boot selection
pub trait PartitionTable {
    type Writer: PartitionWriter;

    /// Label of the partition the device booted from
    fn boot_partition(&self) -> Result<String>;
    /// Erase `label` and open a writer at its start
    fn open_writer(&mut self, label: &str) -> Result<Self::Writer>;
    fn set_boot_partition(&mut self, label: &str) -> Result<()>;
}

/// Picks the partition to program given the one currently booted
pub trait SlotRotation {
    fn next_slot(&self, current: &str) -> Result<String>;
}

/// factory -> first slot, then round robin over the OTA slots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotRing {
    factory: String,
    slots: Vec<String>,
}

impl SlotRing {
    pub fn new(factory: &str, slots: &[&str]) -> Result<Self> {
        if slots.len() < 2 {
            return Err(OtaError::invalid("slot ring needs at least two OTA slots"));
        }
        Ok(Self {
            factory: factory.to_string(),
            slots: slots.iter().map(|s| s.to_string()).collect(),
        })
    }

    /// factory -> ota_0, ota_0 -> ota_1, ota_1 -> ota_0
    pub fn esp_default() -> Self {
        Self {
            factory: FACTORY_LABEL.to_string(),
            slots: vec!["ota_0".to_string(), "ota_1".to_string()],
        }
    }
}

impl SlotRotation for SlotRing {
    fn next_slot(&self, current: &str) -> Result<String> {
        if current == self.factory {
            return Ok(self.slots[0].clone());
        }
        match self.slots.iter().position(|s| s == current) {
            Some(i) => Ok(self.slots[(i + 1) % self.slots.len()].clone()),
            None => Err(OtaError::PartitionNotFound(format!(
                "no update slot follows boot partition '{}'",
                current
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitReport {
    pub partition: String,
    pub bytes: usize,
    /// SHA-256 of the bytes written, lowercase hex
    pub sha256: String,
}

struct ProgramSession<W> {
    writer: W,
    partition: String,
    page: Vec<u8>,
    /// Next byte offset in the partition
    cursor: usize,
    hasher: Sha256,
}

impl<W: PartitionWriter> ProgramSession<W> {
    fn flush(&mut self) -> Result<()> {
        if self.page.is_empty() {
            return Ok(());
        }
        log::debug!(
            "Writing {} bytes to '{}' at offset 0x{:08x}",
            self.page.len(),
            self.partition,
            self.cursor
        );
        self.writer.write(&self.page)?;
        self.hasher.update(&self.page);
        self.cursor += self.page.len();
        self.page.clear();
        Ok(())
    }
}

pub struct FlashProgrammer<P: PartitionTable, R: SlotRotation = SlotRing> {
    table: P,
    rotation: R,
    session: Option<ProgramSession<P::Writer>>,
}

impl<P: PartitionTable> FlashProgrammer<P, SlotRing> {
    pub fn with_default_slots(table: P) -> Self {
        Self::new(table, SlotRing::esp_default())
    }
}

impl<P: PartitionTable, R: SlotRotation> FlashProgrammer<P, R> {
    pub fn new(table: P, rotation: R) -> Self {
        Self { table, rotation, session: None }
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    pub fn begin(&mut self) -> Result<()> {
        if self.session.is_some() {
            log::error!("Flash programming session already open");
            return Err(SessionStateError::AlreadyOpen.into());
        }

        let running = self.table.boot_partition()?;
        let target = self.rotation.next_slot(&running)?;

        let mut page = Vec::new();
        page.try_reserve_exact(PAGE_SIZE).map_err(|_| {
            log::error!("Failed to allocate {} byte page buffer", PAGE_SIZE);
            OtaError::OutOfMemory
        })?;

        let writer = self.table.open_writer(&target)?;
        log::info!("Programming session opened: running from '{}', writing '{}'", running, target);

        self.session = Some(ProgramSession {
            writer,
            partition: target,
            page,
            cursor: 0,
            hasher: Sha256::new(),
        });
        Ok(())
    }

    /// Stage `data`, flushing every time the page fills up. A failed flush
    /// leaves the session open; the caller has to `abort`.
    pub fn write(&mut self, mut data: &[u8]) -> Result<()> {
        let session = self.session.as_mut().ok_or(SessionStateError::NotOpen)?;

        while !data.is_empty() {
            let room = PAGE_SIZE - session.page.len();
            let (head, tail) = data.split_at(room.min(data.len()));
            session.page.extend_from_slice(head);
            data = tail;

            if session.page.len() == PAGE_SIZE {
                session.flush()?;
            }
        }
        Ok(())
    }

    /// Write the last partial page, validate the image and boot from it next.
    /// On any failure the session is closed and the boot partition is untouched.
    pub fn commit(&mut self) -> Result<CommitReport> {
        let mut session = self.session.take().ok_or(SessionStateError::NotOpen)?;

        if let Err(e) = session.flush() {
            log::error!("Final page write failed: {}", e);
            session.writer.discard();
            return Err(e);
        }

        let ProgramSession { writer, partition, cursor, hasher, .. } = session;
        if let Err(e) = writer.finish() {
            log::error!("Image in '{}' failed validation: {}", partition, e);
            return Err(e);
        }
        if let Err(e) = self.table.set_boot_partition(&partition) {
            log::error!("Failed to select '{}' as boot partition: {}", partition, e);
            return Err(e);
        }

        let report = CommitReport { partition, bytes: cursor, sha256: to_hex(&hasher.finalize()) };
        log::info!(
            "Programming session committed: {} bytes to '{}' (sha256 {})",
            report.bytes,
            report.partition,
            report.sha256
        );
        Ok(report)
    }

    /// Drop the session without activating anything. Staged bytes are discarded.
    pub fn abort(&mut self) -> Result<()> {
        let session = self.session.take().ok_or(SessionStateError::NotOpen)?;
        log::info!(
            "Programming session aborted after {} bytes to '{}'",
            session.cursor + session.page.len(),
            session.partition
        );
        session.writer.discard();
        Ok(())
    }
}
