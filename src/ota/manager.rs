// Partition access for the flash programmer, using the ESP-IDF OTA API

use core::ffi::c_void;
use std::ffi::{CStr, CString};

use esp_idf_sys::{
    esp_ota_abort, esp_ota_begin, esp_ota_end, esp_ota_get_boot_partition, esp_ota_handle_t,
    esp_ota_set_boot_partition, esp_ota_write, esp_partition_find_first,
    esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_ANY, esp_partition_t,
    esp_partition_type_t_ESP_PARTITION_TYPE_APP, ESP_ERR_OTA_VALIDATE_FAILED, ESP_OK,
    OTA_SIZE_UNKNOWN,
};
use ota_core::flash::{PartitionTable, PartitionWriter};
use ota_core::{OtaError, Result};

fn partition_label(partition: *const esp_partition_t) -> String {
    unsafe { CStr::from_ptr((*partition).label.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

fn find_app_partition(label: &str) -> Result<*const esp_partition_t> {
    let c_label = CString::new(label).map_err(|_| OtaError::invalid("partition label contains NUL"))?;
    let partition = unsafe {
        esp_partition_find_first(
            esp_partition_type_t_ESP_PARTITION_TYPE_APP,
            esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_ANY,
            c_label.as_ptr(),
        )
    };
    if partition.is_null() {
        log::error!("No app partition labelled '{}'", label);
        return Err(OtaError::PartitionNotFound(label.to_string()));
    }
    Ok(partition)
}

/// App partitions of the running device
#[derive(Debug, Default)]
pub struct EspPartitions;

impl PartitionTable for EspPartitions {
    type Writer = EspOtaWriter;

    fn boot_partition(&self) -> Result<String> {
        let partition = unsafe { esp_ota_get_boot_partition() };
        if partition.is_null() {
            return Err(OtaError::PartitionNotFound("boot".into()));
        }
        Ok(partition_label(partition))
    }

    fn open_writer(&mut self, label: &str) -> Result<EspOtaWriter> {
        let partition = find_app_partition(label)?;
        let mut handle: esp_ota_handle_t = 0;

        // Erases the whole partition up front
        let result = unsafe { esp_ota_begin(partition, OTA_SIZE_UNKNOWN as _, &mut handle) };
        if result != ESP_OK {
            log::error!("esp_ota_begin on '{}' failed: {}", label, result);
            return Err(OtaError::StorageWrite(format!("esp_ota_begin failed ({})", result)));
        }

        Ok(EspOtaWriter { handle, label: label.to_string() })
    }

    fn set_boot_partition(&mut self, label: &str) -> Result<()> {
        let partition = find_app_partition(label)?;
        let result = unsafe { esp_ota_set_boot_partition(partition) };
        if result != ESP_OK {
            return Err(OtaError::StorageWrite(format!(
                "esp_ota_set_boot_partition('{}') failed ({})",
                label, result
            )));
        }
        Ok(())
    }
}

/// Open `esp_ota_*` handle on one partition
pub struct EspOtaWriter {
    handle: esp_ota_handle_t,
    label: String,
}

impl PartitionWriter for EspOtaWriter {
    fn write(&mut self, data: &[u8]) -> Result<()> {
        let result = unsafe { esp_ota_write(self.handle, data.as_ptr() as *const c_void, data.len()) };
        if result != ESP_OK {
            return Err(OtaError::StorageWrite(format!(
                "esp_ota_write to '{}' failed ({})",
                self.label, result
            )));
        }
        Ok(())
    }

    fn finish(self) -> Result<()> {
        let result = unsafe { esp_ota_end(self.handle) };
        if result == ESP_ERR_OTA_VALIDATE_FAILED as i32 {
            return Err(OtaError::StorageWrite(format!("image in '{}' failed validation", self.label)));
        } else if result != ESP_OK {
            return Err(OtaError::StorageWrite(format!("esp_ota_end failed ({})", result)));
        }
        Ok(())
    }

    fn discard(self) {
        let result = unsafe { esp_ota_abort(self.handle) };
        if result != ESP_OK {
            log::warn!("esp_ota_abort on '{}' returned {}", self.label, result);
        }
    }
}
