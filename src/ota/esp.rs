// ESP-IDF backed flash sink and restart, using the OTA partition API

use core::ffi::c_void;
use esp_idf_hal::delay::FreeRtos;
use esp_idf_sys::{
    esp, esp_ota_abort, esp_ota_begin, esp_ota_end, esp_ota_get_next_update_partition,
    esp_ota_handle_t, esp_ota_set_boot_partition, esp_ota_write, esp_partition_t, esp_restart,
    EspError, OTA_SIZE_UNKNOWN,
};
use std::time::Duration;

use super::controller::Restart;
use super::flash::{FlashError, FlashWriteSink};

fn flash_error(op: &str, err: EspError) -> FlashError {
    FlashError::new(format!("{} failed: {}", op, err))
}

/// Writes into the next OTA app partition.
pub struct EspFlashSink {
    partition: *const esp_partition_t,
    handle: Option<esp_ota_handle_t>,
}

// The partition pointer refers to the static partition table and the handle
// is a plain integer id, so moving the sink across tasks is sound.
unsafe impl Send for EspFlashSink {}

impl EspFlashSink {
    pub fn new() -> Self {
        Self {
            partition: core::ptr::null(),
            handle: None,
        }
    }
}

impl Default for EspFlashSink {
    fn default() -> Self {
        Self::new()
    }
}

impl FlashWriteSink for EspFlashSink {
    fn begin(&mut self, size: Option<usize>) -> Result<(), FlashError> {
        self.abort();

        let partition = unsafe { esp_ota_get_next_update_partition(core::ptr::null()) };
        if partition.is_null() {
            return Err(FlashError::new("no OTA update partition"));
        }

        let image_size = size.unwrap_or(OTA_SIZE_UNKNOWN as usize);
        let mut handle: esp_ota_handle_t = 0;
        unsafe { esp!(esp_ota_begin(partition, image_size as _, &mut handle)) }
            .map_err(|e| flash_error("esp_ota_begin", e))?;

        self.partition = partition;
        self.handle = Some(handle);
        Ok(())
    }

    fn write(&mut self, chunk: &[u8]) -> Result<usize, FlashError> {
        let handle = self
            .handle
            .ok_or_else(|| FlashError::new("write without begin"))?;

        unsafe { esp!(esp_ota_write(handle, chunk.as_ptr() as *const c_void, chunk.len() as _)) }
            .map_err(|e| flash_error("esp_ota_write", e))?;
        Ok(chunk.len())
    }

    fn abort(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(e) = unsafe { esp!(esp_ota_abort(handle)) } {
                log::warn!("OTA: esp_ota_abort failed: {}", e);
            }
        }
    }

    fn commit(&mut self) -> Result<(), FlashError> {
        let handle = self
            .handle
            .take()
            .ok_or_else(|| FlashError::new("commit without begin"))?;

        // esp_ota_end releases the handle even when image validation fails
        unsafe { esp!(esp_ota_end(handle)) }.map_err(|e| flash_error("esp_ota_end", e))?;
        unsafe { esp!(esp_ota_set_boot_partition(self.partition)) }
            .map_err(|e| flash_error("esp_ota_set_boot_partition", e))?;
        Ok(())
    }
}

impl Drop for EspFlashSink {
    fn drop(&mut self) {
        self.abort();
    }
}

/// Restarts the chip after letting pending responses drain.
pub struct EspRestart {
    delay: Duration,
}

impl EspRestart {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Restart for EspRestart {
    fn restart(&self) {
        FreeRtos::delay_ms(self.delay.as_millis().min(u32::MAX as u128) as u32);
        unsafe { esp_restart() };
    }
}
