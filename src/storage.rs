// SD card mounted over SPI as a FAT volume
//
// Staged images, the live config and the backup directory all live here,
// so the card is mounted before the config is read.

use anyhow::{Context, Result};
use esp_idf_hal::spi::SpiDriver;
use esp_idf_sys::*;
use std::ffi::CString;

const HOST_FLAG_SPI: u32 = 1 << 3;
const HOST_FLAG_DEINIT_ARG: u32 = 1 << 5;
const SD_FREQUENCY_KHZ: i32 = 20_000;
const ALLOCATION_UNIT: usize = 16 * 1024;

pub struct SdCard {
    card: *mut sdmmc_card_t,
    base_path: CString,
    // The bus must outlive the mounted card
    _spi: SpiDriver<'static>,
}

// The card handle is only touched again on drop
unsafe impl Send for SdCard {}

impl SdCard {
    /// Mount the card on `spi` at `base_path` (for example "/sd").
    pub fn mount(spi: SpiDriver<'static>, cs_gpio: i32, base_path: &str, max_files: i32) -> Result<Self> {
        let base = CString::new(base_path).context("mount point contains a NUL byte")?;
        let host_id = spi.host();

        let host = sdmmc_host_t {
            flags: HOST_FLAG_SPI | HOST_FLAG_DEINIT_ARG,
            slot: host_id as i32,
            max_freq_khz: SD_FREQUENCY_KHZ,
            io_voltage: 3.3,
            init: Some(sdspi_host_init),
            set_card_clk: Some(sdspi_host_set_card_clk),
            do_transaction: Some(sdspi_host_do_transaction),
            __bindgen_anon_1: sdmmc_host_t__bindgen_ty_1 {
                deinit_p: Some(sdspi_host_remove_device),
            },
            io_int_enable: Some(sdspi_host_io_int_enable),
            io_int_wait: Some(sdspi_host_io_int_wait),
            ..Default::default()
        };

        let device = sdspi_device_config_t {
            host_id,
            gpio_cs: cs_gpio,
            gpio_cd: -1,
            gpio_wp: -1,
            gpio_int: -1,
            ..Default::default()
        };

        let mount_config = esp_vfs_fat_mount_config_t {
            max_files,
            format_if_mount_failed: false,
            allocation_unit_size: ALLOCATION_UNIT,
            ..Default::default()
        };

        let mut card: *mut sdmmc_card_t = core::ptr::null_mut();
        esp!(unsafe {
            esp_vfs_fat_sdspi_mount(base.as_ptr(), &host, &device, &mount_config, &mut card)
        })
        .with_context(|| format!("mounting SD card at {}", base_path))?;

        log::info!("SD card mounted at {}", base_path);
        Ok(Self {
            card,
            base_path: base,
            _spi: spi,
        })
    }
}

impl Drop for SdCard {
    fn drop(&mut self) {
        unsafe {
            esp_vfs_fat_sdcard_unmount(self.base_path.as_ptr(), self.card);
        }
    }
}
