use anyhow::Result;
use esp_idf_hal::delay::FreeRtos;
use esp_idf_hal::peripherals::Peripherals;
use esp_idf_hal::spi::{Dma, SpiDriver, SpiDriverConfig};
use esp_idf_sys as _; // Binstart
use std::path::Path;
use std::sync::Arc;

use log::info;

use aquasensys_ota::config;
use aquasensys_ota::logging;
use aquasensys_ota::ota::esp::{EspFlashSink, EspRestart};
use aquasensys_ota::ota::transport::{has_update_file, storage_status};
use aquasensys_ota::ota::UpdateController;
use aquasensys_ota::storage::SdCard;
use aquasensys_ota::version;

// Generate ESP-IDF app descriptor
#[allow(unexpected_cfgs)]
mod app_desc {
    esp_idf_sys::esp_app_desc!();
}

// SD card wiring
const SD_CS_GPIO: i32 = 10;
const SD_MAX_FILES: i32 = 5;

fn main() -> Result<()> {
    esp_idf_svc::sys::link_patches();
    logging::init_logger()?;

    info!("{} starting", version::full_version());
    info!("Free heap: {} bytes", unsafe {
        esp_idf_sys::esp_get_free_heap_size()
    });

    let peripherals = Peripherals::take()?;
    let pins = peripherals.pins;
    let spi = SpiDriver::new(
        peripherals.spi2,
        pins.gpio12,
        pins.gpio11,
        Some(pins.gpio13),
        &SpiDriverConfig::new().dma(Dma::Auto(4096)),
    )?;
    let _sd = SdCard::mount(spi, SD_CS_GPIO, config::SD_MOUNT_POINT, SD_MAX_FILES)?;

    let config = config::load_or_default(Path::new(config::OTA_CONFIG_FILE));
    if !logging::set_max_level_from_str(&config.log_level) {
        log::warn!("Unknown log level '{}', keeping {}", config.log_level, logging::current_max_level());
    }
    let restart = EspRestart::new(config.restart_delay());
    let controller = Arc::new(
        UpdateController::new(EspFlashSink::new(), &config)
            .with_restart(restart)
            .on_progress(|current, total| match total {
                Some(total) => log::debug!("OTA: {}/{} bytes", current, total),
                None => log::debug!("OTA: {} bytes", current),
            }),
    );

    // A staged image is applied before anything else runs
    if has_update_file(&config.staged_image_path) {
        info!("OTA: Found staged image at {}", config.staged_image_path.display());
        match controller.update_from_local_file(&config.staged_image_path) {
            Ok(report) => info!(
                "OTA: Applied {} bytes, sha256 {}",
                report.bytes_written,
                report.checksum.sha256_hex()
            ),
            // The image was set aside; the running firmware and config stay
            Err(e) => {
                log::error!("OTA: Staged update failed: {}", e);
                controller.cleanup();
            }
        }
    }

    if !config.config_path.exists() {
        log::warn!("Config {} missing, trying backup", config.config_path.display());
        controller.attempt_recovery();
    }

    let storage = storage_status(&controller, &config.staged_image_path);
    info!("OTA status: {}", serde_json::to_string(&storage)?);

    loop {
        FreeRtos::delay_ms(1000);
    }
}
