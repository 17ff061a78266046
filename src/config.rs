use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where the SD card is mounted; every default path below lives on it.
pub const SD_MOUNT_POINT: &str = "/sd";

/// Settings file read at boot, once the card is mounted.
pub const OTA_CONFIG_FILE: &str = "/sd/ota.json";

/// Settings for the update subsystem, stored as JSON on the SD card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OtaConfig {
    // Live configuration file protected by backups
    pub config_path: PathBuf,

    // Backups
    pub backup_dir: PathBuf,
    pub backup_enabled: bool,

    // Security - empty or absent token leaves the endpoint open
    pub update_token: Option<String>,

    // Staged image applied from local storage
    pub staged_image_path: PathBuf,

    // An `Uploading` session idle for longer than this is aborted when the
    // next update begins. `None` keeps it until explicit cleanup.
    pub stale_session_timeout_secs: Option<u64>,

    pub restart_delay_ms: u64,

    // error, warn, info, debug or trace
    pub log_level: String,
}

impl Default for OtaConfig {
    fn default() -> Self {
        // Baked in by build.rs from OTA_UPDATE_TOKEN
        let token = env!("OTA_UPDATE_TOKEN");

        Self {
            config_path: PathBuf::from("/sd/config.json"),
            backup_dir: PathBuf::from("/sd/backup"),
            backup_enabled: true,
            update_token: if token.is_empty() { None } else { Some(token.to_string()) },
            staged_image_path: PathBuf::from("/sd/update.bin"),
            stale_session_timeout_secs: None,
            restart_delay_ms: 500,
            log_level: "info".to_string(),
        }
    }
}

impl OtaConfig {
    /// The configured token, with an empty string treated as unset.
    pub fn token(&self) -> Option<&str> {
        self.update_token.as_deref().filter(|t| !t.is_empty())
    }

    pub fn stale_session_timeout(&self) -> Option<Duration> {
        self.stale_session_timeout_secs.map(Duration::from_secs)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read(path)
            .with_context(|| format!("reading OTA config {}", path.display()))?;
        let config: OtaConfig = serde_json::from_slice(&data)
            .with_context(|| format!("parsing OTA config {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("writing OTA config {}", path.display()))?;
        log::info!("OTA configuration saved to {}", path.display());
        Ok(())
    }
}

pub fn load_or_default(path: &Path) -> OtaConfig {
    if !path.exists() {
        log::info!("No OTA config at {}, using defaults", path.display());
        return OtaConfig::default();
    }

    match OtaConfig::load(path) {
        Ok(config) => {
            log::info!("Loaded OTA configuration from {}", path.display());
            config
        }
        Err(e) => {
            log::warn!("Failed to load OTA config: {:#}, using defaults", e);
            OtaConfig::default()
        }
    }
}
