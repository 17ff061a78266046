// Centralized version information

// Reported by the status endpoints and the boot banner
pub const DISPLAY_VERSION: &str = "v0.3.2-ota";

pub const DEVICE_NAME: &str = "AquaSensys";

// Cargo package version from Cargo.toml
pub const CARGO_VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn full_version() -> String {
    format!("{} {} ({})", DEVICE_NAME, DISPLAY_VERSION, CARGO_VERSION)
}
