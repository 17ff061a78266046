pub mod config;
pub mod logging;
pub mod ota;
pub mod version;
#[cfg(feature = "espidf")]
pub mod storage;
