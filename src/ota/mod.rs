// OTA (Over-The-Air) update module
//
// Update flow:
// 1. Claim the session and back up the live config
// 2. Validate the image header, reserve the update partition
// 3. Stream chunks into flash while hashing them
// 4. Verify the checksum and commit the boot partition
// 5. Restart

pub mod backup;
pub mod controller;
pub mod digest;
#[cfg(feature = "espidf")]
pub mod esp;
pub mod flash;
pub mod session;
pub mod transport;
pub mod validator;

pub use backup::{BackupManager, ConfigBackup};
pub use controller::{failed_image_path, Restart, UpdateController, UpdateReport};
pub use digest::{Checksum, ChecksumKind, StreamingDigest};
pub use flash::{FlashError, FlashWriteSink, MemoryFlashSink};
pub use session::{ErrorKind, SessionId, StatusSnapshot, UpdateError, UpdateStatus};
pub use transport::{UploadHandler, UploadReply, UploadRequest};

/// Where an image came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSource {
    WebUpload, // Chunked upload over HTTP
    LocalFile, // Image staged on the SD card
}

impl UpdateSource {
    pub fn label(&self) -> &'static str {
        match self {
            UpdateSource::WebUpload => "web upload",
            UpdateSource::LocalFile => "local file",
        }
    }
}
