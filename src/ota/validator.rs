// Firmware image header check - cheap gate before any flash space is reserved

/// First byte of every ESP32 application image.
pub const ESP_IMAGE_MAGIC: u8 = 0xE9;

/// Minimum number of leading bytes needed to judge an image.
pub const MIN_HEADER_LEN: usize = 4;

/// Returns true if `header` looks like the start of a firmware image.
///
/// Only the magic byte is inspected; this rejects text files and truncated
/// uploads, it is not a full image-format parser.
pub fn validate(header: &[u8]) -> bool {
    if header.len() < MIN_HEADER_LEN {
        return false;
    }

    header[0] == ESP_IMAGE_MAGIC
}
