// Incremental MD5 and SHA-256 over a chunked firmware stream
//
// Both digests run over the same bytes. Clients pick one by sending its hex:
// 32 digits is MD5, 64 is SHA-256.

use core::fmt;
use md5::Md5;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    Md5,
    Sha256,
}

impl ChecksumKind {
    /// Infer the algorithm from the length of a hex digest.
    pub fn from_hex(hex: &str) -> Option<Self> {
        match hex.trim().len() {
            32 => Some(ChecksumKind::Md5),
            64 => Some(ChecksumKind::Sha256),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ChecksumKind::Md5 => "MD5",
            ChecksumKind::Sha256 => "SHA-256",
        }
    }
}

/// Finished digests of one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checksum {
    md5: [u8; 16],
    sha256: [u8; 32],
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

impl Checksum {
    pub fn md5_hex(&self) -> String {
        hex(&self.md5)
    }

    pub fn sha256_hex(&self) -> String {
        hex(&self.sha256)
    }

    pub fn hex(&self, kind: ChecksumKind) -> String {
        match kind {
            ChecksumKind::Md5 => self.md5_hex(),
            ChecksumKind::Sha256 => self.sha256_hex(),
        }
    }

    /// Compare against a caller-supplied hex string, ignoring case and
    /// surrounding whitespace. Input of any other length never matches.
    pub fn matches_hex(&self, expected: &str) -> bool {
        match ChecksumKind::from_hex(expected) {
            Some(kind) => self.hex(kind).eq_ignore_ascii_case(expected.trim()),
            None => false,
        }
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "md5 {} sha256 {}", self.md5_hex(), self.sha256_hex())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestError {
    /// `absorb` or `finish` called without a preceding `start`
    NotStarted,
}

impl fmt::Display for DigestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DigestError::NotStarted => write!(f, "digest not started"),
        }
    }
}

impl std::error::Error for DigestError {}

#[derive(Default)]
struct Hashers {
    md5: Md5,
    sha256: Sha256,
}

impl Hashers {
    fn update(&mut self, chunk: &[u8]) {
        self.md5.update(chunk);
        self.sha256.update(chunk);
    }

    fn finalize(self) -> Checksum {
        let mut sum = Checksum {
            md5: [0; 16],
            sha256: [0; 32],
        };
        sum.md5.copy_from_slice(&self.md5.finalize());
        sum.sha256.copy_from_slice(&self.sha256.finalize());
        sum
    }
}

/// Streaming digest accumulator.
///
/// `finish` consumes the running state; the accumulator has to be
/// `start`ed again before it accepts more data.
#[derive(Default)]
pub struct StreamingDigest {
    hashers: Option<Hashers>,
    absorbed: u64,
}

impl StreamingDigest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset to an empty running digest, discarding anything absorbed so far.
    pub fn start(&mut self) {
        self.hashers = Some(Hashers::default());
        self.absorbed = 0;
    }

    pub fn absorb(&mut self, chunk: &[u8]) -> Result<(), DigestError> {
        let hashers = self.hashers.as_mut().ok_or(DigestError::NotStarted)?;
        hashers.update(chunk);
        self.absorbed += chunk.len() as u64;
        Ok(())
    }

    pub fn finish(&mut self) -> Result<Checksum, DigestError> {
        let hashers = self.hashers.take().ok_or(DigestError::NotStarted)?;
        Ok(hashers.finalize())
    }

    pub fn is_running(&self) -> bool {
        self.hashers.is_some()
    }

    /// Bytes absorbed since the last `start`.
    pub fn absorbed(&self) -> u64 {
        self.absorbed
    }
}

/// One-shot digest of a complete buffer.
pub fn checksum_of(data: &[u8]) -> Checksum {
    let mut hashers = Hashers::default();
    hashers.update(data);
    hashers.finalize()
}
