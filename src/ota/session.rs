// Update session status, error taxonomy and the status report

use core::fmt;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    AlreadyInProgress,
    Unauthorized,
    /// Header check on the first bytes failed
    InvalidImage,
    /// Flash reservation failed
    InsufficientSpace,
    /// A chunk write to flash was short or errored
    WriteFailure,
    /// Computed digest disagrees with the caller's expectation
    ChecksumMismatch,
    /// Commit-phase failure, or anything else without a better kind
    Unknown,
    /// Chunk or finish delivered with no session in `Uploading`
    NotUploading,
}

impl ErrorKind {
    const ALL: [ErrorKind; 8] = [
        ErrorKind::AlreadyInProgress,
        ErrorKind::Unauthorized,
        ErrorKind::InvalidImage,
        ErrorKind::InsufficientSpace,
        ErrorKind::WriteFailure,
        ErrorKind::ChecksumMismatch,
        ErrorKind::Unknown,
        ErrorKind::NotUploading,
    ];

    /// Label reported by the status endpoint.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::AlreadyInProgress => "Update already in progress",
            ErrorKind::Unauthorized => "Unauthorized",
            ErrorKind::InvalidImage => "Invalid firmware",
            ErrorKind::InsufficientSpace => "No space",
            ErrorKind::WriteFailure => "Write error",
            ErrorKind::ChecksumMismatch => "Checksum mismatch",
            ErrorKind::Unknown => "Unknown error",
            ErrorKind::NotUploading => "No update in progress",
        }
    }

    /// Status code a transport should answer with.
    pub fn http_status(&self) -> u16 {
        match self {
            ErrorKind::AlreadyInProgress => 503,
            ErrorKind::Unauthorized => 403,
            ErrorKind::InvalidImage
            | ErrorKind::InsufficientSpace
            | ErrorKind::ChecksumMismatch
            | ErrorKind::NotUploading => 400,
            ErrorKind::WriteFailure | ErrorKind::Unknown => 500,
        }
    }

    fn code(&self) -> u8 {
        Self::ALL.iter().position(|k| k == self).unwrap_or(0) as u8
    }

    fn from_code(code: u8) -> Self {
        Self::ALL
            .get(code as usize)
            .copied()
            .unwrap_or(ErrorKind::Unknown)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStatus {
    Idle,
    Uploading,
    Success,
    Error(ErrorKind),
}

const CODE_IDLE: u8 = 0;
const CODE_UPLOADING: u8 = 1;
const CODE_SUCCESS: u8 = 2;
const CODE_ERROR_BASE: u8 = 0x10;

impl UpdateStatus {
    pub fn label(&self) -> &'static str {
        match self {
            UpdateStatus::Idle => "Idle",
            UpdateStatus::Uploading => "Uploading",
            UpdateStatus::Success => "Success",
            UpdateStatus::Error(kind) => kind.label(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UpdateStatus::Success | UpdateStatus::Error(_))
    }

    /// Single-byte encoding so the status fits in one atomic.
    pub(crate) fn to_code(self) -> u8 {
        match self {
            UpdateStatus::Idle => CODE_IDLE,
            UpdateStatus::Uploading => CODE_UPLOADING,
            UpdateStatus::Success => CODE_SUCCESS,
            UpdateStatus::Error(kind) => CODE_ERROR_BASE + kind.code(),
        }
    }

    pub(crate) fn from_code(code: u8) -> Self {
        match code {
            CODE_IDLE => UpdateStatus::Idle,
            CODE_UPLOADING => UpdateStatus::Uploading,
            CODE_SUCCESS => UpdateStatus::Success,
            c if c >= CODE_ERROR_BASE => UpdateStatus::Error(ErrorKind::from_code(c - CODE_ERROR_BASE)),
            _ => UpdateStatus::Idle,
        }
    }
}

impl fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Identifies one update session. Returned by `begin_update` and required by
/// every later call of that session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub(crate) u64);

/// Error surfaced to the caller: a kind plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateError {
    kind: ErrorKind,
    message: String,
}

impl UpdateError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<ErrorKind> for UpdateError {
    fn from(kind: ErrorKind) -> Self {
        Self::new(kind, kind.label())
    }
}

impl fmt::Display for UpdateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for UpdateError {}

/// Read-only view of the controller, as served to status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub status: String,
    /// 0-100; 0 while the total is unknown
    pub progress: u8,
    pub current: usize,
    /// 0 when the image size was not declared
    pub total: usize,
    pub is_updating: bool,
    pub elapsed_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

pub fn progress_percent(current: usize, total: Option<usize>) -> u8 {
    match total {
        Some(total) if total > 0 => ((current.min(total) as u64 * 100) / total as u64) as u8,
        _ => 0,
    }
}
