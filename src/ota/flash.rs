// Flash write sink - the platform primitive that programs the update partition

use core::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashError {
    message: String,
}

impl FlashError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for FlashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for FlashError {}

/// Sequential writer into the update-capable flash region.
///
/// A session is `begin` followed by any number of `write`s and then exactly
/// one of `commit` (make the image bootable) or `abort` (discard it).
pub trait FlashWriteSink: Send {
    /// Reserve space for an image of `size` bytes, or an unknown size.
    fn begin(&mut self, size: Option<usize>) -> Result<(), FlashError>;

    /// Append `chunk`, returning how many bytes were accepted. A count short
    /// of `chunk.len()` is a failed write.
    fn write(&mut self, chunk: &[u8]) -> Result<usize, FlashError>;

    /// Discard the reservation and anything written into it. Must be safe to
    /// call when nothing is reserved.
    fn abort(&mut self);

    /// Finalize the written image and mark it as the next boot target.
    fn commit(&mut self) -> Result<(), FlashError>;
}

impl<S: FlashWriteSink + ?Sized> FlashWriteSink for Box<S> {
    fn begin(&mut self, size: Option<usize>) -> Result<(), FlashError> {
        (**self).begin(size)
    }

    fn write(&mut self, chunk: &[u8]) -> Result<usize, FlashError> {
        (**self).write(chunk)
    }

    fn abort(&mut self) {
        (**self).abort()
    }

    fn commit(&mut self) -> Result<(), FlashError> {
        (**self).commit()
    }
}

/// Everything a [`MemoryFlashSink`] has seen.
#[derive(Debug, Default, Clone)]
pub struct FlashLog {
    /// Chunks accepted since the last `begin`, in write order
    pub writes: Vec<Vec<u8>>,
    pub reserved: Option<Option<usize>>,
    pub begin_calls: u32,
    pub abort_calls: u32,
    pub commit_calls: u32,
    /// Image that was committed last, if any
    pub committed: Option<Vec<u8>>,
}

impl FlashLog {
    pub fn bytes_written(&self) -> usize {
        self.writes.iter().map(Vec::len).sum()
    }

    pub fn image(&self) -> Vec<u8> {
        self.writes.concat()
    }
}

#[derive(Debug, Default)]
struct Faults {
    /// (write call index since begin, bytes to accept)
    short_write: Option<(usize, usize)>,
    commit_error: Option<String>,
}

#[derive(Debug, Default)]
struct MemoryFlash {
    capacity: usize,
    log: FlashLog,
    faults: Faults,
}

/// RAM-backed sink for host builds and tests.
///
/// Clones share the same underlying state, so a test can keep a handle
/// while the controller owns another.
#[derive(Debug, Clone)]
pub struct MemoryFlashSink {
    inner: Arc<Mutex<MemoryFlash>>,
}

impl MemoryFlashSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryFlash {
                capacity,
                ..Default::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryFlash> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the `call`-th write after `begin` (0-based) accept only `accept` bytes.
    pub fn fail_write_at(&self, call: usize, accept: usize) {
        self.lock().faults.short_write = Some((call, accept));
    }

    pub fn fail_commit(&self, message: impl Into<String>) {
        self.lock().faults.commit_error = Some(message.into());
    }

    pub fn log(&self) -> FlashLog {
        self.lock().log.clone()
    }
}

impl FlashWriteSink for MemoryFlashSink {
    fn begin(&mut self, size: Option<usize>) -> Result<(), FlashError> {
        let mut flash = self.lock();
        flash.log.begin_calls += 1;

        if flash.log.reserved.is_some() {
            return Err(FlashError::new("update already begun"));
        }
        if let Some(size) = size {
            if size > flash.capacity {
                return Err(FlashError::new(format!(
                    "image of {} bytes exceeds partition of {} bytes",
                    size, flash.capacity
                )));
            }
        }

        flash.log.reserved = Some(size);
        flash.log.writes.clear();
        Ok(())
    }

    fn write(&mut self, chunk: &[u8]) -> Result<usize, FlashError> {
        let mut flash = self.lock();
        if flash.log.reserved.is_none() {
            return Err(FlashError::new("write without begin"));
        }

        let call = flash.log.writes.len();
        let mut accept = chunk.len();
        if let Some((fail_call, fail_accept)) = flash.faults.short_write {
            if fail_call == call {
                accept = fail_accept.min(chunk.len());
            }
        }

        let room = flash.capacity.saturating_sub(flash.log.bytes_written());
        accept = accept.min(room);

        flash.log.writes.push(chunk[..accept].to_vec());
        Ok(accept)
    }

    fn abort(&mut self) {
        let mut flash = self.lock();
        flash.log.abort_calls += 1;
        flash.log.reserved = None;
    }

    fn commit(&mut self) -> Result<(), FlashError> {
        let mut flash = self.lock();
        flash.log.commit_calls += 1;

        if flash.log.reserved.is_none() {
            return Err(FlashError::new("commit without begin"));
        }
        if let Some(message) = flash.faults.commit_error.clone() {
            flash.log.reserved = None;
            return Err(FlashError::new(message));
        }

        flash.log.reserved = None;
        flash.log.committed = Some(flash.log.image());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_rejects_oversized_image() {
        let mut sink = MemoryFlashSink::new(1024);
        assert!(sink.begin(Some(2048)).is_err());
        assert!(sink.begin(Some(1024)).is_ok());
    }

    #[test]
    fn write_and_commit_records_image() {
        let mut sink = MemoryFlashSink::new(1024);
        sink.begin(None).unwrap();
        assert_eq!(sink.write(b"abcd").unwrap(), 4);
        assert_eq!(sink.write(b"ef").unwrap(), 2);
        sink.commit().unwrap();

        let log = sink.log();
        assert_eq!(log.writes.len(), 2);
        assert_eq!(log.committed.as_deref(), Some(&b"abcdef"[..]));
    }

    #[test]
    fn injected_short_write() {
        let mut sink = MemoryFlashSink::new(1024);
        sink.fail_write_at(1, 3);
        sink.begin(None).unwrap();
        assert_eq!(sink.write(b"1234").unwrap(), 4);
        assert_eq!(sink.write(b"5678").unwrap(), 3);
    }

    #[test]
    fn writes_past_capacity_are_short() {
        let mut sink = MemoryFlashSink::new(6);
        sink.begin(None).unwrap();
        assert_eq!(sink.write(b"1234").unwrap(), 4);
        assert_eq!(sink.write(b"5678").unwrap(), 2);
    }

    #[test]
    fn abort_releases_reservation() {
        let mut sink = MemoryFlashSink::new(64);
        sink.begin(Some(8)).unwrap();
        assert!(sink.begin(Some(8)).is_err());
        sink.abort();
        assert!(sink.begin(Some(8)).is_ok());
        assert!(sink.log().committed.is_none());
    }

    #[test]
    fn commit_failure_carries_message() {
        let mut sink = MemoryFlashSink::new(64);
        sink.fail_commit("image validation failed");
        sink.begin(None).unwrap();
        let err = sink.commit().unwrap_err();
        assert_eq!(err.message(), "image validation failed");
    }
}
