// Update controller - the OTA state machine
//
// Idle -> Uploading -> {Success, Error(kind)} -> Idle (on cleanup)
//
// Status and progress share one atomic word so status queries never wait on
// chunk delivery and never see a status paired with another moment's
// progress. Everything a session mutates sits behind one mutex, taken by the
// single caller that drives the upload.

use std::ffi::OsString;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::config::OtaConfig;

use super::backup::BackupManager;
use super::digest::{Checksum, ChecksumKind, StreamingDigest};
use super::flash::FlashWriteSink;
use super::session::{
    progress_percent, ErrorKind, SessionId, StatusSnapshot, UpdateError, UpdateStatus,
};
use super::validator;
use super::UpdateSource;

/// Read size for images applied from local storage.
pub const LOCAL_READ_CHUNK: usize = 4096;

/// Suffix given to a staged image that failed to apply.
pub const FAILED_IMAGE_SUFFIX: &str = ".failed";

/// Called with (bytes written, declared total) after every chunk.
pub type ProgressObserver = Box<dyn Fn(usize, Option<usize>) + Send + Sync>;

/// Device restart collaborator, invoked once an image is committed.
pub trait Restart: Send + Sync {
    fn restart(&self);
}

/// Summary of a committed update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateReport {
    pub bytes_written: usize,
    pub checksum: Checksum,
    pub elapsed: Duration,
}

/// Where a staged image is moved after it failed to apply.
pub fn failed_image_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(FAILED_IMAGE_SUFFIX);
    PathBuf::from(name)
}

struct Session<S> {
    // Bumped for every started session
    id: u64,
    sink: S,
    digest: StreamingDigest,
    expected_checksum: Option<String>,
    started_at: Option<Instant>,
    received: usize,
    total: Option<usize>,
    reserved: bool,
    logged_decile: u8,
}

// [status:8][total:28][received:28]; 28 bits cover any image a 256 MiB flash holds
const FIELD_BITS: u32 = 28;
const FIELD_MASK: u64 = (1 << FIELD_BITS) - 1;
const STATUS_SHIFT: u32 = 2 * FIELD_BITS;
const UNKNOWN_TOTAL: u64 = FIELD_MASK;

fn pack_state(status: UpdateStatus, received: usize, total: Option<usize>) -> u64 {
    let received = (received as u64).min(FIELD_MASK);
    let total = match total {
        Some(t) => (t as u64).min(UNKNOWN_TOTAL - 1),
        None => UNKNOWN_TOTAL,
    };
    (u64::from(status.to_code()) << STATUS_SHIFT) | (total << FIELD_BITS) | received
}

fn unpack_state(word: u64) -> (UpdateStatus, usize, Option<usize>) {
    let status = UpdateStatus::from_code((word >> STATUS_SHIFT) as u8);
    let received = (word & FIELD_MASK) as usize;
    let total = (word >> FIELD_BITS) & FIELD_MASK;
    let total = if total == UNKNOWN_TOTAL { None } else { Some(total as usize) };
    (status, received, total)
}

pub struct UpdateController<S: FlashWriteSink> {
    state: AtomicU64,
    // Milliseconds since `epoch`
    started_ms: AtomicU64,
    last_activity_ms: AtomicU64,
    epoch: Instant,
    session: Mutex<Session<S>>,
    last_error: Mutex<Option<String>>,
    last_checksum: Mutex<Option<Checksum>>,
    backups: BackupManager,
    config_path: PathBuf,
    backup_enabled: bool,
    update_token: Option<String>,
    stale_timeout: Option<Duration>,
    observer: Option<ProgressObserver>,
    restarter: Option<Box<dyn Restart>>,
}

impl<S: FlashWriteSink> UpdateController<S> {
    pub fn new(sink: S, config: &OtaConfig) -> Self {
        Self {
            state: AtomicU64::new(pack_state(UpdateStatus::Idle, 0, Some(0))),
            started_ms: AtomicU64::new(0),
            last_activity_ms: AtomicU64::new(0),
            epoch: Instant::now(),
            session: Mutex::new(Session {
                id: 0,
                sink,
                digest: StreamingDigest::new(),
                expected_checksum: None,
                started_at: None,
                received: 0,
                total: Some(0),
                reserved: false,
                logged_decile: 0,
            }),
            last_error: Mutex::new(None),
            last_checksum: Mutex::new(None),
            backups: BackupManager::new(&config.backup_dir),
            config_path: config.config_path.clone(),
            backup_enabled: config.backup_enabled,
            update_token: config.token().map(str::to_string),
            stale_timeout: config.stale_session_timeout(),
            observer: None,
            restarter: None,
        }
    }

    /// Register the progress observer.
    ///
    /// It runs on the delivering caller's context while that session is
    /// locked. Query methods (`status`, `snapshot`, `last_error`,
    /// `computed_checksum`, ...) are safe to call from it; anything that
    /// drives or resets a session deadlocks.
    pub fn on_progress<F>(mut self, observer: F) -> Self
    where
        F: Fn(usize, Option<usize>) + Send + Sync + 'static,
    {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn with_restart(mut self, restarter: impl Restart + 'static) -> Self {
        self.restarter = Some(Box::new(restarter));
        self
    }

    pub fn backups(&self) -> &BackupManager {
        &self.backups
    }

    pub fn status(&self) -> UpdateStatus {
        unpack_state(self.state.load(Ordering::Acquire)).0
    }

    pub fn is_updating(&self) -> bool {
        self.status() == UpdateStatus::Uploading
    }

    /// Seconds since the running session began; 0 when nothing is running.
    pub fn elapsed_secs(&self) -> u64 {
        if !self.is_updating() {
            return 0;
        }
        let started = self.started_ms.load(Ordering::Acquire);
        self.now_ms().saturating_sub(started) / 1000
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Digests of the last session that reached the verify step.
    pub fn computed_checksum(&self) -> Option<Checksum> {
        *self.last_checksum.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let (status, current, total) = unpack_state(self.state.load(Ordering::Acquire));
        // Never wait on a writer for the message
        let message = self.last_error.try_lock().ok().and_then(|m| m.clone());
        let elapsed_secs = if status == UpdateStatus::Uploading {
            self.now_ms()
                .saturating_sub(self.started_ms.load(Ordering::Acquire))
                / 1000
        } else {
            0
        };

        StatusSnapshot {
            status: status.label().to_string(),
            progress: progress_percent(current, total),
            current,
            total: total.unwrap_or(0),
            is_updating: status == UpdateStatus::Uploading,
            elapsed_secs,
            message,
        }
    }

    /// Start a new update session and reserve flash for it.
    ///
    /// The returned id must accompany every chunk and the final
    /// `finish_update` of this session; once the session ends, or another
    /// replaces it, calls carrying the old id are rejected.
    pub fn begin_update(
        &self,
        declared_size: Option<usize>,
        expected_checksum: Option<&str>,
        auth_token: Option<&str>,
    ) -> Result<SessionId, UpdateError> {
        self.expire_stale_session();

        if self.is_updating() {
            log::warn!("OTA: Rejecting update - another update is in progress");
            return Err(ErrorKind::AlreadyInProgress.into());
        }
        if let Some(token) = &self.update_token {
            if auth_token != Some(token.as_str()) {
                log::warn!("OTA: Rejecting update - bad or missing token");
                return Err(ErrorKind::Unauthorized.into());
            }
        }

        let (mut session, id) =
            self.start_session(UpdateSource::WebUpload, declared_size, expected_checksum)?;
        self.backup_config();
        self.reserve(&mut session)?;
        Ok(id)
    }

    /// Feed the next chunk of the image. Chunks must arrive in order.
    pub fn supply_chunk(
        &self,
        id: SessionId,
        bytes: &[u8],
        is_first_chunk: bool,
    ) -> Result<(), UpdateError> {
        let mut session = self.lock_session();
        self.ensure_current(&session, id)?;

        if is_first_chunk && !validator::validate(bytes) {
            return Err(self.fail(&mut session, ErrorKind::InvalidImage, "Invalid firmware file"));
        }

        self.write_chunk(&mut session, bytes)
    }

    /// Verify the digest and commit the image.
    pub fn finish_update(&self, id: SessionId) -> Result<UpdateReport, UpdateError> {
        let mut session = self.lock_session();
        self.ensure_current(&session, id)?;
        self.finish(&mut session)
    }

    /// Acknowledge a finished session (or abandon a running one) and return
    /// to `Idle`.
    pub fn cleanup(&self) {
        let mut session = self.lock_session();

        if session.reserved {
            log::warn!("OTA: Aborting unfinished update during cleanup");
            session.sink.abort();
            session.reserved = false;
        }
        session.digest = StreamingDigest::new();
        session.expected_checksum = None;
        session.started_at = None;
        session.received = 0;
        session.total = Some(0);

        self.set_last_error(None);
        self.state
            .store(pack_state(UpdateStatus::Idle, 0, Some(0)), Ordering::Release);
    }

    /// Apply an image staged on local storage in one synchronous call.
    ///
    /// Uses the same validation, digest and error kinds as the chunked path,
    /// and checks the header before taking a config backup or reserving
    /// flash. On success the staged file is deleted and the device
    /// restarted; on failure it is renamed with [`FAILED_IMAGE_SUFFIX`] so
    /// the next boot does not retry it.
    pub fn update_from_local_file(&self, path: &Path) -> Result<UpdateReport, UpdateError> {
        self.expire_stale_session();
        if self.is_updating() {
            return Err(ErrorKind::AlreadyInProgress.into());
        }

        let file = File::open(path).map_err(|e| {
            log::warn!("OTA: Update file not available: {} ({})", path.display(), e);
            UpdateError::new(
                ErrorKind::Unknown,
                format!("Update file not found: {}", path.display()),
            )
        })?;
        let size = file
            .metadata()
            .map(|m| m.len() as usize)
            .map_err(|e| UpdateError::new(ErrorKind::Unknown, format!("Cannot stat update file: {}", e)))?;

        log::info!("OTA: Updating from file: {} ({} bytes)", path.display(), size);

        match self.apply_local_file(file, size) {
            Ok(report) => {
                if let Err(e) = std::fs::remove_file(path) {
                    log::warn!("OTA: Could not remove update file {}: {}", path.display(), e);
                }
                self.request_restart();
                Ok(report)
            }
            Err(e) => {
                if e.kind() != ErrorKind::AlreadyInProgress {
                    set_aside_failed_image(path);
                }
                Err(e)
            }
        }
    }

    /// Restore the newest configuration backup over the live config file.
    /// Independent of the update state machine.
    pub fn attempt_recovery(&self) -> bool {
        log::info!("OTA: Attempting config recovery into {}", self.config_path.display());
        self.backups.restore_latest(&self.config_path)
    }

    /// Hand over to the restart collaborator, if one is registered.
    pub fn request_restart(&self) {
        match &self.restarter {
            Some(restarter) => {
                log::info!("OTA: Restarting device...");
                restarter.restart();
            }
            None => log::info!("OTA: Restart requested but no restart handler registered"),
        }
    }

    // ---- internals ----

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn touch(&self) {
        self.last_activity_ms.store(self.now_ms(), Ordering::Release);
    }

    fn set_status(&self, status: UpdateStatus) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                let (_, received, total) = unpack_state(word);
                Some(pack_state(status, received, total))
            });
    }

    fn store_progress(&self, received: usize, total: Option<usize>) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |word| {
                let (status, _, _) = unpack_state(word);
                Some(pack_state(status, received, total))
            });
    }

    fn set_last_error(&self, message: Option<String>) {
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = message;
    }

    fn lock_session(&self) -> MutexGuard<'_, Session<S>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    // The caller must hold the session that is running right now.
    fn ensure_current(&self, session: &Session<S>, id: SessionId) -> Result<(), UpdateError> {
        if !self.is_updating() {
            return Err(ErrorKind::NotUploading.into());
        }
        if session.id != id.0 {
            log::warn!("OTA: Ignoring call for replaced update session");
            return Err(UpdateError::new(
                ErrorKind::NotUploading,
                "Update session is no longer active",
            ));
        }
        Ok(())
    }

    // Atomically move Idle/terminal -> Uploading. Exactly one caller wins.
    fn claim(&self, declared_size: Option<usize>) -> Result<(), UpdateError> {
        let claimed = pack_state(UpdateStatus::Uploading, 0, declared_size);
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if unpack_state(current).0 == UpdateStatus::Uploading {
                return Err(ErrorKind::AlreadyInProgress.into());
            }
            match self
                .state
                .compare_exchange(current, claimed, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    fn start_session(
        &self,
        source: UpdateSource,
        declared_size: Option<usize>,
        expected_checksum: Option<&str>,
    ) -> Result<(MutexGuard<'_, Session<S>>, SessionId), UpdateError> {
        // Fresh activity before the claim, so a stale-session sweep cannot
        // mistake the new session for the abandoned one
        self.touch();
        self.claim(declared_size)?;
        let mut session = self.lock_session();
        if !self.is_updating() {
            return Err(UpdateError::new(ErrorKind::Unknown, "Update abandoned"));
        }

        let now = self.now_ms();
        self.started_ms.store(now, Ordering::Release);
        self.last_activity_ms.store(now, Ordering::Release);
        self.set_last_error(None);
        *self.last_checksum.lock().unwrap_or_else(|e| e.into_inner()) = None;

        session.id = session.id.wrapping_add(1);
        session.digest.start();
        session.expected_checksum = expected_checksum
            .map(|c| c.trim().to_ascii_lowercase())
            .filter(|c| !c.is_empty());
        session.started_at = Some(Instant::now());
        session.received = 0;
        session.total = declared_size;
        session.logged_decile = 0;

        log::info!("OTA: Update started from {}", source.label());
        match declared_size {
            Some(size) => log::info!("OTA: Update size: {} bytes", size),
            None => log::info!("OTA: Update size not declared"),
        }
        if let Some(expected) = &session.expected_checksum {
            match ChecksumKind::from_hex(expected) {
                Some(kind) => log::info!("OTA: Expected {}: {}", kind.label(), expected),
                None => log::warn!("OTA: Expected checksum {} is neither MD5 nor SHA-256", expected),
            }
        }

        let id = SessionId(session.id);
        Ok((session, id))
    }

    // Failure is logged and the update continues.
    fn backup_config(&self) {
        if !self.backup_enabled {
            return;
        }
        if let Err(e) = self.backups.backup(&self.config_path) {
            log::warn!("OTA: Warning - Failed to create config backup: {:#}", e);
        }
    }

    fn apply_local_file(&self, mut file: File, size: usize) -> Result<UpdateReport, UpdateError> {
        let (mut session, _) = self.start_session(UpdateSource::LocalFile, Some(size), None)?;

        let mut buffer = vec![0u8; LOCAL_READ_CHUNK];
        let first = match read_full(&mut file, &mut buffer) {
            Ok(n) => n,
            Err(e) => {
                return Err(self.fail(&mut session, ErrorKind::Unknown, format!("Read failed: {}", e)))
            }
        };

        // Header is checked before any backup or flash reservation
        if !validator::validate(&buffer[..first]) {
            return Err(self.fail(&mut session, ErrorKind::InvalidImage, "Invalid firmware file"));
        }

        self.backup_config();
        self.reserve(&mut session)?;
        self.write_chunk(&mut session, &buffer[..first])?;

        loop {
            let n = match read_full(&mut file, &mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    return Err(self.fail(&mut session, ErrorKind::Unknown, format!("Read failed: {}", e)))
                }
            };
            self.write_chunk(&mut session, &buffer[..n])?;
        }

        self.finish(&mut session)
    }

    fn reserve(&self, session: &mut Session<S>) -> Result<(), UpdateError> {
        match session.sink.begin(session.total) {
            Ok(()) => {
                session.reserved = true;
                Ok(())
            }
            Err(e) => Err(self.fail(
                session,
                ErrorKind::InsufficientSpace,
                format!("Not enough space: {}", e),
            )),
        }
    }

    // Digest and flash consume the same bytes, once each, in order.
    fn write_chunk(&self, session: &mut Session<S>, bytes: &[u8]) -> Result<(), UpdateError> {
        if let Err(e) = session.digest.absorb(bytes) {
            return Err(self.fail(session, ErrorKind::Unknown, format!("Digest error: {}", e)));
        }

        match session.sink.write(bytes) {
            Ok(n) if n == bytes.len() => {}
            Ok(n) => {
                let message = format!("Write failed: wrote {} of {} bytes", n, bytes.len());
                return Err(self.fail(session, ErrorKind::WriteFailure, message));
            }
            Err(e) => {
                return Err(self.fail(session, ErrorKind::WriteFailure, format!("Write failed: {}", e)))
            }
        }

        session.received += bytes.len();
        self.store_progress(session.received, session.total);
        self.touch();

        if let Some(observer) = &self.observer {
            observer(session.received, session.total);
        }

        // Log every 10%
        let decile = progress_percent(session.received, session.total) / 10;
        if decile > session.logged_decile {
            session.logged_decile = decile;
            log::info!("OTA: Progress: {}%", decile as u32 * 10);
        }

        Ok(())
    }

    fn finish(&self, session: &mut Session<S>) -> Result<UpdateReport, UpdateError> {
        log::info!("OTA: Upload complete");

        let checksum = match session.digest.finish() {
            Ok(sum) => sum,
            Err(e) => {
                return Err(self.fail(session, ErrorKind::Unknown, format!("Digest error: {}", e)))
            }
        };
        *self.last_checksum.lock().unwrap_or_else(|e| e.into_inner()) = Some(checksum);

        if let Some(total) = session.total {
            if total != session.received {
                log::warn!(
                    "OTA: Received {} bytes but {} were declared",
                    session.received,
                    total
                );
            }
        }

        if let Some(expected) = session.expected_checksum.clone() {
            if !checksum.matches_hex(&expected) {
                let kind = ChecksumKind::from_hex(&expected);
                let message = match kind {
                    Some(kind) => format!("{} mismatch", kind.label()),
                    None => "Checksum mismatch".to_string(),
                };
                log::error!(
                    "OTA: {} - Expected: {}, Got: {}",
                    message,
                    expected,
                    kind.map(|k| checksum.hex(k))
                        .unwrap_or_else(|| checksum.to_string())
                );
                return Err(self.fail(session, ErrorKind::ChecksumMismatch, message));
            }
        }

        if let Err(e) = session.sink.commit() {
            return Err(self.fail(
                session,
                ErrorKind::Unknown,
                format!("Update failed: {}", e.message()),
            ));
        }
        session.reserved = false;

        let elapsed = session.started_at.map(|t| t.elapsed()).unwrap_or_default();
        log::info!("OTA: Update success in {} seconds", elapsed.as_secs());
        log::info!("OTA: MD5: {}", checksum.md5_hex());
        log::info!("OTA: SHA-256: {}", checksum.sha256_hex());

        self.set_status(UpdateStatus::Success);
        Ok(UpdateReport {
            bytes_written: session.received,
            checksum,
            elapsed,
        })
    }

    // Every failure after reservation releases the flash region before the
    // error becomes visible.
    fn fail(&self, session: &mut Session<S>, kind: ErrorKind, message: impl Into<String>) -> UpdateError {
        let message = message.into();

        if session.reserved {
            session.sink.abort();
            session.reserved = false;
        }
        session.digest = StreamingDigest::new();

        log::error!("OTA: {} - {}", kind, message);
        self.set_last_error(Some(message.clone()));
        self.set_status(UpdateStatus::Error(kind));
        UpdateError::new(kind, message)
    }

    fn expire_stale_session(&self) {
        let Some(timeout) = self.stale_timeout else {
            return;
        };
        if !self.is_updating() {
            return;
        }

        let idle_ms = self
            .now_ms()
            .saturating_sub(self.last_activity_ms.load(Ordering::Acquire));
        if idle_ms < timeout.as_millis() as u64 {
            return;
        }

        let mut session = self.lock_session();
        // Re-check under the lock: the owner may have finished meanwhile
        let idle_ms = self
            .now_ms()
            .saturating_sub(self.last_activity_ms.load(Ordering::Acquire));
        if self.is_updating() && idle_ms >= timeout.as_millis() as u64 {
            log::warn!("OTA: Aborting update idle for {} ms", idle_ms);
            self.fail(&mut session, ErrorKind::Unknown, "Update abandoned");
        }
    }
}

fn set_aside_failed_image(path: &Path) {
    let target = failed_image_path(path);
    match std::fs::rename(path, &target) {
        Ok(()) => log::warn!("OTA: Moved failed image to {}", target.display()),
        Err(e) => log::warn!("OTA: Could not move failed image {}: {}", path.display(), e),
    }
}

// Fill `buf` as far as the reader allows; 0 means end of file.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
