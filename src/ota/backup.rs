// Configuration backup and restore around firmware updates
//
// Backups live in one directory as `config_<millis>.json`. Restore always
// picks the greatest timestamp.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub const BACKUP_PREFIX: &str = "config_";
pub const BACKUP_SUFFIX: &str = ".json";

/// Copy buffer size; bounds peak memory regardless of file size.
pub const COPY_CHUNK_SIZE: usize = 512;

/// Millisecond timestamp embedded in the backup file name.
pub type BackupId = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigBackup {
    pub id: BackupId,
    /// Known only for backups created by this process
    pub source: Option<PathBuf>,
    pub path: PathBuf,
}

fn wall_clock_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Parse `config_<digits>.json` into its timestamp.
pub fn parse_backup_name(name: &str) -> Option<BackupId> {
    let digits = name.strip_prefix(BACKUP_PREFIX)?.strip_suffix(BACKUP_SUFFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

pub fn backup_file_name(id: BackupId) -> String {
    format!("{}{}{}", BACKUP_PREFIX, id, BACKUP_SUFFIX)
}

/// Copy `src` to `dst` through a fixed-size buffer. Returns bytes copied.
pub fn copy_chunked(src: &Path, dst: &Path) -> std::io::Result<u64> {
    let mut source = File::open(src)?;
    let mut dest = File::create(dst)?;

    let mut buffer = [0u8; COPY_CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let n = source.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        dest.write_all(&buffer[..n])?;
        total += n as u64;
    }
    dest.flush()?;
    Ok(total)
}

fn staging_path(dst: &Path) -> PathBuf {
    let mut name = dst.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Copy `src` next to `dst` and move it into place only once complete, so a
/// failed copy never leaves a truncated `dst` behind.
///
/// FAT refuses to rename over an existing file, so an existing `dst` is
/// removed just before the rename.
pub fn copy_into_place(src: &Path, dst: &Path) -> std::io::Result<u64> {
    let staging = staging_path(dst);
    let copied = match copy_chunked(src, &staging) {
        Ok(n) => n,
        Err(e) => {
            let _ = fs::remove_file(&staging);
            return Err(e);
        }
    };

    if dst.exists() {
        if let Err(e) = fs::remove_file(dst) {
            let _ = fs::remove_file(&staging);
            return Err(e);
        }
    }
    fs::rename(&staging, dst)?;
    Ok(copied)
}

pub struct BackupManager {
    backup_dir: PathBuf,
    clock: fn() -> u64,
    last_id: AtomicU64,
}

impl BackupManager {
    pub fn new(backup_dir: impl Into<PathBuf>) -> Self {
        Self::with_clock(backup_dir, wall_clock_millis)
    }

    pub fn with_clock(backup_dir: impl Into<PathBuf>, clock: fn() -> u64) -> Self {
        Self {
            backup_dir: backup_dir.into(),
            clock,
            last_id: AtomicU64::new(0),
        }
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Snapshot `source` into the backup directory.
    ///
    /// A missing source is not an error: there is nothing to protect, and
    /// `Ok(None)` is returned.
    pub fn backup(&self, source: &Path) -> Result<Option<ConfigBackup>> {
        if !source.exists() {
            log::debug!("OTA: No config at {} - nothing to back up", source.display());
            return Ok(None);
        }

        fs::create_dir_all(&self.backup_dir).with_context(|| {
            format!("creating backup directory {}", self.backup_dir.display())
        })?;

        let id = self.next_id()?;
        let path = self.backup_dir.join(backup_file_name(id));
        let copied = copy_into_place(source, &path)
            .with_context(|| format!("copying {} to {}", source.display(), path.display()))?;

        log::info!("OTA: Config backed up to {} ({} bytes)", path.display(), copied);
        Ok(Some(ConfigBackup {
            id,
            source: Some(source.to_path_buf()),
            path,
        }))
    }

    /// All backups in the directory, oldest first. A missing directory is empty.
    pub fn list(&self) -> Result<Vec<ConfigBackup>> {
        let entries = match fs::read_dir(&self.backup_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("reading backup directory {}", self.backup_dir.display())
                })
            }
        };

        let mut backups = Vec::new();
        for entry in entries.flatten() {
            if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                continue;
            }
            let name = entry.file_name();
            if let Some(id) = name.to_str().and_then(parse_backup_name) {
                backups.push(ConfigBackup {
                    id,
                    source: None,
                    path: entry.path(),
                });
            }
        }
        backups.sort_by_key(|b| b.id);
        Ok(backups)
    }

    pub fn latest(&self) -> Result<Option<ConfigBackup>> {
        Ok(self.list()?.pop())
    }

    /// Replace `target` with the newest backup. If the copy fails, `target`
    /// keeps its previous contents.
    pub fn try_restore_latest(&self, target: &Path) -> Result<Option<ConfigBackup>> {
        let Some(latest) = self.latest()? else {
            return Ok(None);
        };

        log::info!("OTA: Restoring config from {}", latest.path.display());

        copy_into_place(&latest.path, target).with_context(|| {
            format!("copying {} to {}", latest.path.display(), target.display())
        })?;

        Ok(Some(latest))
    }

    /// `try_restore_latest` reduced to success/failure, with the reason logged.
    pub fn restore_latest(&self, target: &Path) -> bool {
        match self.try_restore_latest(target) {
            Ok(Some(_)) => {
                log::info!("OTA: Config restored successfully");
                true
            }
            Ok(None) => {
                log::warn!("OTA: No config backup found in {}", self.backup_dir.display());
                false
            }
            Err(e) => {
                log::error!("OTA: Config restore failed: {:#}", e);
                false
            }
        }
    }

    // Never goes backwards, even across reboots where the clock restarts.
    fn next_id(&self) -> Result<BackupId> {
        let on_disk = self.latest()?.map(|b| b.id + 1).unwrap_or(0);
        let now = (self.clock)();

        let mut last = self.last_id.load(Ordering::Acquire);
        loop {
            let candidate = now.max(on_disk).max(last + 1);
            match self
                .last_id
                .compare_exchange(last, candidate, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(candidate),
                Err(current) => last = current,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fixed_clock() -> u64 {
        1_000
    }

    fn write(path: &Path, contents: &[u8]) {
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn parses_backup_names() {
        assert_eq!(parse_backup_name("config_300.json"), Some(300));
        assert_eq!(parse_backup_name("config_.json"), None);
        assert_eq!(parse_backup_name("config_12a.json"), None);
        assert_eq!(parse_backup_name("config_12.json.bak"), None);
        assert_eq!(parse_backup_name("settings_12.json"), None);
        assert_eq!(backup_file_name(42), "config_42.json");
    }

    #[test]
    fn missing_source_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let manager = BackupManager::new(dir.path().join("backup"));

        let result = manager.backup(&dir.path().join("config.json")).unwrap();
        assert!(result.is_none());
        assert!(!dir.path().join("backup").exists());
    }

    #[test]
    fn backup_copies_bytes_and_creates_directory() {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("config.json");
        let contents: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        write(&config, &contents);

        let manager = BackupManager::with_clock(dir.path().join("backup"), fixed_clock);
        let backup = manager.backup(&config).unwrap().unwrap();

        assert_eq!(backup.id, 1_000);
        assert_eq!(backup.path, dir.path().join("backup/config_1000.json"));
        assert_eq!(backup.source.as_deref(), Some(config.as_path()));
        assert_eq!(fs::read(&backup.path).unwrap(), contents);
    }

    #[test]
    fn ids_never_collide_or_go_backwards() {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("config.json");
        write(&config, b"{}");
        fs::create_dir_all(dir.path().join("backup")).unwrap();
        write(&dir.path().join("backup/config_5000.json"), b"{}");

        let manager = BackupManager::with_clock(dir.path().join("backup"), fixed_clock);
        let first = manager.backup(&config).unwrap().unwrap();
        let second = manager.backup(&config).unwrap().unwrap();

        assert_eq!(first.id, 5_001);
        assert_eq!(second.id, 5_002);
        assert_eq!(manager.list().unwrap().len(), 3);
    }

    #[test]
    fn restore_with_no_backups_leaves_target_untouched() {
        let dir = TempDir::new().unwrap();
        let config = dir.path().join("config.json");
        write(&config, b"live");
        fs::create_dir_all(dir.path().join("backup")).unwrap();

        let manager = BackupManager::new(dir.path().join("backup"));
        assert!(!manager.restore_latest(&config));
        assert_eq!(fs::read(&config).unwrap(), b"live");

        let missing_dir = BackupManager::new(dir.path().join("nope"));
        assert!(!missing_dir.restore_latest(&config));
        assert_eq!(fs::read(&config).unwrap(), b"live");
    }

    #[test]
    fn restore_picks_greatest_timestamp() {
        let dir = TempDir::new().unwrap();
        let backups = dir.path().join("backup");
        fs::create_dir_all(&backups).unwrap();
        write(&backups.join("config_100.json"), b"one hundred");
        write(&backups.join("config_300.json"), b"three hundred");
        write(&backups.join("config_200.json"), b"two hundred");
        write(&backups.join("notes.txt"), b"ignored");
        write(&backups.join("config_999.json.tmp"), b"ignored");

        let config = dir.path().join("config.json");
        write(&config, b"broken");

        let manager = BackupManager::new(&backups);
        let restored = manager.try_restore_latest(&config).unwrap().unwrap();
        assert_eq!(restored.id, 300);
        assert_eq!(fs::read(&config).unwrap(), b"three hundred");
    }

    #[test]
    fn restore_compares_numerically() {
        let dir = TempDir::new().unwrap();
        let backups = dir.path().join("backup");
        fs::create_dir_all(&backups).unwrap();
        write(&backups.join("config_9.json"), b"nine");
        write(&backups.join("config_10.json"), b"ten");

        let config = dir.path().join("config.json");
        assert!(BackupManager::new(&backups).restore_latest(&config));
        assert_eq!(fs::read(&config).unwrap(), b"ten");
    }

    #[test]
    fn failed_copy_leaves_no_backup_behind() {
        let dir = TempDir::new().unwrap();
        let backups = dir.path().join("backup");
        fs::create_dir_all(&backups).unwrap();
        write(&backups.join("config_100.json"), b"good config");

        // Opens fine but every read fails
        let unreadable = dir.path().join("config.json");
        fs::create_dir_all(&unreadable).unwrap();

        let manager = BackupManager::with_clock(&backups, fixed_clock);
        assert!(manager.backup(&unreadable).is_err());

        let ids: Vec<_> = manager.list().unwrap().iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![100]);
        assert_eq!(fs::read_dir(&backups).unwrap().count(), 1);

        let target = dir.path().join("restored.json");
        assert!(manager.restore_latest(&target));
        assert_eq!(fs::read(&target).unwrap(), b"good config");
    }

    #[test]
    fn failed_restore_keeps_target() {
        let dir = TempDir::new().unwrap();
        let backups = dir.path().join("backup");
        fs::create_dir_all(&backups).unwrap();
        write(&backups.join("config_100.json"), b"good config");
        let config = dir.path().join("config.json");
        write(&config, b"live");

        // Reading a directory fails after the staging file exists
        let manager = BackupManager::new(&backups);
        assert!(copy_into_place(&backups, &config).is_err());
        assert_eq!(fs::read(&config).unwrap(), b"live");
        assert!(!staging_path(&config).exists());

        assert!(manager.restore_latest(&config));
        assert_eq!(fs::read(&config).unwrap(), b"good config");
    }

    #[test]
    fn copy_handles_exact_chunk_multiples() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        let contents = vec![0xA5u8; COPY_CHUNK_SIZE * 3];
        write(&src, &contents);

        assert_eq!(copy_chunked(&src, &dst).unwrap(), contents.len() as u64);
        assert_eq!(fs::read(&dst).unwrap(), contents);
    }
}
