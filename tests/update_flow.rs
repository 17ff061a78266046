//! Host-side update scenarios driven through the public API

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use aquasensys_ota::config::OtaConfig;
use aquasensys_ota::ota::digest::checksum_of;
use aquasensys_ota::ota::controller::failed_image_path;
use aquasensys_ota::ota::transport::{status_json, storage_status};
use aquasensys_ota::ota::validator::ESP_IMAGE_MAGIC;
use aquasensys_ota::ota::{
    ErrorKind, MemoryFlashSink, Restart, UpdateController, UpdateStatus, UploadHandler,
    UploadRequest,
};
use tempfile::TempDir;

struct RestartCounter(Arc<AtomicUsize>);

impl Restart for RestartCounter {
    fn restart(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

struct Device {
    dir: TempDir,
    config: OtaConfig,
    sink: MemoryFlashSink,
    restarts: Arc<AtomicUsize>,
    ota: Arc<UpdateController<MemoryFlashSink>>,
}

fn device() -> Device {
    let dir = TempDir::new().unwrap();
    let config = OtaConfig {
        config_path: dir.path().join("config.json"),
        backup_dir: dir.path().join("backup"),
        staged_image_path: dir.path().join("update.bin"),
        update_token: None,
        ..OtaConfig::default()
    };
    fs::write(&config.config_path, br#"{"wifi":"home"}"#).unwrap();

    let sink = MemoryFlashSink::new(64 * 1024);
    let restarts = Arc::new(AtomicUsize::new(0));
    let ota = Arc::new(
        UpdateController::new(sink.clone(), &config).with_restart(RestartCounter(restarts.clone())),
    );
    Device {
        dir,
        config,
        sink,
        restarts,
        ota,
    }
}

fn firmware(len: usize) -> Vec<u8> {
    let mut data: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
    data[0] = ESP_IMAGE_MAGIC;
    data
}

#[test]
fn two_chunk_update_commits_in_order() {
    let dev = device();
    let data = firmware(1024);

    let id = dev.ota.begin_update(Some(1024), None, None).unwrap();
    dev.ota.supply_chunk(id, &data[..512], true).unwrap();
    dev.ota.supply_chunk(id, &data[512..], false).unwrap();
    let report = dev.ota.finish_update(id).unwrap();

    assert_eq!(dev.ota.status(), UpdateStatus::Success);
    assert_eq!(report.bytes_written, 1024);
    assert_eq!(report.checksum, checksum_of(&data));
    assert_eq!(dev.ota.computed_checksum(), Some(report.checksum));

    let log = dev.sink.log();
    assert_eq!(log.writes.len(), 2);
    assert_eq!(log.writes[0], &data[..512]);
    assert_eq!(log.writes[1], &data[512..]);
    assert_eq!(log.commit_calls, 1);
}

#[test]
fn short_write_needs_cleanup_before_next_update() {
    let dev = device();
    let data = firmware(1024);
    dev.sink.fail_write_at(1, 400);

    let id = dev.ota.begin_update(Some(1024), None, None).unwrap();
    dev.ota.supply_chunk(id, &data[..512], true).unwrap();
    let err = dev.ota.supply_chunk(id, &data[512..], false).unwrap_err();

    assert_eq!(err.kind(), ErrorKind::WriteFailure);
    assert_eq!(dev.ota.status(), UpdateStatus::Error(ErrorKind::WriteFailure));
    assert_eq!(dev.sink.log().abort_calls, 1);
    assert_eq!(dev.sink.log().commit_calls, 0);

    dev.ota.cleanup();
    assert_eq!(dev.ota.status(), UpdateStatus::Idle);
    assert_eq!(dev.sink.log().abort_calls, 1);
}

#[test]
fn status_polling_during_upload() {
    let dev = device();
    let data = firmware(16 * 1024);
    let checksum = checksum_of(&data).sha256_hex();

    let uploader = {
        let ota = dev.ota.clone();
        let data = data.clone();
        thread::spawn(move || {
            let request = UploadRequest {
                content_length: Some(data.len()),
                checksum: Some(checksum),
                token: None,
            };
            let mut handler = UploadHandler::new(ota, request);
            let mut replies = Vec::new();
            for (i, piece) in data.chunks(1024).enumerate() {
                let offset = i * 1024;
                let last = offset + piece.len() == data.len();
                replies.extend(handler.on_chunk("fw.bin", offset, piece, last));
            }
            replies
        })
    };

    // Readers never block on the uploader and always see a consistent pair
    for _ in 0..200 {
        let snapshot = dev.ota.snapshot();
        assert!(snapshot.progress <= 100);
        if snapshot.total > 0 {
            assert!(snapshot.current <= snapshot.total);
        }
        let _ = status_json(&dev.ota).unwrap();
    }

    let replies = uploader.join().unwrap();
    assert_eq!(replies.len(), 1);
    assert_eq!(replies[0].status, 200);
    assert!(replies[0].restart_pending);

    let snapshot = dev.ota.snapshot();
    assert_eq!(snapshot.status, "Success");
    assert_eq!(snapshot.progress, 100);
    assert_eq!(dev.sink.log().committed.as_deref(), Some(data.as_slice()));
}

#[test]
fn failed_update_then_config_recovery() {
    let dev = device();

    let id = dev.ota.begin_update(None, None, None).unwrap();
    let err = dev.ota.supply_chunk(id, b"PK\x03\x04 zip archive", true).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidImage);
    assert_eq!(dev.sink.log().bytes_written(), 0);

    // Backup taken at begin survives a config that got clobbered
    fs::write(&dev.config.config_path, b"garbage").unwrap();
    assert!(dev.ota.attempt_recovery());
    assert_eq!(fs::read(&dev.config.config_path).unwrap(), br#"{"wifi":"home"}"#);

    // A terminal error does not block the next attempt
    let data = firmware(2048);
    let id = dev.ota.begin_update(Some(data.len()), None, None).unwrap();
    dev.ota.supply_chunk(id, &data, true).unwrap();
    dev.ota.finish_update(id).unwrap();
    assert_eq!(dev.ota.status(), UpdateStatus::Success);
}

#[test]
fn staged_file_is_applied_and_removed() {
    let dev = device();
    let data = firmware(10_000);
    fs::write(&dev.config.staged_image_path, &data).unwrap();

    let before = storage_status(&dev.ota, &dev.config.staged_image_path);
    assert!(before.has_update_file);

    let report = dev.ota.update_from_local_file(&dev.config.staged_image_path).unwrap();
    assert_eq!(report.bytes_written, data.len());
    assert_eq!(dev.restarts.load(Ordering::SeqCst), 1);

    let after = storage_status(&dev.ota, &dev.config.staged_image_path);
    assert!(!after.has_update_file);
    assert_eq!(after.status, "Success");
    assert_eq!(dev.sink.log().committed.as_deref(), Some(data.as_slice()));
    assert!(dev.dir.path().join("backup").exists());
}

#[test]
fn bad_staged_file_is_set_aside_without_recovery() {
    let dev = device();
    let staged = &dev.config.staged_image_path;
    fs::write(staged, b"<html>404</html>").unwrap();

    let err = dev.ota.update_from_local_file(staged).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidImage);
    assert_eq!(dev.restarts.load(Ordering::SeqCst), 0);

    // Next boot finds nothing staged and the config is untouched
    assert!(!storage_status(&dev.ota, staged).has_update_file);
    assert!(failed_image_path(staged).exists());
    assert!(dev.ota.backups().list().unwrap().is_empty());
    assert_eq!(fs::read(&dev.config.config_path).unwrap(), br#"{"wifi":"home"}"#);
}

#[test]
fn unreadable_config_leaves_earlier_backup_restorable() {
    let dev = device();
    let data = firmware(512);

    // First update backs up the good config
    let id = dev.ota.begin_update(None, None, None).unwrap();
    dev.ota.supply_chunk(id, &data, true).unwrap();
    dev.ota.finish_update(id).unwrap();
    dev.ota.cleanup();
    assert_eq!(dev.ota.backups().list().unwrap().len(), 1);

    // Config path now exists but cannot be read
    fs::remove_file(&dev.config.config_path).unwrap();
    fs::create_dir(&dev.config.config_path).unwrap();
    let id = dev.ota.begin_update(None, None, None).unwrap();
    dev.ota.supply_chunk(id, &data, true).unwrap();
    dev.ota.finish_update(id).unwrap();
    assert_eq!(dev.ota.backups().list().unwrap().len(), 1);

    fs::remove_dir(&dev.config.config_path).unwrap();
    assert!(dev.ota.attempt_recovery());
    assert_eq!(fs::read(&dev.config.config_path).unwrap(), br#"{"wifi":"home"}"#);
}

#[test]
fn stalled_upload_cannot_corrupt_its_replacement() {
    let dir = TempDir::new().unwrap();
    let config = OtaConfig {
        config_path: dir.path().join("config.json"),
        backup_dir: dir.path().join("backup"),
        update_token: None,
        stale_session_timeout_secs: Some(0),
        ..OtaConfig::default()
    };
    let sink = MemoryFlashSink::new(64 * 1024);
    let ota = Arc::new(UpdateController::new(sink.clone(), &config));
    let old = firmware(4096);
    let mut new = vec![0x11u8; 4096];
    new[0] = ESP_IMAGE_MAGIC;

    let mut stalled = UploadHandler::new(ota.clone(), UploadRequest::default());
    assert!(stalled.on_chunk("old.bin", 0, &old[..2048], false).is_none());

    let mut replacement = UploadHandler::new(
        ota.clone(),
        UploadRequest {
            content_length: Some(new.len()),
            checksum: Some(checksum_of(&new).md5_hex()),
            token: None,
        },
    );
    assert!(replacement.on_chunk("new.bin", 0, &new[..2048], false).is_none());

    let late = stalled.on_chunk("old.bin", 2048, &old[2048..], true).unwrap();
    assert_eq!(late.status, 400);
    assert!(stalled.on_chunk("old.bin", 4096, &old[..16], true).is_none());

    let done = replacement.on_chunk("new.bin", 2048, &new[2048..], true).unwrap();
    assert_eq!(done.status, 200);
    assert_eq!(sink.log().committed.as_deref(), Some(new.as_slice()));
}
