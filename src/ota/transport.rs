// Transport-facing adapters: chunked upload delivery and status reports
//
// The HTTP layer owns routing; it creates one `UploadHandler` per upload
// request and forwards every (filename, offset, bytes, final) callback.

use serde::Serialize;
use std::path::Path;
use std::sync::Arc;

use super::controller::UpdateController;
use super::flash::FlashWriteSink;
use super::session::{SessionId, StatusSnapshot, UpdateError};

/// Parameters that arrive with an upload request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadRequest {
    pub content_length: Option<usize>,
    /// Expected MD5 or SHA-256 hex, either case
    pub checksum: Option<String>,
    pub token: Option<String>,
}

/// Response a transport should send for an upload request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReply {
    pub status: u16,
    pub body: String,
    /// Set once the image is committed; restart after the reply is sent
    pub restart_pending: bool,
}

impl UploadReply {
    fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            restart_pending: true,
        }
    }

    fn error(error: &UpdateError) -> Self {
        Self {
            status: error.kind().http_status(),
            body: error.message().to_string(),
            restart_pending: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Waiting,
    Streaming(SessionId),
    Answered,
}

/// Drives the controller from one upload request's chunk callbacks.
pub struct UploadHandler<S: FlashWriteSink> {
    controller: Arc<UpdateController<S>>,
    request: UploadRequest,
    phase: Phase,
}

impl<S: FlashWriteSink> UploadHandler<S> {
    pub fn new(controller: Arc<UpdateController<S>>, request: UploadRequest) -> Self {
        Self {
            controller,
            request,
            phase: Phase::Waiting,
        }
    }

    /// Handle one chunk. Returns the reply once the request is decided;
    /// `None` means keep streaming. After a reply, later chunks of the same
    /// request are ignored so they can never leak into another session.
    pub fn on_chunk(
        &mut self,
        filename: &str,
        offset: usize,
        data: &[u8],
        is_final: bool,
    ) -> Option<UploadReply> {
        let id = match self.phase {
            Phase::Answered => return None,
            Phase::Waiting if offset != 0 => {
                log::warn!("OTA: Upload of {} did not start at offset 0", filename);
                self.phase = Phase::Answered;
                return Some(UploadReply {
                    status: 400,
                    body: "Upload must start at offset 0".to_string(),
                    restart_pending: false,
                });
            }
            Phase::Waiting => {
                log::info!("OTA: Filename: {}", filename);
                let started = self.controller.begin_update(
                    self.request.content_length,
                    self.request.checksum.as_deref(),
                    self.request.token.as_deref(),
                );
                match started {
                    Ok(id) => {
                        self.phase = Phase::Streaming(id);
                        id
                    }
                    Err(e) => return Some(self.answer(UploadReply::error(&e))),
                }
            }
            Phase::Streaming(id) => id,
        };

        if let Err(e) = self.controller.supply_chunk(id, data, offset == 0) {
            return Some(self.answer(UploadReply::error(&e)));
        }

        if !is_final {
            return None;
        }

        let reply = match self.controller.finish_update(id) {
            Ok(_) => UploadReply::ok("Update successful"),
            Err(e) => UploadReply::error(&e),
        };
        Some(self.answer(reply))
    }

    fn answer(&mut self, reply: UploadReply) -> UploadReply {
        self.phase = Phase::Answered;
        reply
    }
}

/// Whether an image is staged on local storage.
pub fn has_update_file(path: &Path) -> bool {
    path.is_file()
}

/// Body of the update status query.
pub fn status_json<S: FlashWriteSink>(controller: &UpdateController<S>) -> serde_json::Result<String> {
    let snapshot: StatusSnapshot = controller.snapshot();
    serde_json::to_string(&snapshot)
}

/// Local-storage view reported alongside the update status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStatus {
    pub has_update_file: bool,
    pub is_updating: bool,
    pub status: String,
    pub version: &'static str,
}

pub fn storage_status<S: FlashWriteSink>(
    controller: &UpdateController<S>,
    staged_image: &Path,
) -> StorageStatus {
    StorageStatus {
        has_update_file: has_update_file(staged_image),
        is_updating: controller.is_updating(),
        status: controller.status().label().to_string(),
        version: crate::version::DISPLAY_VERSION,
    }
}
