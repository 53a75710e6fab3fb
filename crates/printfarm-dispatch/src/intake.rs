// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Durable storage side of the upload intake.
//
// Uploads are streamed into `<dir>/.incoming/<uuid>.part`, synced, and then
// renamed into `<dir>` under a name of the form
//
//     <arrival-millis>-<uuid>-<original name>
//
// Only complete files ever appear in `<dir>`, so a crash mid-upload never
// leaves a truncated file that would later be dispatched.  The name embeds a
// fresh UUID and is therefore unique per upload; concurrent uploads of the
// same original name never collide.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use chrono::{DateTime, Utc};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use printfarm_core::error::{PrintFarmError, Result};
use printfarm_core::types::{FileId, PendingFile};

use crate::queue::PendingFileQueue;

/// Subdirectory for uploads still being written.
const INCOMING_DIR: &str = ".incoming";

/// Subdirectory for files that exhausted their send attempts.
const FAILED_DIR: &str = "failed";

/// Subdirectory for sent files that could not be deleted.
const SENT_DIR: &str = "sent";

/// Fallback when the submitted name sanitises to nothing.
const FALLBACK_NAME: &str = "upload";

/// Longest original name we keep, in characters.
const MAX_NAME_CHARS: usize = 200;

/// Writes uploads to the upload directory and hands them to the queue.
#[derive(Debug, Clone)]
pub struct UploadStore {
    dir: PathBuf,
    queue: Arc<PendingFileQueue>,
}

/// An upload that is being written.  Call [`IncomingUpload::finish`] once all
/// bytes are in, or [`IncomingUpload::abort`] to discard it.
pub struct IncomingUpload {
    file: File,
    part_path: PathBuf,
    final_path: PathBuf,
    id: Uuid,
    file_name: String,
    arrival_time: DateTime<Utc>,
    written: u64,
    queue: Arc<PendingFileQueue>,
}

impl UploadStore {
    pub fn new(dir: impl Into<PathBuf>, queue: Arc<PendingFileQueue>) -> Self {
        Self {
            dir: dir.into(),
            queue,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn queue(&self) -> &Arc<PendingFileQueue> {
        &self.queue
    }

    /// Create the upload directory and its staging subdirectory.
    pub async fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(self.dir.join(INCOMING_DIR))
            .await
            .map_err(|e| storage_err("create upload directory", &self.dir, e))
    }

    /// Start a new upload for a file submitted as `original_name`.
    #[instrument(skip(self), fields(dir = %self.dir.display()))]
    pub async fn begin(&self, original_name: &str) -> Result<IncomingUpload> {
        self.ensure_dirs().await?;

        let id = Uuid::new_v4();
        let file_name = sanitize_file_name(original_name);
        let arrival_time = Utc::now();
        let part_path = self.dir.join(INCOMING_DIR).join(format!("{}.part", id.simple()));
        let final_path = self.dir.join(stored_name(arrival_time, id, &file_name));

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&part_path)
            .await
            .map_err(|e| storage_err("create", &part_path, e))?;

        debug!(part = %part_path.display(), name = %file_name, "upload started");
        Ok(IncomingUpload {
            file,
            part_path,
            final_path,
            id,
            file_name,
            arrival_time,
            written: 0,
            queue: Arc::clone(&self.queue),
        })
    }

    /// Store a complete in-memory payload and enqueue it.
    pub async fn store_bytes(&self, original_name: &str, data: &[u8]) -> Result<PendingFile> {
        let mut upload = self.begin(original_name).await?;
        if let Err(e) = upload.write_chunk(data).await {
            upload.abort().await;
            return Err(e);
        }
        upload.finish().await
    }

    /// Delete a file that was sent successfully.  Missing files are fine.
    pub async fn remove(&self, file: &PendingFile) -> Result<()> {
        match fs::remove_file(&file.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(storage_err("remove", &file.path, e)),
        }
    }

    /// Get a sent file out of the queueable part of the upload directory.
    ///
    /// Deletes it, or if that fails, moves it into `sent/` so `recover`
    /// never dispatches it a second time.
    pub async fn retire(&self, file: &PendingFile) -> Result<()> {
        let err = match self.remove(file).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        warn!(file_id = %file.id, error = %err, "could not delete sent file, moving it aside");

        let sent_dir = self.dir.join(SENT_DIR);
        fs::create_dir_all(&sent_dir)
            .await
            .map_err(|e| storage_err("create", &sent_dir, e))?;
        let target = sent_dir.join(file.path.file_name().unwrap_or_default());
        fs::rename(&file.path, &target)
            .await
            .map_err(|e| storage_err("move aside", &file.path, e))?;

        info!(file_id = %file.id, target = %target.display(), "sent file moved to sent directory");
        Ok(())
    }

    /// Move a file that keeps failing out of the way, into `failed/`.
    ///
    /// The bytes are kept so an operator can inspect or resubmit them.
    pub async fn quarantine(&self, file: &PendingFile) -> Result<PathBuf> {
        let failed_dir = self.dir.join(FAILED_DIR);
        fs::create_dir_all(&failed_dir)
            .await
            .map_err(|e| storage_err("create", &failed_dir, e))?;

        let name = file
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| file.id.to_string().into());
        let target = failed_dir.join(name);
        fs::rename(&file.path, &target)
            .await
            .map_err(|e| storage_err("quarantine", &file.path, e))?;

        warn!(file_id = %file.id, target = %target.display(), "file moved to failed directory");
        Ok(target)
    }

    /// Re-enqueue every complete file already present in the upload directory.
    ///
    /// Runs once at startup, before the intake server accepts anything.  Files
    /// are queued oldest first: by the arrival stamp in their name, or by
    /// modification time for files copied in by hand.  Leftover `.part` files
    /// from an interrupted upload are deleted.
    #[instrument(skip(self), fields(dir = %self.dir.display()))]
    pub async fn recover(&self) -> Result<usize> {
        self.ensure_dirs().await?;
        self.clear_incoming().await;

        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|e| storage_err("read", &self.dir, e))?;

        let mut found = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| storage_err("read", &self.dir, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let meta = entry
                .metadata()
                .await
                .map_err(|e| storage_err("stat", &entry.path(), e))?;
            if !meta.is_file() {
                continue;
            }

            let modified = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .and_then(|d| DateTime::from_timestamp_millis(d.as_millis() as i64))
                .unwrap_or_else(Utc::now);

            let (arrival_time, id, file_name) = match parse_stored_name(&name) {
                Some((arrival, id, original)) => (arrival, FileId(id), original),
                None => (modified, FileId::new(), name.clone()),
            };

            found.push(PendingFile {
                id,
                path: entry.path(),
                file_name,
                arrival_time,
                size_bytes: meta.len(),
                send_attempts: 0,
            });
        }

        found.sort_by(|a, b| {
            a.arrival_time
                .cmp(&b.arrival_time)
                .then_with(|| a.path.cmp(&b.path))
        });

        let count = found.len();
        for file in found {
            self.queue.push(file);
        }

        info!(count, "recovered pending uploads");
        Ok(count)
    }

    async fn clear_incoming(&self) {
        let incoming = self.dir.join(INCOMING_DIR);
        let Ok(mut entries) = fs::read_dir(&incoming).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if let Err(e) = fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "could not remove stale partial upload");
            } else {
                debug!(path = %path.display(), "removed stale partial upload");
            }
        }
    }
}

impl IncomingUpload {
    /// Append bytes to the upload.
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.file
            .write_all(chunk)
            .await
            .map_err(|e| storage_err("write", &self.part_path, e))?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Sanitised name the upload will be dispatched under.
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Sync the bytes, move the file into the upload directory and enqueue it.
    pub async fn finish(mut self) -> Result<PendingFile> {
        if let Err(e) = self.commit().await {
            self.discard_part().await;
            return Err(e);
        }

        let file = PendingFile {
            id: FileId(self.id),
            path: self.final_path.clone(),
            file_name: self.file_name.clone(),
            arrival_time: self.arrival_time,
            size_bytes: self.written,
            send_attempts: 0,
        };
        info!(
            file_id = %file.id,
            name = %file.file_name,
            bytes = file.size_bytes,
            "upload stored"
        );
        self.queue.push(file.clone());
        Ok(file)
    }

    /// Throw the partial upload away.
    pub async fn abort(self) {
        debug!(part = %self.part_path.display(), "upload aborted");
        self.discard_part().await;
    }

    async fn commit(&mut self) -> Result<()> {
        self.file
            .flush()
            .await
            .map_err(|e| storage_err("flush", &self.part_path, e))?;
        self.file
            .sync_all()
            .await
            .map_err(|e| storage_err("sync", &self.part_path, e))?;

        if fs::try_exists(&self.final_path).await.unwrap_or(false) {
            return Err(PrintFarmError::StorageFailed(format!(
                "{} already exists",
                self.final_path.display()
            )));
        }

        fs::rename(&self.part_path, &self.final_path)
            .await
            .map_err(|e| storage_err("rename", &self.part_path, e))
    }

    async fn discard_part(&self) {
        if let Err(e) = fs::remove_file(&self.part_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(part = %self.part_path.display(), error = %e, "could not remove partial upload");
            }
        }
    }
}

fn storage_err(action: &str, path: &Path, e: std::io::Error) -> PrintFarmError {
    PrintFarmError::StorageFailed(format!("{action} {}: {e}", path.display()))
}

/// Reduce a client-supplied name to a safe single path component.
pub fn sanitize_file_name(original: &str) -> String {
    let base = original
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();

    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | ' ') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_NAME_CHARS)
        .collect();

    let cleaned = cleaned.trim_start_matches('.').trim();
    if cleaned.is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        cleaned.to_string()
    }
}

fn stored_name(arrival: DateTime<Utc>, id: Uuid, file_name: &str) -> String {
    format!("{:013}-{}-{}", arrival.timestamp_millis(), id.simple(), file_name)
}

fn parse_stored_name(name: &str) -> Option<(DateTime<Utc>, Uuid, String)> {
    let (millis, rest) = name.split_once('-')?;
    let (id, original) = rest.split_once('-')?;
    if original.is_empty() {
        return None;
    }
    let arrival = DateTime::from_timestamp_millis(millis.parse().ok()?)?;
    let id = Uuid::try_parse(id).ok()?;
    Some((arrival, id, original.to_string()))
}
