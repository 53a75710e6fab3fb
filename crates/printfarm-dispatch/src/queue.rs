// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// In-memory hand-off queue between the upload intake and the dispatch loop.
//
// The queue only holds metadata; the bytes live in the upload directory and
// survive restarts (see `UploadStore::recover`).  It is the single piece of
// mutable state shared between the intake server and the coordinator, and is
// passed to both by `Arc` from the composition root.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use printfarm_core::types::PendingFile;

/// FIFO of files waiting for a ready printer.
///
/// Every pushed item is handed to exactly one successful `try_pop`.  A file
/// whose send failed goes back to the front with `push_front` so it keeps its
/// place as the oldest upload.
#[derive(Debug, Default)]
pub struct PendingFileQueue {
    files: Mutex<VecDeque<PendingFile>>,
}

impl PendingFileQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a newly stored file.  Never drops.
    pub fn push(&self, file: PendingFile) {
        info!(file_id = %file.id, name = %file.file_name, "file queued for dispatch");
        self.lock().push_back(file);
    }

    /// Return a file to the head of the queue after a failed send.
    pub fn push_front(&self, file: PendingFile) {
        debug!(
            file_id = %file.id,
            attempts = file.send_attempts,
            "file returned to head of queue"
        );
        self.lock().push_front(file);
    }

    /// Take the oldest file, if any.
    pub fn try_pop(&self) -> Option<PendingFile> {
        self.lock().pop_front()
    }

    /// Number of files waiting.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of the queue contents, oldest first.
    pub fn snapshot(&self) -> Vec<PendingFile> {
        self.lock().iter().cloned().collect()
    }

    // A panic while holding the lock cannot leave the deque half-modified, so
    // the files inside are still valid and must not be lost.
    fn lock(&self) -> MutexGuard<'_, VecDeque<PendingFile>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
