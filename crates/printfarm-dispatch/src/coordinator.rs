// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Readiness polling and file dispatch.
//
// One cycle:
//
//   1. forget which printers were sent to in the previous cycle
//   2. poll every printer in configuration order; a failed poll is logged and
//      the next printer is polled
//   3. for a ready printer not yet sent to this cycle, pop the oldest pending
//      file and upload it
//        - success: remember the printer, delete the file from storage
//        - failure: put the file back at the head of the queue; a file that
//          cannot be opened goes to the back instead, or is dropped if its
//          bytes are gone
//   4. sleep for the poll interval, or stop if shutdown was requested
//
// Shutdown is only honoured between cycles, so an upload in progress always
// runs to completion and its file is either deleted or requeued.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use printfarm_core::error::PrintFarmError;
use printfarm_core::types::{FileId, PendingFile, PrinterEndpoint, PrinterState};

use crate::intake::UploadStore;
use crate::printer_client::PrinterApi;
use crate::queue::PendingFileQueue;

/// One successful upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dispatch {
    pub printer: String,
    pub hostname: String,
    pub file_id: FileId,
    pub file_name: String,
}

/// What happened during a single cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub polled: usize,
    pub ready: usize,
    pub poll_failures: usize,
    pub dispatched: Vec<Dispatch>,
    pub failed_sends: usize,
    pub quarantined: usize,
    /// Queue entries whose bytes were gone from disk.
    pub dropped: usize,
    /// Files still waiting when the cycle ended.
    pub pending: usize,
}

/// Stops a running coordinator between cycles.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    shutdown: Arc<Notify>,
}

impl CoordinatorHandle {
    /// Request a stop.  The current cycle, if any, finishes first.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }
}

/// Polls printers and hands pending files to the ones that are ready.
pub struct DispatchCoordinator<C> {
    client: C,
    endpoints: Vec<PrinterEndpoint>,
    store: UploadStore,
    poll_interval: Duration,
    max_send_attempts: Option<u32>,
    shutdown: Arc<Notify>,
    /// Base URLs that received a file in the current cycle.
    sent_this_cycle: HashSet<String>,
    cycle: u64,
}

impl<C: PrinterApi> DispatchCoordinator<C> {
    /// Create a coordinator over `endpoints`, polled in the given order.
    ///
    /// Pending files are taken from the queue owned by `store`.
    pub fn new(
        client: C,
        endpoints: Vec<PrinterEndpoint>,
        store: UploadStore,
        poll_interval: Duration,
    ) -> Self {
        Self {
            client,
            endpoints,
            store,
            poll_interval,
            max_send_attempts: None,
            shutdown: Arc::new(Notify::new()),
            sent_this_cycle: HashSet::new(),
            cycle: 0,
        }
    }

    /// Move a file to the failed directory once it has failed this many sends.
    pub fn with_max_send_attempts(mut self, max: Option<u32>) -> Self {
        self.max_send_attempts = max;
        self
    }

    pub fn handle(&self) -> CoordinatorHandle {
        CoordinatorHandle {
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    pub fn queue(&self) -> &Arc<PendingFileQueue> {
        self.store.queue()
    }

    /// Run cycles until shutdown is requested.
    pub async fn run(mut self) {
        info!(
            printers = self.endpoints.len(),
            interval_secs = self.poll_interval.as_secs_f64(),
            "monitoring printers"
        );

        loop {
            let report = self.run_cycle().await;
            if report.dispatched.is_empty() && report.failed_sends == 0 {
                debug!(
                    cycle = report.cycle,
                    ready = report.ready,
                    pending = report.pending,
                    "cycle finished"
                );
            } else {
                info!(
                    cycle = report.cycle,
                    dispatched = report.dispatched.len(),
                    failed_sends = report.failed_sends,
                    pending = report.pending,
                    "cycle finished"
                );
            }

            tokio::select! {
                _ = self.shutdown.notified() => {
                    debug!("coordinator received shutdown signal");
                    break;
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!(pending = self.queue().len(), "coordinator stopped");
    }

    /// Poll every printer once and dispatch to those that are ready.
    pub async fn run_cycle(&mut self) -> CycleReport {
        self.cycle += 1;
        self.sent_this_cycle.clear();

        let mut report = CycleReport {
            cycle: self.cycle,
            ..Default::default()
        };

        for endpoint in &self.endpoints {
            report.polled += 1;

            let state = match self.client.get_status(endpoint).await {
                Ok(state) => state,
                Err(e) => {
                    warn!(
                        printer = %endpoint.label(),
                        kind = ?e.kind(),
                        error = %e,
                        "printer poll failed"
                    );
                    report.poll_failures += 1;
                    continue;
                }
            };

            if !state.status.is_ready() {
                debug!(
                    printer = %state.display_name(),
                    status = ?state.status,
                    message = %state.raw_message,
                    "printer not ready"
                );
                continue;
            }
            report.ready += 1;

            if self.sent_this_cycle.contains(&endpoint.base_url) {
                continue;
            }

            let Some(file) = self.store.queue().try_pop() else {
                debug!(printer = %state.display_name(), "printer ready, nothing pending");
                continue;
            };

            match self.client.send_file(endpoint, &file).await {
                Ok(()) => {
                    self.sent_this_cycle.insert(endpoint.base_url.clone());
                    report.dispatched.push(self.complete(&state, file).await);
                }
                Err(e) => {
                    report.failed_sends += 1;
                    match self.fail(&state, file, &e).await {
                        FailOutcome::Requeued => {}
                        FailOutcome::Quarantined => report.quarantined += 1,
                        FailOutcome::Dropped => report.dropped += 1,
                    }
                }
            }
        }

        report.pending = self.store.queue().len();
        report
    }

    /// Bookkeeping after a confirmed upload.
    async fn complete(&self, state: &PrinterState, file: PendingFile) -> Dispatch {
        info!(
            printer = %state.endpoint.label(),
            hostname = %state.display_name(),
            file = %file.file_name,
            "file sent to printer"
        );

        // The printer has the file; a leftover copy must not be requeued,
        // not even by `recover` after a restart.
        if let Err(e) = self.store.retire(&file).await {
            error!(file_id = %file.id, error = %e, "sent file is still in the upload directory");
        }

        Dispatch {
            printer: state.endpoint.base_url.clone(),
            hostname: state.display_name().to_string(),
            file_id: file.id,
            file_name: file.file_name,
        }
    }

    /// Requeue (or quarantine) a file whose upload failed.
    async fn fail(
        &self,
        state: &PrinterState,
        mut file: PendingFile,
        err: &PrintFarmError,
    ) -> FailOutcome {
        file.send_attempts += 1;

        if let PrintFarmError::OpenFailed(_) = err {
            // Nothing left to send; keeping the entry would block the queue head.
            if !tokio::fs::try_exists(&file.path).await.unwrap_or(true) {
                error!(
                    file_id = %file.id,
                    file = %file.file_name,
                    path = %file.path.display(),
                    "pending file vanished from storage, dropping it from the queue"
                );
                return FailOutcome::Dropped;
            }

            // Unreadable for some other reason; let the files behind it go first.
            warn!(
                file = %file.file_name,
                attempts = file.send_attempts,
                error = %err,
                "pending file could not be opened, moved to back of queue"
            );
            if self.exhausted(&file) {
                return self.quarantine_or_requeue(file).await;
            }
            self.store.queue().push(file);
            return FailOutcome::Requeued;
        }

        warn!(
            printer = %state.display_name(),
            file = %file.file_name,
            attempts = file.send_attempts,
            kind = ?err.kind(),
            error = %err,
            "send failed, file stays queued"
        );

        if !self.exhausted(&file) {
            self.store.queue().push_front(file);
            return FailOutcome::Requeued;
        }
        self.quarantine_or_requeue(file).await
    }

    fn exhausted(&self, file: &PendingFile) -> bool {
        self.max_send_attempts
            .is_some_and(|max| file.send_attempts >= max)
    }

    async fn quarantine_or_requeue(&self, file: PendingFile) -> FailOutcome {
        match self.store.quarantine(&file).await {
            Ok(_) => FailOutcome::Quarantined,
            Err(e) => {
                error!(file_id = %file.id, error = %e, "quarantine failed, keeping file queued");
                self.store.queue().push(file);
                FailOutcome::Requeued
            }
        }
    }
}

/// What became of a file after a failed send.
enum FailOutcome {
    Requeued,
    Quarantined,
    Dropped,
}
