// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Printfarm Dispatch: printer HTTP client, upload intake, pending-file queue
// and the polling coordinator that matches uploads to ready printers.  This
// crate bridges between the core domain types defined in `printfarm-core` and
// the printers on the network.

pub mod coordinator;
pub mod intake;
pub mod intake_server;
pub mod printer_client;
pub mod queue;

pub use coordinator::{CoordinatorHandle, CycleReport, DispatchCoordinator};
pub use intake::UploadStore;
pub use intake_server::IntakeServer;
pub use printer_client::{PrinterApi, PrinterClient};
pub use queue::PendingFileQueue;
