// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Service layer: wires configuration, the upload intake and the dispatch
// coordinator together for the daemon.

pub mod config_path;
pub mod farm_services;
