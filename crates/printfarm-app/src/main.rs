// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Printfarm: 3D printer farm dispatcher
//
// Entry point. Initialises logging, loads configuration, starts the upload
// intake and the dispatch loop, and runs until Ctrl-C.

mod services;

use std::process::ExitCode;

use services::config_path::config_path;
use services::farm_services::{FarmServices, load_config};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Printfarm starting");

    let path = config_path();
    let config = match load_config(&path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "invalid configuration");
            return ExitCode::FAILURE;
        }
    };

    let mut farm = match FarmServices::init(&config) {
        Ok(farm) => farm,
        Err(e) => {
            tracing::error!(error = %e, kind = ?e.kind(), "could not initialise services");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = farm.start().await {
        tracing::error!(error = %e, "could not start services");
        return ExitCode::FAILURE;
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "cannot listen for Ctrl-C, shutting down");
    }
    tracing::info!("shutdown requested");

    match farm.shutdown().await {
        Ok(()) => {
            tracing::info!(
                intake = ?farm.server_status(),
                pending = farm.pending(),
                "Printfarm stopped"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "unclean shutdown");
            ExitCode::FAILURE
        }
    }
}
