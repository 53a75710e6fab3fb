// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Composition root.  Builds the printer client, upload store, intake server
// and dispatch coordinator from one `FarmConfig`, and owns their lifecycle:
//
//   init      validate config, construct everything (nothing bound yet)
//   start     create the upload dir, re-queue leftovers, bind the intake
//             server, spawn the coordinator loop
//   shutdown  stop taking uploads, then stop the coordinator after its
//             current cycle

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;

use printfarm_core::FarmConfig;
use printfarm_core::error::{PrintFarmError, Result};
use printfarm_core::types::ServerStatus;
use printfarm_dispatch::coordinator::{CoordinatorHandle, DispatchCoordinator};
use printfarm_dispatch::{IntakeServer, PendingFileQueue, PrinterClient, UploadStore};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Load the configuration file and apply environment overrides.
pub fn load_config(path: &Path) -> Result<FarmConfig> {
    let mut config = FarmConfig::load(path)?;
    config.apply_env()?;
    config.validate()?;
    Ok(config)
}

/// Everything the daemon runs.
pub struct FarmServices {
    store: UploadStore,
    server: IntakeServer,
    coordinator: Option<DispatchCoordinator<PrinterClient>>,
    coordinator_handle: CoordinatorHandle,
    coordinator_task: Option<JoinHandle<()>>,
    printers: usize,
}

impl FarmServices {
    /// Build all services from `config`.  Fails on an invalid configuration.
    pub fn init(config: &FarmConfig) -> Result<Self> {
        let endpoints = config.endpoints()?;

        let client = PrinterClient::new(config.request_timeout())?
            .with_upload_timeout(config.upload_timeout())
            .with_start_print(config.start_print_after_upload);

        let queue = Arc::new(PendingFileQueue::new());
        let store = UploadStore::new(config.upload_dir.clone(), queue);

        let server = IntakeServer::new(
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.listen_port)),
            store.clone(),
            client.clone(),
            Arc::new(endpoints.clone()),
        );

        let printers = endpoints.len();
        let coordinator =
            DispatchCoordinator::new(client, endpoints, store.clone(), config.poll_interval())
                .with_max_send_attempts(config.max_send_attempts);
        let coordinator_handle = coordinator.handle();

        info!(
            printers,
            upload_dir = %config.upload_dir.display(),
            port = config.listen_port,
            "farm services initialised"
        );

        Ok(Self {
            store,
            server,
            coordinator: Some(coordinator),
            coordinator_handle,
            coordinator_task: None,
            printers,
        })
    }

    /// Start taking uploads and dispatching.  Returns the intake address.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        let coordinator = self.coordinator.take().ok_or_else(|| {
            PrintFarmError::IntakeServer("farm services already started".into())
        })?;

        self.store.ensure_dirs().await?;
        let recovered = self.store.recover().await?;
        if recovered > 0 {
            info!(recovered, "re-queued files left from a previous run");
        }

        let addr = self.server.start().await?;
        self.coordinator_task = Some(tokio::spawn(coordinator.run()));

        info!(addr = %addr, printers = self.printers, "printfarm running");
        Ok(addr)
    }

    /// Stop the intake server, then the coordinator.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.server.stop().await?;

        self.coordinator_handle.shutdown();
        if let Some(task) = self.coordinator_task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "coordinator task ended abnormally");
            }
        }

        if self.pending() > 0 {
            info!(pending = self.pending(), "files remain queued for the next run");
        }
        Ok(())
    }

    pub fn server_status(&self) -> ServerStatus {
        self.server.status()
    }

    pub fn pending(&self) -> usize {
        self.store.queue().len()
    }
}
