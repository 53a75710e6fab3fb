// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Dispatcher configuration.
//
// Settings come from an optional JSON file and are then overridden by
// environment variables.  `PRINTER_URLS` is a plain comma-separated list so a
// farm can be run from the environment alone.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{PrintFarmError, Result};
use crate::types::{DEFAULT_STATUS_PATH, DEFAULT_UPLOAD_PATH, PrinterEndpoint};

/// Comma-separated list of printer base URLs; replaces the configured printers.
pub const ENV_PRINTER_URLS: &str = "PRINTER_URLS";
/// Polling interval in whole seconds.
pub const ENV_POLL_INTERVAL: &str = "PRINTFARM_POLL_INTERVAL_SECS";
/// Port for the upload intake server.
pub const ENV_LISTEN_PORT: &str = "PRINTFARM_LISTEN_PORT";
/// Directory holding pending uploads.
pub const ENV_UPLOAD_DIR: &str = "PRINTFARM_UPLOAD_DIR";
/// API key applied to every printer that has none of its own.
pub const ENV_API_KEY: &str = "PRINTFARM_API_KEY";

/// Longest request timeout we accept; anything above would stall a cycle.
const MAX_REQUEST_TIMEOUT_SECS: u64 = 60;

/// One configured printer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrinterConfig {
    /// Base URL of the printer controller.
    pub url: String,
    /// Optional display name used in logs.
    pub name: Option<String>,
    /// Optional `X-Api-Key` credential.
    pub api_key: Option<String>,
    /// Override of the status path (default `/printer/info`).
    pub status_path: Option<String>,
    /// Override of the upload path (default `/server/files/upload`).
    pub upload_path: Option<String>,
}

impl PrinterConfig {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// Persistent dispatcher settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FarmConfig {
    /// Printers in the order they are polled.
    pub printers: Vec<PrinterConfig>,
    /// Seconds between polling cycles.
    pub poll_interval_secs: u64,
    /// Per-request timeout for printer status calls.
    pub request_timeout_secs: u64,
    /// Timeout for a whole file upload to a printer.
    pub upload_timeout_secs: u64,
    /// Directory where uploads wait for a printer.
    pub upload_dir: PathBuf,
    /// TCP port of the upload intake server.
    pub listen_port: u16,
    /// Ask the printer to start printing right after the upload.
    pub start_print_after_upload: bool,
    /// Move a file to `failed/` after this many failed sends. `None` retries forever.
    pub max_send_attempts: Option<u32>,
}

impl Default for FarmConfig {
    fn default() -> Self {
        Self {
            printers: Vec::new(),
            poll_interval_secs: 10,
            request_timeout_secs: 10,
            upload_timeout_secs: 300,
            upload_dir: PathBuf::from("uploads"),
            listen_port: 8081,
            start_print_after_upload: false,
            max_send_attempts: None,
        }
    }
}

impl FarmConfig {
    /// Load settings from a JSON file.
    ///
    /// A missing file yields the defaults; a file that exists but does not
    /// parse is a configuration error.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(PrintFarmError::ConfigInvalid(format!(
                    "read {}: {e}",
                    path.display()
                )));
            }
        };

        let config = serde_json::from_str(&data).map_err(|e| {
            PrintFarmError::ConfigInvalid(format!("parse {}: {e}", path.display()))
        })?;
        info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Apply overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(urls) = lookup(ENV_PRINTER_URLS) {
            self.printers = urls
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(PrinterConfig::from_url)
                .collect();
        }

        if let Some(raw) = lookup(ENV_POLL_INTERVAL) {
            self.poll_interval_secs = parse_number(ENV_POLL_INTERVAL, &raw)?;
        }

        if let Some(raw) = lookup(ENV_LISTEN_PORT) {
            self.listen_port = parse_number(ENV_LISTEN_PORT, &raw)?;
        }

        if let Some(dir) = lookup(ENV_UPLOAD_DIR).filter(|d| !d.trim().is_empty()) {
            self.upload_dir = PathBuf::from(dir);
        }

        if let Some(key) = lookup(ENV_API_KEY).filter(|k| !k.is_empty()) {
            for printer in self.printers.iter_mut().filter(|p| p.api_key.is_none()) {
                printer.api_key = Some(key.clone());
            }
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn upload_timeout(&self) -> Duration {
        Duration::from_secs(self.upload_timeout_secs)
    }

    /// Check the settings that do not involve printer URLs.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            return Err(PrintFarmError::ConfigInvalid(
                "poll interval must be at least one second".into(),
            ));
        }
        if !(1..=MAX_REQUEST_TIMEOUT_SECS).contains(&self.request_timeout_secs) {
            return Err(PrintFarmError::ConfigInvalid(format!(
                "request timeout must be between 1 and {MAX_REQUEST_TIMEOUT_SECS} seconds"
            )));
        }
        if self.upload_timeout_secs == 0 {
            return Err(PrintFarmError::ConfigInvalid(
                "upload timeout must be at least one second".into(),
            ));
        }
        if self.max_send_attempts == Some(0) {
            return Err(PrintFarmError::ConfigInvalid(
                "max_send_attempts must be at least 1 when set".into(),
            ));
        }
        Ok(())
    }

    /// Build the ordered endpoint list, validating everything on the way.
    pub fn endpoints(&self) -> Result<Vec<PrinterEndpoint>> {
        self.validate()?;

        if self.printers.is_empty() {
            return Err(PrintFarmError::ConfigInvalid(
                "no printers configured".into(),
            ));
        }

        let mut seen = HashSet::new();
        let mut endpoints = Vec::with_capacity(self.printers.len());
        for printer in &self.printers {
            let mut endpoint = PrinterEndpoint::parse(&printer.url)?;
            if !seen.insert(endpoint.base_url.clone()) {
                return Err(PrintFarmError::ConfigInvalid(format!(
                    "printer '{}' is listed twice",
                    endpoint.base_url
                )));
            }

            endpoint.name = printer.name.clone().filter(|n| !n.is_empty());
            endpoint.api_key = printer.api_key.clone().filter(|k| !k.is_empty());
            endpoint.status_path = printer
                .status_path
                .clone()
                .unwrap_or_else(|| DEFAULT_STATUS_PATH.into());
            endpoint.upload_path = printer
                .upload_path
                .clone()
                .unwrap_or_else(|| DEFAULT_UPLOAD_PATH.into());
            endpoints.push(endpoint);
        }

        Ok(endpoints)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| PrintFarmError::ConfigInvalid(format!("{key}: '{raw}' is not a number")))
}
