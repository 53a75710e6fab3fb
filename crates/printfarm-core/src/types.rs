// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for the Printfarm dispatcher.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PrintFarmError, Result};

/// Default status query path (Moonraker `printer/info`).
pub const DEFAULT_STATUS_PATH: &str = "/printer/info";

/// Default upload path (Moonraker file manager).
pub const DEFAULT_UPLOAD_PATH: &str = "/server/files/upload";

/// Vendor token reported in `result.state` when the printer can take a job.
pub const READY_TOKEN: &str = "ready";

/// Unique identifier for a pending file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId(pub Uuid);

impl FileId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for FileId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A configured printer controller.
///
/// Immutable once built; the coordinator only ever reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrinterEndpoint {
    /// Base URL without a trailing slash, e.g. `http://ender.local`.
    pub base_url: String,
    /// Optional display name. Falls back to the hostname reported by the printer.
    pub name: Option<String>,
    /// Value for the `X-Api-Key` header, when the printer requires one.
    pub api_key: Option<String>,
    /// Path of the status query, appended to `base_url`.
    pub status_path: String,
    /// Path of the multipart upload, appended to `base_url`.
    pub upload_path: String,
}

impl PrinterEndpoint {
    /// Validate and normalise a printer base URL.
    ///
    /// Only `http` and `https` are accepted and the host part must be
    /// non-empty.  Trailing slashes are dropped.  Query strings and fragments
    /// are refused since request paths are appended to the base URL.
    pub fn parse(url: &str) -> Result<Self> {
        let trimmed = url.trim().trim_end_matches('/');
        if trimmed.contains(['?', '#']) {
            return Err(PrintFarmError::ConfigInvalid(format!(
                "printer URL '{url}' must not contain a query or fragment"
            )));
        }
        let rest = trimmed
            .strip_prefix("http://")
            .or_else(|| trimmed.strip_prefix("https://"))
            .ok_or_else(|| {
                PrintFarmError::ConfigInvalid(format!(
                    "printer URL '{url}' must start with http:// or https://"
                ))
            })?;

        let host = rest.split('/').next().unwrap_or_default();
        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(PrintFarmError::ConfigInvalid(format!(
                "printer URL '{url}' has no usable host"
            )));
        }

        Ok(Self {
            base_url: trimmed.to_string(),
            name: None,
            api_key: None,
            status_path: DEFAULT_STATUS_PATH.into(),
            upload_path: DEFAULT_UPLOAD_PATH.into(),
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn status_url(&self) -> String {
        join_url(&self.base_url, &self.status_path)
    }

    pub fn upload_url(&self) -> String {
        join_url(&self.base_url, &self.upload_path)
    }

    /// Name used in log lines: configured name, else the base URL.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.base_url)
    }
}

fn join_url(base: &str, path: &str) -> String {
    if path.starts_with('/') {
        format!("{base}{path}")
    } else {
        format!("{base}/{path}")
    }
}

/// Printer readiness as classified from one status poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrinterStatus {
    /// Idle and able to accept a new file.
    Ready,
    /// Reachable but doing something else (printing, starting up).
    Busy,
    /// Controller reports an error or shutdown state.
    Error,
    /// The poll itself failed.
    Unreachable,
}

impl PrinterStatus {
    /// Map the vendor's `result.state` token onto a status.
    ///
    /// Only an exact `"ready"` counts as ready.
    pub fn from_vendor_state(state: &str) -> Self {
        match state {
            READY_TOKEN => Self::Ready,
            "error" | "shutdown" => Self::Error,
            _ => Self::Busy,
        }
    }

    pub fn is_ready(&self) -> bool {
        *self == Self::Ready
    }
}

/// Fresh snapshot of one printer, produced by a single poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrinterState {
    pub endpoint: PrinterEndpoint,
    pub status: PrinterStatus,
    /// Hostname reported by the controller, if any.
    pub hostname: Option<String>,
    /// Raw `state_message` from the controller.
    pub raw_message: String,
}

impl PrinterState {
    /// Hostname for display, falling back to the endpoint label.
    pub fn display_name(&self) -> &str {
        self.hostname
            .as_deref()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| self.endpoint.label())
    }
}

/// A stored upload waiting for a ready printer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingFile {
    pub id: FileId,
    /// Location of the bytes in the upload directory.
    pub path: PathBuf,
    /// Name the file was submitted with; used as the upload filename.
    pub file_name: String,
    pub arrival_time: DateTime<Utc>,
    pub size_bytes: u64,
    /// Failed dispatch attempts so far.
    pub send_attempts: u32,
}

impl PendingFile {
    pub fn new(path: PathBuf, file_name: String, size_bytes: u64) -> Self {
        Self {
            id: FileId::new(),
            path,
            file_name,
            arrival_time: Utc::now(),
            size_bytes,
            send_attempts: 0,
        }
    }
}

/// Lifecycle of the upload intake server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerStatus {
    Stopped,
    Starting,
    Running,
    Error,
}
