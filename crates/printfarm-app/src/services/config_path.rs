// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Configuration file resolution.

use std::path::{Path, PathBuf};

/// Environment variable naming the configuration file explicitly.
pub const ENV_CONFIG_PATH: &str = "PRINTFARM_CONFIG";

pub const CONFIG_FILE_NAME: &str = "printfarm.json";

/// Return the configuration file to load.
///
/// `PRINTFARM_CONFIG` wins; then `printfarm.json` in the working directory;
/// then the XDG config location.  The file need not exist.
pub fn config_path() -> PathBuf {
    resolve(|key| std::env::var(key).ok(), Path::new("."))
}

fn resolve<F>(lookup: F, cwd: &Path) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(explicit) = non_empty(ENV_CONFIG_PATH) {
        return PathBuf::from(explicit);
    }

    let local = cwd.join(CONFIG_FILE_NAME);
    if local.is_file() {
        return local;
    }

    let config_home = non_empty("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| non_empty("HOME").map(|home| PathBuf::from(home).join(".config")));

    match config_home {
        Some(base) => base.join("printfarm").join(CONFIG_FILE_NAME),
        None => local,
    }
}
