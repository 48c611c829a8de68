// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Platform-aware data directory resolution.

use std::path::{Path, PathBuf};

use receiptlink_core::Result;

/// Settings file inside the data directory.
pub const CONFIG_FILE: &str = "config.json";

/// Order database inside the data directory.
pub const ORDERS_DB: &str = "orders.db";

/// Return the application data directory, creating it if needed.
pub fn data_dir() -> Result<PathBuf> {
    let dir = base_dir(
        std::env::var_os("XDG_DATA_HOME").map(PathBuf::from),
        std::env::var_os("HOME").map(PathBuf::from),
    )
    .join("receiptlink");
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Default settings path, unless `--config` names another.
pub fn config_path(explicit: Option<&Path>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => Ok(data_dir()?.join(CONFIG_FILE)),
    }
}

fn base_dir(xdg: Option<PathBuf>, home: Option<PathBuf>) -> PathBuf {
    if let Some(xdg) = xdg.filter(|p| !p.as_os_str().is_empty()) {
        return xdg;
    }
    if let Some(home) = home {
        return home.join(".local").join("share");
    }
    std::env::temp_dir()
}
