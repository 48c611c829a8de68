// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// JSON-file settings store.
//
// The whole `AppConfig` lives in one pretty-printed file.  A missing file means
// defaults; a malformed one is an error so a typo never silently turns
// auto-print off.

use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use tracing::{debug, info};

use receiptlink_bridge::SettingsStore;
use receiptlink_core::{AppConfig, PrinterConfig, Result};

pub struct FileSettingsStore {
    path: PathBuf,
    config: RwLock<AppConfig>,
}

impl FileSettingsStore {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = match std::fs::read_to_string(&path) {
            Ok(data) => serde_json::from_str(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no settings file, using defaults");
                AppConfig::default()
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            config: RwLock::new(config),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the current settings.
    pub fn app_config(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply `change` and write the result to disk.
    pub fn update(&self, change: impl FnOnce(&mut AppConfig)) -> Result<()> {
        let snapshot = {
            let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
            change(&mut config);
            config.clone()
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&snapshot)?)?;
        info!(path = %self.path.display(), "settings saved");
        Ok(())
    }
}

impl SettingsStore for FileSettingsStore {
    fn default_printer(&self) -> Option<PrinterConfig> {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .default_printer
            .clone()
    }

    fn auto_print_enabled(&self) -> bool {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .auto_print
    }
}
