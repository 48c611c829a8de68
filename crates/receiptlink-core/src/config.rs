// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Engine and application configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{DiscoveredDevice, PrinterConfig};

/// Timing and sizing knobs of the printer engine.
///
/// Durations are stored as milliseconds so the JSON stays readable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Connect attempts per `connect` call.
    pub connect_attempts: u32,
    /// Linear backoff step between connect attempts.
    pub connect_backoff_ms: u64,
    /// Liveness monitor cycle.
    pub heartbeat_interval_ms: u64,
    /// First reconnect spacing window after a failure.
    pub reconnect_base_ms: u64,
    /// Cap on the reconnect spacing window.
    pub reconnect_max_ms: u64,
    /// Sustained failure after which the backoff starts over.
    pub backoff_reset_after_ms: u64,
    /// Grace period before a link-loss notification becomes an alert.
    pub alert_debounce_ms: u64,
    /// Consecutive reconnect failures before the operator is told.
    pub alert_after_failures: u32,
    /// Lines per transmission group.
    pub chunk_lines: usize,
    /// Upper bound on a single transport write.
    pub max_write_bytes: usize,
    /// Pause after each group's flush sequence.
    pub settle_ms: u64,
    /// Total time to wait for one status reply.
    pub status_timeout_ms: u64,
    /// Silence that ends a status reply once bytes have arrived.
    pub status_quiet_ms: u64,
    pub status_poll_ms: u64,
    /// Delivery attempts per print job.
    pub delivery_attempts: u32,
    pub delivery_backoff_ms: u64,
    pub connect_timeout_ms: u64,
    pub write_timeout_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            connect_attempts: 3,
            connect_backoff_ms: 2_000,
            heartbeat_interval_ms: 5_000,
            reconnect_base_ms: 5_000,
            reconnect_max_ms: 60_000,
            backoff_reset_after_ms: 600_000,
            alert_debounce_ms: 3_000,
            alert_after_failures: 3,
            chunk_lines: 15,
            max_write_bytes: 512,
            settle_ms: 300,
            status_timeout_ms: 3_000,
            status_quiet_ms: 150,
            status_poll_ms: 30,
            delivery_attempts: 3,
            delivery_backoff_ms: 1_000,
            connect_timeout_ms: 10_000,
            write_timeout_ms: 5_000,
        }
    }
}

impl EngineConfig {
    pub fn connect_backoff(&self) -> Duration {
        Duration::from_millis(self.connect_backoff_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn reconnect_base(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms)
    }

    pub fn backoff_reset_after(&self) -> Duration {
        Duration::from_millis(self.backoff_reset_after_ms)
    }

    pub fn alert_debounce(&self) -> Duration {
        Duration::from_millis(self.alert_debounce_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }

    pub fn status_quiet(&self) -> Duration {
        Duration::from_millis(self.status_quiet_ms)
    }

    pub fn status_poll(&self) -> Duration {
        Duration::from_millis(self.status_poll_ms.max(1))
    }

    pub fn delivery_backoff(&self) -> Duration {
        Duration::from_millis(self.delivery_backoff_ms)
    }

    /// Settings handed to the radio when it opens a transport.
    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            write_timeout: Duration::from_millis(self.write_timeout_ms),
        }
    }
}

/// Explicit low-level transport configuration, fixed at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSettings {
    pub connect_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        EngineConfig::default().transport_settings()
    }
}

/// Persistent application settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Printer used for automatic printing.
    pub default_printer: Option<PrinterConfig>,
    /// Print new orders without operator action.
    pub auto_print: bool,
    /// Endpoints offered by `scan` on platforms without native discovery.
    pub known_devices: Vec<DiscoveredDevice>,
    pub engine: EngineConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "chunk_lines": 10 }"#).expect("parse");
        assert_eq!(config.chunk_lines, 10);
        assert_eq!(config.connect_attempts, 3);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(5));
    }

    #[test]
    fn app_config_round_trips_through_json() {
        let mut app = AppConfig::default();
        app.auto_print = true;
        app.default_printer = Some(PrinterConfig::new("10.0.0.9:9100", "Kitchen"));
        let json = serde_json::to_string_pretty(&app).expect("serialize");
        let back: AppConfig = serde_json::from_str(&json).expect("parse");
        assert!(back.auto_print);
        assert_eq!(back.default_printer, app.default_printer);
    }
}
