// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Step-by-step printer diagnostics.
//
// Runs radio → device → connection → status round trip, stops at the first
// failure and says what to do about it.

use serde::Serialize;
use tracing::{info, instrument};

use receiptlink_core::human_errors::humanize_error;
use receiptlink_core::{HealthState, PrinterConfig, ReceiptError, Vendor};

use crate::connection::ConnectionManager;

/// Result of a single diagnostic step.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    /// Step name shown to the user.
    pub name: String,
    pub passed: bool,
    /// What was tested and what came back.
    pub detail: String,
    /// What to do if the step failed.
    pub fix: Option<String>,
}

impl StepResult {
    fn pass(name: &str, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            detail: detail.into(),
            fix: None,
        }
    }

    fn fail(name: &str, detail: impl Into<String>, fix: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            detail: detail.into(),
            fix: Some(fix.into()),
        }
    }

    fn from_error(name: &str, err: &ReceiptError) -> Self {
        let human = humanize_error(err);
        Self::fail(name, human.message, human.suggestion)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticReport {
    pub address: String,
    pub steps: Vec<StepResult>,
    /// Index of the failed step, if any.
    pub failed_step: Option<usize>,
    pub summary: String,
    /// Raw status reply, hex encoded.
    pub status_hex: Option<String>,
}

impl DiagnosticReport {
    pub fn passed(&self) -> bool {
        self.failed_step.is_none()
    }

    /// Record `step`; returns whether the run may continue.
    fn push(&mut self, step: StepResult, summary_on_failure: &str) -> bool {
        let passed = step.passed;
        self.steps.push(step);
        if !passed {
            self.failed_step = Some(self.steps.len() - 1);
            self.summary = summary_on_failure.into();
        }
        passed
    }
}

/// Run every check against `config`'s printer.
#[instrument(skip(manager, config), fields(address = %config.address))]
pub async fn diagnose(manager: &ConnectionManager, config: &PrinterConfig) -> DiagnosticReport {
    let mut report = DiagnosticReport {
        address: config.address.clone(),
        steps: Vec::new(),
        failed_step: None,
        summary: String::new(),
        status_hex: None,
    };

    // Step 1: radio
    let radio = if manager.radio().is_enabled() {
        StepResult::pass("Radio", "The wireless radio is on.")
    } else {
        StepResult::fail(
            "Radio",
            "The wireless radio is off.",
            "Turn Bluetooth (or Wi-Fi) on and run the check again.",
        )
    };
    if !report.push(radio, "The wireless radio is off.") {
        return report;
    }

    // Step 2: device
    let device = match config.vendor {
        Vendor::RasterVendor if !manager.raster_available() => StepResult::fail(
            "Printer found",
            "This printer needs its vendor driver, which is not part of this build.",
            "Use a build that includes the vendor SDK, or pick a generic ESC/POS printer.",
        ),
        Vendor::RasterVendor => StepResult::pass("Printer found", "Vendor driver is available."),
        Vendor::Generic => match manager.radio().resolve(&config.address).await {
            Ok(Some(handle)) => StepResult::pass(
                "Printer found",
                format!(
                    "{} answers to {}.",
                    handle.name.as_deref().unwrap_or("A device"),
                    handle.address
                ),
            ),
            Ok(None) => StepResult::fail(
                "Printer found",
                format!("No paired device has the address {}.", config.address),
                "Pair the printer in your device's Bluetooth settings, then pick it again.",
            ),
            Err(e) => StepResult::from_error("Printer found", &e),
        },
    };
    if !report.push(device, "The printer could not be found.") {
        return report;
    }

    // Step 3: connection
    let connection = match manager.connect(config).await {
        Ok(()) => StepResult::pass("Connection", "A link to the printer is open."),
        Err(e) => StepResult::from_error("Connection", &e),
    };
    if !report.push(connection, "The printer was found but would not connect.") {
        return report;
    }

    // Step 4: status round trip
    let status = match manager.driver(config).await {
        None => StepResult::fail(
            "Status",
            "The link closed right after connecting.",
            "Move closer to the printer and try again.",
        ),
        Some(driver) => match driver.query_health().await {
            Ok(result) => {
                report.status_hex = result.raw_bytes.as_deref().map(hex::encode);
                let detail = match &result.detail {
                    Some(detail) => format!("{} ({detail})", result.summary),
                    None => result.summary.clone(),
                };
                match result.state {
                    HealthState::Online | HealthState::Warning => StepResult::pass("Status", detail),
                    HealthState::Offline => StepResult::fail(
                        "Status",
                        detail,
                        "Close the cover and check the paper roll.",
                    ),
                    HealthState::Error => StepResult::fail(
                        "Status",
                        detail,
                        "Turn the printer off and on again. If the error stays, the printer needs service.",
                    ),
                }
            }
            Err(e) => StepResult::from_error("Status", &e),
        },
    };
    if !report.push(status, "The printer is connected but not ready.") {
        return report;
    }

    report.summary = "Everything looks good. The printer is ready.".into();
    info!("diagnostics passed");
    report
}

/// Plain-text report to share with whoever is helping.
pub fn help_summary(report: &DiagnosticReport) -> String {
    let now = chrono::Utc::now().format("%d %b %Y, %H:%M");
    let mut text = format!("Printer Check\nDate: {now}\nPrinter: {}\n", report.address);
    if let Some(hex) = &report.status_hex {
        text.push_str(&format!("Status bytes: {hex}\n"));
    }
    text.push('\n');

    for (i, step) in report.steps.iter().enumerate() {
        let mark = if step.passed { "ok" } else { "FAILED" };
        text.push_str(&format!("{}. {} [{mark}]: {}\n", i + 1, step.name, step.detail));
    }

    if let Some(step) = report.failed_step.and_then(|i| report.steps.get(i)) {
        if let Some(fix) = &step.fix {
            text.push_str(&format!("\nWhat to do: {fix}\n"));
        }
    } else {
        text.push_str("\nAll checks passed.\n");
    }
    text
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use receiptlink_bridge::memory::{MemoryRadio, Wire};
    use receiptlink_bridge::stub::StubRasterSdk;
    use receiptlink_core::EngineConfig;

    use super::*;
    use crate::status::QUERIES;

    fn setup() -> (Arc<MemoryRadio>, ConnectionManager, PrinterConfig) {
        let radio = MemoryRadio::new(Wire::new());
        let manager = ConnectionManager::new(radio.clone(), Arc::new(StubRasterSdk), EngineConfig::default());
        (radio, manager, PrinterConfig::new("A", "Counter"))
    }

    #[tokio::test(start_paused = true)]
    async fn radio_off_stops_at_the_first_step() {
        let (radio, manager, config) = setup();
        radio.set_enabled(false);
        let report = diagnose(&manager, &config).await;
        assert_eq!(report.failed_step, Some(0));
        assert_eq!(report.steps.len(), 1);
        assert!(report.steps[0].fix.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_device_fails_the_second_step() {
        let (radio, manager, config) = setup();
        radio.make_unresolvable("A");
        let report = diagnose(&manager, &config).await;
        assert_eq!(report.failed_step, Some(1));
        assert_eq!(radio.open_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_printer_passes_with_status_bytes() {
        let (radio, manager, config) = setup();
        for query in &QUERIES {
            radio.wire().reply_to(&query.command, &[0x12]);
        }
        let report = diagnose(&manager, &config).await;
        assert!(report.passed(), "{report:?}");
        assert_eq!(report.steps.len(), 4);
        assert!(report.status_hex.as_deref().unwrap().contains("12"));
        assert!(help_summary(&report).contains("All checks passed"));
    }

    #[tokio::test(start_paused = true)]
    async fn cover_open_fails_the_status_step() {
        let (radio, manager, config) = setup();
        radio.wire().reply_to(&QUERIES[0].command, &[0x16]);
        radio.wire().reply_to(&QUERIES[1].command, &[0x12]);
        radio.wire().reply_to(&QUERIES[2].command, &[0x12]);
        let report = diagnose(&manager, &config).await;
        assert_eq!(report.failed_step, Some(3));
        assert!(help_summary(&report).contains("What to do"));
    }

    #[tokio::test(start_paused = true)]
    async fn raster_without_sdk_fails_at_device_step() {
        let (_, manager, mut config) = setup();
        config.vendor = Vendor::RasterVendor;
        let report = diagnose(&manager, &config).await;
        assert_eq!(report.failed_step, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn report_serializes_for_machine_readers() {
        let (radio, manager, config) = setup();
        radio.set_enabled(false);
        let report = diagnose(&manager, &config).await;
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["failed_step"], 0);
        assert_eq!(json["steps"][0]["passed"], false);
        assert_eq!(json["address"], "A");
    }
}
