// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Human-readable messages for shop staff.
//
// Every technical error is mapped to plain language with a clear suggestion.
// Severity drives how loudly the alert is presented at the till.

use serde::{Deserialize, Serialize};

use crate::error::ReceiptError;

/// Severity of an error from the operator's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    /// Link blip or timeout. The engine keeps retrying on its own.
    Transient,
    /// Somebody has to do something (switch Bluetooth on, add paper, close cover).
    ActionRequired,
    /// Retrying or waiting will not fix it.
    Permanent,
}

/// A human-readable error with a plain message and an actionable suggestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanError {
    /// Short summary (shown as a heading).
    pub message: String,
    /// What the operator should try.
    pub suggestion: String,
    /// Whether the engine retries by itself.
    pub retriable: bool,
    pub severity: Severity,
}

impl HumanError {
    fn new(message: &str, suggestion: impl Into<String>, retriable: bool, severity: Severity) -> Self {
        Self {
            message: message.into(),
            suggestion: suggestion.into(),
            retriable,
            severity,
        }
    }
}

/// Alert text for a printer that dropped off the air.
pub fn link_lost(printer: &str) -> HumanError {
    HumanError::new(
        "The receipt printer disconnected.",
        format!("We are reconnecting to {printer} in the background. If it stays offline, check that it is switched on and within range."),
        true,
        Severity::Transient,
    )
}

/// Alert text for a printer that keeps refusing reconnection.
pub fn reconnect_failing(printer: &str, failures: u32) -> HumanError {
    HumanError::new(
        "We can't reach the receipt printer.",
        format!("{failures} reconnect attempts to {printer} failed. Turn the printer off and on again; we keep trying automatically."),
        true,
        Severity::ActionRequired,
    )
}

/// Convert a `ReceiptError` into a `HumanError` suitable for the till.
pub fn humanize_error(err: &ReceiptError) -> HumanError {
    match err {
        ReceiptError::TransportUnavailable(detail) => {
            if detail.contains("disabled") || detail.contains("radio") {
                HumanError::new(
                    "Bluetooth is switched off.",
                    "Switch Bluetooth on; printing resumes automatically.",
                    true,
                    Severity::ActionRequired,
                )
            } else {
                HumanError::new(
                    "The printer can't be found.",
                    format!("Make sure the printer is paired with this device and switched on. ({detail})"),
                    true,
                    Severity::ActionRequired,
                )
            }
        }

        ReceiptError::ConnectFailed { address, .. } => HumanError::new(
            "We couldn't connect to the printer.",
            format!("The printer at {address} did not accept the connection. We'll keep trying in the background."),
            true,
            Severity::Transient,
        ),

        ReceiptError::WriteFailed(_) | ReceiptError::Timeout(_) => HumanError::new(
            "The connection to the printer was interrupted.",
            "This happens with wireless printers now and then. We reconnect and retry automatically.",
            true,
            Severity::Transient,
        ),

        ReceiptError::Cancelled => HumanError::new(
            "Printing was cancelled.",
            "Nothing else to do.",
            false,
            Severity::Permanent,
        ),

        ReceiptError::StatusUnparseable(_) => HumanError::new(
            "The printer answered with something we don't understand.",
            "Printing usually still works. If receipts don't come out, restart the printer.",
            false,
            Severity::Transient,
        ),

        ReceiptError::StatusOffline(detail) => humanize_offline(detail),

        ReceiptError::StatusError(_) => HumanError::new(
            "The printer reported a hardware fault.",
            "Turn the printer off, wait ten seconds and turn it back on. If the fault stays, the printer needs service.",
            false,
            Severity::ActionRequired,
        ),

        ReceiptError::NoDefaultPrinter => HumanError::new(
            "No receipt printer selected.",
            "Choose a default printer in the settings, then try again.",
            false,
            Severity::ActionRequired,
        ),

        ReceiptError::OrderNotFound(id) => HumanError::new(
            "That order no longer exists.",
            format!("Order {id} could not be loaded. Refresh the order list."),
            false,
            Severity::Permanent,
        ),

        ReceiptError::EmptyContent => HumanError::new(
            "There was nothing to print.",
            "Check the receipt template for this order.",
            false,
            Severity::Permanent,
        ),

        ReceiptError::Driver(_) => HumanError::new(
            "The printer driver had a problem.",
            "Try again. If this keeps happening, reconnect the printer.",
            true,
            Severity::Transient,
        ),

        ReceiptError::Database(_) => HumanError::new(
            "The order list could not be updated.",
            "Try again. Orders already printed stay marked.",
            true,
            Severity::Transient,
        ),

        ReceiptError::Io(_) => HumanError::new(
            "A file could not be read or written.",
            "Try again. If this keeps happening, the device storage may be full.",
            true,
            Severity::Transient,
        ),

        ReceiptError::Serialization(_) => HumanError::new(
            "The settings file is damaged.",
            "Re-save the printer settings.",
            false,
            Severity::Permanent,
        ),

        ReceiptError::PlatformUnavailable => HumanError::new(
            "This printer type isn't supported on this device.",
            "Install the vendor printing support or use a generic ESC/POS printer.",
            false,
            Severity::Permanent,
        ),
    }
}

fn humanize_offline(detail: &str) -> HumanError {
    let lower = detail.to_ascii_lowercase();
    if lower.contains("cover") {
        HumanError::new(
            "The printer cover is open.",
            "Close the paper cover firmly until it clicks.",
            false,
            Severity::ActionRequired,
        )
    } else if lower.contains("paper") {
        HumanError::new(
            "The printer is out of paper.",
            "Load a new paper roll, then close the cover.",
            false,
            Severity::ActionRequired,
        )
    } else {
        HumanError::new(
            "The printer is offline.",
            format!("Check the printer's front panel. ({detail})"),
            false,
            Severity::ActionRequired,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_failure_is_transient() {
        let human = humanize_error(&ReceiptError::WriteFailed("broken pipe".into()));
        assert_eq!(human.severity, Severity::Transient);
        assert!(human.retriable);
    }

    #[test]
    fn radio_off_asks_for_bluetooth() {
        let err = ReceiptError::TransportUnavailable("radio disabled".into());
        let human = humanize_error(&err);
        assert_eq!(human.severity, Severity::ActionRequired);
        assert!(human.message.contains("Bluetooth"));
    }

    #[test]
    fn paper_out_is_action_required() {
        let err = ReceiptError::StatusOffline("paper end".into());
        let human = humanize_error(&err);
        assert_eq!(human.severity, Severity::ActionRequired);
        assert!(human.message.contains("paper"));
    }

    #[test]
    fn cover_open_mentions_the_cover() {
        let human = humanize_error(&ReceiptError::StatusOffline("cover open".into()));
        assert!(human.message.contains("cover"));
    }

    #[test]
    fn reconnect_alert_mentions_count() {
        let human = reconnect_failing("Kitchen", 3);
        assert!(human.suggestion.contains("3 reconnect attempts"));
    }
}
