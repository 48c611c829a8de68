// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for the Receiptlink printer engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a queued print job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an order in the external order store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OrderId(pub u64);

impl std::fmt::Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Paper width class of a receipt printer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaperWidth {
    /// 57/58 mm roll.
    Narrow,
    /// 80 mm roll.
    Wide,
}

impl PaperWidth {
    /// Characters per line in the printer's default font A.
    pub fn chars_per_line(&self) -> usize {
        match self {
            Self::Narrow => 32,
            Self::Wide => 42,
        }
    }

    /// Nominal roll width in millimetres.
    pub fn width_mm(&self) -> u32 {
        match self {
            Self::Narrow => 57,
            Self::Wide => 80,
        }
    }
}

/// Printer command-set family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Vendor {
    /// Generic ESC/POS over a raw byte stream.
    Generic,
    /// Raster-mode vendor printer driven through the vendor SDK.
    RasterVendor,
}

/// Advertised-name fragments that identify raster-mode vendor printers.
const RASTER_NAME_HINTS: &[&str] = &["star", "tsp", "mc-print", "sm-l", "sm-s", "sm-t", "mpop"];

impl Vendor {
    /// Classify a discovered device by its advertised name.
    pub fn classify(advertised_name: &str) -> Self {
        let lower = advertised_name.to_ascii_lowercase();
        if RASTER_NAME_HINTS.iter().any(|hint| lower.contains(hint)) {
            Self::RasterVendor
        } else {
            Self::Generic
        }
    }
}

/// Identity and capabilities of a configured printer.
///
/// Created by configuration code; the engine only ever reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrinterConfig {
    pub id: String,
    /// Transport endpoint identifier (MAC address, `host:port`, ...).
    pub address: String,
    pub display_name: String,
    pub paper_width: PaperWidth,
    pub auto_cut: bool,
    pub vendor: Vendor,
    /// Copies printed per auto-printed order.
    #[serde(default = "default_copies")]
    pub copies: u32,
}

fn default_copies() -> u32 {
    1
}

impl PrinterConfig {
    /// Build a config with sensible defaults for an address.
    pub fn new(address: impl Into<String>, display_name: impl Into<String>) -> Self {
        let address = address.into();
        let display_name = display_name.into();
        Self {
            id: address.clone(),
            vendor: Vendor::classify(&display_name),
            address,
            display_name,
            paper_width: PaperWidth::Narrow,
            auto_cut: true,
            copies: 1,
        }
    }
}

/// Connection lifecycle of one printer address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    /// Whether the engine should try to (re)connect from this state.
    pub fn is_retry_eligible(&self) -> bool {
        matches!(self, Self::Disconnected | Self::Error)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Classification of errors for retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Timeout or handshake failure; safe to retry automatically.
    Transient,
    /// The link died under us (broken pipe, reset). Reconnect before retrying.
    LinkLost,
    /// Needs the operator (radio off, device not paired, paper out).
    UserAction,
    /// Retrying cannot help (cancelled, empty content, bad configuration).
    Permanent,
}

/// An order as seen by the delivery engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    /// Shop-facing order number.
    pub number: String,
    pub printed: bool,
    pub created_at: DateTime<Utc>,
}

impl Order {
    pub fn new(id: u64, number: impl Into<String>) -> Self {
        Self {
            id: OrderId(id),
            number: number.into(),
            printed: false,
            created_at: Utc::now(),
        }
    }
}

/// A queued request to print one order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrintJob {
    pub id: JobId,
    pub order_id: OrderId,
    pub config: PrinterConfig,
    pub copies: u32,
    /// Failed deliveries so far.
    pub retry_count: u32,
    /// Marked-up content, generated once and reused across retries.
    pub cached_payload: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PrintJob {
    pub fn new(order_id: OrderId, config: PrinterConfig) -> Self {
        Self {
            id: JobId::new(),
            order_id,
            copies: config.copies.max(1),
            config,
            retry_count: 0,
            cached_payload: None,
            created_at: Utc::now(),
        }
    }
}

/// Health verdict of a status probe, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HealthState {
    Online,
    Warning,
    Offline,
    Error,
}

/// Result of a status-diagnostic query. Ephemeral, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusQueryResult {
    pub state: HealthState,
    pub summary: String,
    pub detail: Option<String>,
    pub raw_bytes: Option<Vec<u8>>,
}

impl StatusQueryResult {
    pub fn online(summary: impl Into<String>) -> Self {
        Self {
            state: HealthState::Online,
            summary: summary.into(),
            detail: None,
            raw_bytes: None,
        }
    }

    /// Convert a hardware verdict into the matching error, if any.
    ///
    /// `Online` and `Warning` are not errors.
    pub fn as_error(&self) -> Option<crate::ReceiptError> {
        let text = match &self.detail {
            Some(detail) => format!("{}: {detail}", self.summary),
            None => self.summary.clone(),
        };
        match self.state {
            HealthState::Offline => Some(crate::ReceiptError::StatusOffline(text)),
            HealthState::Error => Some(crate::ReceiptError::StatusError(text)),
            HealthState::Online | HealthState::Warning => None,
        }
    }
}

/// A printer found during a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredDevice {
    pub name: String,
    pub address: String,
    pub vendor: Vendor,
    /// Whether the device is already paired with this host.
    pub bonded: bool,
}

impl DiscoveredDevice {
    pub fn new(name: impl Into<String>, address: impl Into<String>, bonded: bool) -> Self {
        let name = name.into();
        Self {
            vendor: Vendor::classify(&name),
            name,
            address: address.into(),
            bonded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_classification_is_case_insensitive() {
        assert_eq!(Vendor::classify("Star TSP143IIIBI"), Vendor::RasterVendor);
        assert_eq!(Vendor::classify("mC-Print3"), Vendor::RasterVendor);
        assert_eq!(Vendor::classify("MPT-II"), Vendor::Generic);
        assert_eq!(Vendor::classify("BlueTooth Printer"), Vendor::Generic);
    }

    #[test]
    fn paper_width_drives_line_length() {
        assert_eq!(PaperWidth::Narrow.chars_per_line(), 32);
        assert_eq!(PaperWidth::Wide.chars_per_line(), 42);
    }

    #[test]
    fn health_states_order_by_severity() {
        assert!(HealthState::Online < HealthState::Warning);
        assert!(HealthState::Warning < HealthState::Offline);
        assert!(HealthState::Offline < HealthState::Error);
    }

    #[test]
    fn only_offline_and_error_verdicts_are_errors() {
        let mut result = StatusQueryResult::online("ready");
        assert!(result.as_error().is_none());
        result.state = HealthState::Warning;
        assert!(result.as_error().is_none());
        result.state = HealthState::Offline;
        assert!(matches!(
            result.as_error(),
            Some(crate::ReceiptError::StatusOffline(_))
        ));
    }

    #[test]
    fn job_copies_never_zero() {
        let mut config = PrinterConfig::new("00:11:22:33:44:55", "MPT-II");
        config.copies = 0;
        let job = PrintJob::new(OrderId(7), config);
        assert_eq!(job.copies, 1);
        assert_eq!(job.retry_count, 0);
    }
}
