// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Trait definitions for everything the printer engine consumes.
//
// Platform seams (radio, byte transport, raster vendor SDK) and application
// collaborators (order store, settings, receipt content) live side by side so
// that the engine can be driven entirely from test doubles.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use receiptlink_core::error::Result;
use receiptlink_core::{DiscoveredDevice, Order, OrderId, PrinterConfig, TransportSettings};

// ---------------------------------------------------------------------------
// Byte transport
// ---------------------------------------------------------------------------

/// A bidirectional byte stream to one printer.
///
/// Reads never block: `read_available` returns whatever the printer has sent
/// so far, possibly nothing.
#[async_trait]
pub trait ByteTransport: Send + Sync {
    /// Write all bytes or fail with `WriteFailed`.
    async fn write(&self, bytes: &[u8]) -> Result<()>;

    /// Drain the bytes currently buffered from the printer.
    async fn read_available(&self) -> Result<Vec<u8>>;

    /// Cheap, non-blocking liveness check.
    fn is_open(&self) -> bool;

    /// Release the underlying resource. Idempotent.
    async fn close(&self);

    /// Human-readable description of the endpoint (for logs).
    fn describe(&self) -> String;
}

// ---------------------------------------------------------------------------
// Radio
// ---------------------------------------------------------------------------

/// A connectable device returned by [`RadioAdapter::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    pub address: String,
    pub name: Option<String>,
}

/// Push notification of link-level events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// The platform saw the link to `address` drop.
    Disconnected { address: String },
}

/// The wireless subsystem: resolution, discovery and opening transports.
///
/// Pairing and permission handling happen before the engine sees a device.
#[async_trait]
pub trait RadioAdapter: Send + Sync {
    /// Whether the radio is switched on.
    fn is_enabled(&self) -> bool;

    /// Turn an address into a connectable device, or `None` if unknown.
    async fn resolve(&self, address: &str) -> Result<Option<DeviceHandle>>;

    /// Open a raw byte stream to a resolved device.
    async fn open(
        &self,
        device: &DeviceHandle,
        settings: &TransportSettings,
    ) -> Result<Box<dyn ByteTransport>>;

    /// Devices currently visible or paired.
    async fn discover(&self) -> Result<Vec<DiscoveredDevice>>;

    /// Link-loss notifications, when the platform offers them.
    fn link_events(&self) -> Option<broadcast::Receiver<LinkEvent>> {
        None
    }
}

// ---------------------------------------------------------------------------
// Raster vendor SDK
// ---------------------------------------------------------------------------

/// Status block reported by the raster vendor SDK.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RasterStatus {
    pub offline: bool,
    pub cover_open: bool,
    pub paper_empty: bool,
    pub paper_near_empty: bool,
}

/// Entry point of the raster vendor SDK.
#[async_trait]
pub trait RasterSdk: Send + Sync {
    /// Whether the vendor SDK is linked into this build.
    fn is_available(&self) -> bool;

    /// Open the vendor port for a printer address.
    async fn open_port(&self, address: &str, timeout: Duration) -> Result<Box<dyn RasterPort>>;
}

/// An open vendor port. Rendering is the SDK's business.
#[async_trait]
pub trait RasterPort: Send + Sync {
    async fn retrieve_status(&self) -> Result<RasterStatus>;

    /// Returns the number of bytes accepted by the port.
    async fn write_port(&self, data: &[u8]) -> Result<usize>;

    async fn release(&self);
}

// ---------------------------------------------------------------------------
// Application collaborators
// ---------------------------------------------------------------------------

/// Order persistence, as far as delivery confirmation needs it.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn get_by_id(&self, id: OrderId) -> Result<Option<Order>>;

    /// Mark an order printed. Idempotent; returns `true` only if this call
    /// flipped the flag.
    async fn mark_printed(&self, id: OrderId) -> Result<bool>;
}

/// User-facing settings consumed by auto-print.
pub trait SettingsStore: Send + Sync {
    fn default_printer(&self) -> Option<PrinterConfig>;

    fn auto_print_enabled(&self) -> bool;
}

/// Produces the line-oriented marked-up receipt text.
pub trait ContentSource: Send + Sync {
    fn order_receipt(
        &self,
        order: &Order,
        config: &PrinterConfig,
        template_id: Option<&str>,
    ) -> Result<String>;

    /// Test page shown by `print_test`.
    fn test_page(&self, config: &PrinterConfig) -> String {
        let rule = "-".repeat(config.paper_width.chars_per_line());
        [
            "[C]<b>PRINTER TEST</b>".to_string(),
            format!("[C]{rule}"),
            format!("[L]<b>Printer:</b>[R]{}", config.display_name),
            format!("[L]<b>Address:</b>[R]{}", config.address),
            format!("[L]<b>Paper:</b>[R]{} mm", config.paper_width.width_mm()),
            format!("[C]{rule}"),
            "[L]Normal text".to_string(),
            "[L]<b>Bold text</b>".to_string(),
            "[L]<u>Underlined text</u>".to_string(),
            "[C]<dw>Wide</dw> <dh>Tall</dh>".to_string(),
            "[L]Left".to_string(),
            "[C]Centre".to_string(),
            "[R]Right".to_string(),
            String::new(),
        ]
        .join("\n")
    }
}
