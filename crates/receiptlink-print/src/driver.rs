// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Printer drivers, chosen once per connection by vendor.
//
// `GenericDriver` owns a raw byte transport and speaks ESC/POS itself.
// `RasterDriver` owns a vendor SDK port; the SDK renders and reports status
// in its own terms.  Nothing downstream of `connect` looks at the vendor again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use receiptlink_bridge::{ByteTransport, RasterPort, RasterSdk, RasterStatus};
use receiptlink_core::error::{ReceiptError, Result};
use receiptlink_core::{EngineConfig, HealthState, PrinterConfig, StatusQueryResult, Vendor};

use crate::encoder::{ContentEncoder, ReceiptFormat, cmd};
use crate::status::{StatusProtocol, StatusSettings};
use crate::transmitter::{ChunkedTransmitter, TransmitReport, TransmitSettings};

/// Capabilities of a connected printer.
#[async_trait]
pub trait PrinterDriver: Send + Sync {
    fn vendor(&self) -> Vendor;

    fn address(&self) -> &str;

    /// Non-blocking liveness check of the underlying resource.
    fn is_live(&self) -> bool;

    /// Cheap round trip proving the link still carries bytes.
    async fn probe(&self) -> Result<()>;

    /// Best-effort reset of whatever the printer still holds from a
    /// previous job.
    async fn nudge(&self) -> Result<()>;

    async fn print(&self, markup: &str, cancel: &CancellationToken) -> Result<TransmitReport>;

    async fn query_health(&self) -> Result<StatusQueryResult>;

    /// Release the link. Idempotent.
    async fn shutdown(&self);
}

// ---------------------------------------------------------------------------
// Generic ESC/POS
// ---------------------------------------------------------------------------

pub struct GenericDriver {
    address: String,
    transport: Box<dyn ByteTransport>,
    encoder: ContentEncoder,
    transmitter: ChunkedTransmitter,
    status: StatusProtocol,
}

impl GenericDriver {
    pub fn new(config: &PrinterConfig, transport: Box<dyn ByteTransport>, engine: &EngineConfig) -> Self {
        let format = ReceiptFormat::for_paper(config.paper_width);
        debug!(
            address = %config.address,
            dpi = format.dpi,
            chars_per_line = format.chars_per_line,
            "generic driver ready"
        );
        Self {
            address: config.address.clone(),
            transport,
            encoder: ContentEncoder::new(format, config.auto_cut),
            transmitter: ChunkedTransmitter::new(TransmitSettings::from(engine)),
            status: StatusProtocol::new(StatusSettings::from(engine)),
        }
    }

    pub fn format(&self) -> ReceiptFormat {
        self.encoder.format()
    }
}

#[async_trait]
impl PrinterDriver for GenericDriver {
    fn vendor(&self) -> Vendor {
        Vendor::Generic
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn is_live(&self) -> bool {
        self.transport.is_open()
    }

    async fn probe(&self) -> Result<()> {
        if !self.transport.is_open() {
            return Err(ReceiptError::WriteFailed(format!(
                "{} is closed",
                self.transport.describe()
            )));
        }
        self.transport.write(cmd::PROBE).await
    }

    async fn nudge(&self) -> Result<()> {
        self.transport.write(cmd::INIT).await
    }

    async fn print(&self, markup: &str, cancel: &CancellationToken) -> Result<TransmitReport> {
        let payload = self.encoder.encode(markup);
        self.transmitter
            .transmit(self.transport.as_ref(), &payload, cancel)
            .await
    }

    async fn query_health(&self) -> Result<StatusQueryResult> {
        self.status.query(self.transport.as_ref()).await
    }

    async fn shutdown(&self) {
        self.transport.close().await;
    }
}

// ---------------------------------------------------------------------------
// Raster vendor
// ---------------------------------------------------------------------------

pub struct RasterDriver {
    address: String,
    port: Box<dyn RasterPort>,
    encoder: ContentEncoder,
    live: AtomicBool,
}

impl RasterDriver {
    /// Open a vendor port for `config`.
    pub async fn open(sdk: &dyn RasterSdk, config: &PrinterConfig, timeout: Duration) -> Result<Self> {
        if !sdk.is_available() {
            return Err(ReceiptError::PlatformUnavailable);
        }
        let port = sdk.open_port(&config.address, timeout).await?;
        info!(address = %config.address, "raster vendor port open");
        Ok(Self {
            address: config.address.clone(),
            port,
            encoder: ContentEncoder::new(ReceiptFormat::for_paper(config.paper_width), false),
            live: AtomicBool::new(true),
        })
    }
}

fn raster_verdict(status: RasterStatus) -> StatusQueryResult {
    let mut issues = Vec::new();
    if status.offline {
        issues.push("offline");
    }
    if status.cover_open {
        issues.push("cover open");
    }
    if status.paper_empty {
        issues.push("paper end");
    }
    let (state, summary) = if !issues.is_empty() {
        (HealthState::Offline, "printer offline")
    } else if status.paper_near_empty {
        issues.push("paper near end");
        (HealthState::Warning, "paper roll nearly empty")
    } else {
        (HealthState::Online, "printer online")
    };
    StatusQueryResult {
        state,
        summary: summary.into(),
        detail: (!issues.is_empty()).then(|| issues.join(", ")),
        raw_bytes: None,
    }
}

#[async_trait]
impl PrinterDriver for RasterDriver {
    fn vendor(&self) -> Vendor {
        Vendor::RasterVendor
    }

    fn address(&self) -> &str {
        &self.address
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    async fn probe(&self) -> Result<()> {
        match self.port.retrieve_status().await {
            Ok(_) => Ok(()),
            Err(e) => {
                self.live.store(false, Ordering::SeqCst);
                Err(ReceiptError::write_failed("raster port", e))
            }
        }
    }

    async fn nudge(&self) -> Result<()> {
        Ok(())
    }

    async fn print(&self, markup: &str, cancel: &CancellationToken) -> Result<TransmitReport> {
        if cancel.is_cancelled() {
            return Err(ReceiptError::Cancelled);
        }
        let mut text = self.encoder.plain_lines(markup).join("\r\n");
        text.push_str("\r\n");

        let accepted = self.port.write_port(text.as_bytes()).await.inspect_err(|_| {
            self.live.store(false, Ordering::SeqCst);
        })?;
        if accepted < text.len() {
            self.live.store(false, Ordering::SeqCst);
            return Err(ReceiptError::WriteFailed(format!(
                "raster port accepted {accepted} of {} bytes",
                text.len()
            )));
        }
        Ok(TransmitReport {
            groups: 1,
            writes: 1,
            bytes: accepted,
        })
    }

    async fn query_health(&self) -> Result<StatusQueryResult> {
        let status = self.port.retrieve_status().await?;
        Ok(raster_verdict(status))
    }

    async fn shutdown(&self) {
        if self.live.swap(false, Ordering::SeqCst) {
            self.port.release().await;
            info!(address = %self.address, "raster vendor port released");
        }
    }
}
