// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The printer engine: one object the application holds.
//
// Wires the connection manager, delivery, print queue and diagnostics to the
// platform radio and the application's collaborators.  The boolean-returning
// operations log the error and report failure; the `try_` variants hand the
// error back.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use receiptlink_bridge::{ContentSource, OrderStore, RadioAdapter, RasterSdk, SettingsStore};
use receiptlink_core::error::{ReceiptError, Result};
use receiptlink_core::{
    ConnectionState, DiscoveredDevice, EngineConfig, JobId, Order, PrintJob, PrinterConfig,
    StatusQueryResult, Vendor,
};

use crate::connection::ConnectionManager;
use crate::delivery::Delivery;
use crate::diagnostics::{self, DiagnosticReport};
use crate::monitor::PrinterAlert;
use crate::queue::PrintQueue;
use crate::transmitter::TransmitReport;

/// Application-side collaborators the engine consumes.
#[derive(Clone)]
pub struct Collaborators {
    pub orders: Arc<dyn OrderStore>,
    pub settings: Arc<dyn SettingsStore>,
    pub content: Arc<dyn ContentSource>,
}

pub struct PrinterEngine {
    connection: ConnectionManager,
    delivery: Arc<Delivery>,
    queue: Arc<PrintQueue>,
    devices: Arc<watch::Sender<Vec<DiscoveredDevice>>>,
    cancel: CancellationToken,
}

impl PrinterEngine {
    pub fn new(
        radio: Arc<dyn RadioAdapter>,
        raster: Arc<dyn RasterSdk>,
        collaborators: Collaborators,
        config: EngineConfig,
    ) -> Self {
        let connection = ConnectionManager::new(radio, raster, config);
        let delivery = Arc::new(Delivery::new(
            connection.clone(),
            collaborators.orders,
            collaborators.content,
        ));
        let queue = Arc::new(PrintQueue::new(Arc::clone(&delivery), collaborators.settings));
        let (devices, _) = watch::channel(Vec::new());
        Self {
            connection,
            delivery,
            queue,
            devices: Arc::new(devices),
            cancel: CancellationToken::new(),
        }
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn queue(&self) -> &Arc<PrintQueue> {
        &self.queue
    }

    // -- Connection ----------------------------------------------------------

    pub async fn connect(&self, config: &PrinterConfig) -> bool {
        match self.try_connect(config).await {
            Ok(()) => true,
            Err(e) => {
                warn!(address = %config.address, error = %e, "connect failed");
                false
            }
        }
    }

    pub async fn try_connect(&self, config: &PrinterConfig) -> Result<()> {
        self.connection.connect_cancellable(config, &self.cancel).await
    }

    pub async fn disconnect(&self, config: &PrinterConfig) {
        self.connection.disconnect(config).await;
    }

    pub fn status(&self, config: &PrinterConfig) -> ConnectionState {
        self.connection.status(config)
    }

    pub fn status_stream(&self, config: &PrinterConfig) -> watch::Receiver<ConnectionState> {
        self.connection.status_stream(config)
    }

    pub fn alerts(&self) -> broadcast::Receiver<PrinterAlert> {
        self.connection.alerts()
    }

    // -- Printing ------------------------------------------------------------

    pub async fn print_job(&self, order: &Order, config: &PrinterConfig, template_id: Option<&str>) -> bool {
        match self
            .try_print_job(order, config, template_id, &self.cancel)
            .await
        {
            Ok(_) => true,
            Err(e) => {
                warn!(order = %order.number, error = %e, "print job failed");
                false
            }
        }
    }

    /// Print one copy of `order`, stopping early if `cancel` fires.
    pub async fn try_print_job(
        &self,
        order: &Order,
        config: &PrinterConfig,
        template_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<TransmitReport> {
        let mut job = PrintJob::new(order.id, config.clone());
        self.delivery.deliver(order, &mut job, template_id, cancel).await
    }

    pub async fn print_test(&self, config: &PrinterConfig) -> bool {
        let page = self.delivery.content().test_page(config);
        match self.print_markup(config, &page).await {
            Ok(report) => {
                info!(address = %config.address, bytes = report.bytes, "test page printed");
                true
            }
            Err(e) => {
                warn!(address = %config.address, error = %e, "test page failed");
                false
            }
        }
    }

    /// Print marked-up text that does not belong to an order.
    pub async fn print_markup(&self, config: &PrinterConfig, markup: &str) -> Result<TransmitReport> {
        self.delivery.send(config, markup, &self.cancel).await
    }

    pub async fn auto_print(&self, order: &Order) -> Result<Option<JobId>> {
        self.queue.auto_print(order).await
    }

    /// Start the print queue worker. It stops on `shutdown`.
    pub fn start_queue(&self) -> JoinHandle<()> {
        self.queue.spawn_worker(self.cancel.child_token())
    }

    // -- Health --------------------------------------------------------------

    /// Ask the printer how it is.
    ///
    /// Connects first if needed.  An offline or error verdict is returned as
    /// a result, not an error, and leaves the link up.
    #[instrument(skip(self, config), fields(address = %config.address))]
    pub async fn query_health(&self, config: &PrinterConfig) -> Result<StatusQueryResult> {
        self.connection.connect_cancellable(config, &self.cancel).await?;
        let driver = self
            .connection
            .driver(config)
            .await
            .ok_or_else(|| ReceiptError::WriteFailed("link closed before status query".into()))?;
        match driver.query_health().await {
            Ok(result) => {
                info!(state = ?result.state, summary = %result.summary, "health");
                Ok(result)
            }
            Err(e) => {
                if e.is_connection_related() {
                    self.connection.mark_disconnected(&config.address).await;
                }
                Err(e)
            }
        }
    }

    pub async fn diagnose(&self, config: &PrinterConfig) -> DiagnosticReport {
        diagnostics::diagnose(&self.connection, config).await
    }

    // -- Discovery -----------------------------------------------------------

    /// Start a scan; the receiver gets the classified device list when the
    /// radio answers.
    pub fn scan(&self) -> watch::Receiver<Vec<DiscoveredDevice>> {
        let radio = Arc::clone(self.connection.radio());
        let devices = Arc::clone(&self.devices);
        tokio::spawn(async move {
            match radio.discover().await {
                Ok(mut found) => {
                    for device in &mut found {
                        device.vendor = Vendor::classify(&device.name);
                    }
                    debug!(count = found.len(), "scan finished");
                    devices.send_replace(found);
                }
                Err(e) => warn!(error = %e, "scan failed"),
            }
        });
        self.devices.subscribe()
    }

    /// Stop background work and release the printer.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.connection.shutdown().await;
        info!("printer engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use receiptlink_bridge::memory::{FixedContent, MemoryOrderStore, MemoryRadio, StaticSettings, Wire};
    use receiptlink_bridge::stub::StubRasterSdk;
    use receiptlink_core::HealthState;

    use super::*;
    use crate::status::QUERIES;

    fn engine() -> (Arc<MemoryRadio>, Arc<MemoryOrderStore>, PrinterEngine) {
        let radio = MemoryRadio::new(Wire::new());
        let orders = MemoryOrderStore::new();
        let engine = PrinterEngine::new(
            radio.clone(),
            Arc::new(StubRasterSdk),
            Collaborators {
                orders: orders.clone(),
                settings: Arc::new(StaticSettings::default()),
                content: Arc::new(FixedContent("[C]{number}".into())),
            },
            EngineConfig::default(),
        );
        (radio, orders, engine)
    }

    #[tokio::test(start_paused = true)]
    async fn test_page_mentions_the_printer() {
        let (radio, _, engine) = engine();
        let config = PrinterConfig::new("A", "Front desk");
        assert!(engine.print_test(&config).await);
        let text = String::from_utf8_lossy(&radio.wire().written_bytes()).into_owned();
        assert!(text.contains("Front desk"));
    }

    #[tokio::test(start_paused = true)]
    async fn print_job_reports_failure_as_false() {
        let (radio, orders, engine) = engine();
        radio.set_enabled(false);
        let order = Order::new(1, "X");
        orders.insert(order.clone());
        assert!(!engine.print_job(&order, &PrinterConfig::new("A", "A"), None).await);
        assert!(!orders.is_printed(order.id));
    }

    #[tokio::test(start_paused = true)]
    async fn health_offline_keeps_the_link() {
        let (radio, _, engine) = engine();
        let config = PrinterConfig::new("A", "A");
        radio.wire().reply_to(&QUERIES[0].command, &[0x16]);

        let result = engine.query_health(&config).await.unwrap();
        assert_eq!(result.state, HealthState::Offline);
        assert!(result.detail.unwrap().contains("cover"));
        assert_eq!(engine.status(&config), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn scan_classifies_vendors() {
        let (radio, _, engine) = engine();
        radio.add_device(DiscoveredDevice::new("Star TSP143", "00:11", true));
        radio.add_device(DiscoveredDevice::new("MPT-II", "00:22", true));

        let mut devices = engine.scan();
        devices.changed().await.unwrap();
        let found = devices.borrow().clone();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].vendor, Vendor::RasterVendor);
        assert_eq!(found[1].vendor, Vendor::Generic);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_in_flight_retries() {
        let (radio, _, engine) = engine();
        let engine = Arc::new(engine);
        radio.fail_next_opens(100);
        let config = PrinterConfig::new("A", "A");

        let printing = {
            let engine = Arc::clone(&engine);
            let config = config.clone();
            tokio::spawn(async move { engine.print_markup(&config, "[L]hi").await })
        };
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        engine.shutdown().await;

        let result = printing.await.unwrap();
        assert!(matches!(result, Err(ReceiptError::Cancelled)));
        let opens = radio.open_count();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(radio.open_count(), opens);
    }
}
