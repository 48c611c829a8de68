// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Command implementations.
//
// Each command builds one engine, does its work and shuts the engine down.
// Results go to stdout; logs go to stderr through tracing.

use std::collections::HashSet;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use receiptlink_bridge::memory::{MemoryRadio, MemoryRasterSdk, Wire};
use receiptlink_bridge::{RadioAdapter, RasterSdk, platform_radio, platform_raster_sdk};
use receiptlink_core::{
    AppConfig, OrderId, PaperWidth, PrinterConfig, ReceiptError, Result, Vendor,
};
use receiptlink_print::diagnostics::help_summary;
use receiptlink_print::{Collaborators, PrinterEngine, SqliteOrderStore};

use crate::services::data_dir::{self, ORDERS_DB};
use crate::services::receipt::OrderReceipt;
use crate::services::settings::FileSettingsStore;
use crate::{Cli, Command, VendorArg};

/// In-memory endpoints kept for the hex dump after a dry run.
struct DryRun {
    wire: Arc<Wire>,
    raster: Arc<MemoryRasterSdk>,
}

struct Session {
    engine: Arc<PrinterEngine>,
    settings: Arc<FileSettingsStore>,
    orders: Arc<SqliteOrderStore>,
    dry_run: Option<DryRun>,
    wide: bool,
    vendor: Option<VendorArg>,
}

pub async fn run(cli: Cli) -> Result<ExitCode> {
    let settings = Arc::new(FileSettingsStore::load(data_dir::config_path(
        cli.config.as_deref(),
    )?)?);

    let orders_path = match &cli.command {
        Command::Watch { orders, .. } => orders.clone(),
        _ => None,
    };
    let shop = match &cli.command {
        Command::Watch { shop, .. } => shop.clone(),
        _ => "Receiptlink".to_string(),
    };
    let session = Session::open(&cli, settings, orders_path.as_deref(), &shop)?;

    let outcome = session.dispatch(cli.command).await;
    session.engine.shutdown().await;
    session.dump();
    outcome
}

impl Session {
    fn open(
        cli: &Cli,
        settings: Arc<FileSettingsStore>,
        orders_path: Option<&Path>,
        shop: &str,
    ) -> Result<Self> {
        let app = settings.app_config();

        let radio: Arc<dyn RadioAdapter>;
        let raster: Arc<dyn RasterSdk>;
        let mut dry_run = None;
        if cli.dry_run {
            let wire = Wire::new();
            let memory = MemoryRadio::new(Arc::clone(&wire));
            for device in &app.known_devices {
                memory.add_device(device.clone());
            }
            let sdk = Arc::new(MemoryRasterSdk::new());
            radio = memory;
            raster = sdk.clone();
            dry_run = Some(DryRun { wire, raster: sdk });
        } else {
            radio = platform_radio(app.known_devices.clone());
            raster = platform_raster_sdk();
        }

        let orders = Arc::new(match (cli.dry_run, orders_path) {
            (true, _) => SqliteOrderStore::open_in_memory()?,
            (false, Some(path)) => SqliteOrderStore::open(path)?,
            (false, None) => SqliteOrderStore::open(data_dir::data_dir()?.join(ORDERS_DB))?,
        });

        let engine = PrinterEngine::new(
            radio,
            raster,
            Collaborators {
                orders: orders.clone(),
                settings: settings.clone(),
                content: Arc::new(OrderReceipt::new(shop)),
            },
            app.engine.clone(),
        );

        Ok(Self {
            engine: Arc::new(engine),
            settings,
            orders,
            dry_run,
            wide: cli.wide,
            vendor: cli.vendor,
        })
    }

    async fn dispatch(&self, command: Command) -> Result<ExitCode> {
        match command {
            Command::Scan { timeout } => self.scan(Duration::from_secs(timeout)).await,
            Command::Test { address } => {
                let config = self.printer(&address);
                Ok(exit(self.engine.print_test(&config).await))
            }
            Command::Print { address, file } => {
                let config = self.printer(&address);
                let markup = std::fs::read_to_string(&file)?;
                let report = self.engine.print_markup(&config, &markup).await?;
                println!(
                    "Printed {} bytes in {} groups ({} writes)",
                    report.bytes, report.groups, report.writes
                );
                Ok(ExitCode::SUCCESS)
            }
            Command::Health { address } => {
                let config = self.printer(&address);
                let health = self.engine.query_health(&config).await?;
                println!("{:?}: {}", health.state, health.summary);
                if let Some(detail) = &health.detail {
                    println!("  {detail}");
                }
                if let Some(raw) = &health.raw_bytes {
                    println!("  status bytes: {}", hex::encode(raw));
                }
                Ok(exit(health.as_error().is_none()))
            }
            Command::Diagnose { address, json } => {
                let config = self.printer(&address);
                let report = self.engine.diagnose(&config).await;
                if json {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                } else {
                    print!("{}", help_summary(&report));
                }
                Ok(exit(report.passed()))
            }
            Command::Watch {
                printer, poll_ms, ..
            } => {
                self.watch(printer.as_deref(), Duration::from_millis(poll_ms))
                    .await
            }
        }
    }

    /// Printer settings for `address`: the saved default if it matches, else
    /// a fresh config named after the scanned device.  Command-line flags win.
    fn printer(&self, address: &str) -> PrinterConfig {
        let app = self.settings.app_config();
        let mut config = printer_for(&app, address);
        if self.wide {
            config.paper_width = PaperWidth::Wide;
        }
        match self.vendor {
            Some(VendorArg::Generic) => config.vendor = Vendor::Generic,
            Some(VendorArg::Raster) => config.vendor = Vendor::RasterVendor,
            None => {}
        }
        config
    }

    async fn scan(&self, timeout: Duration) -> Result<ExitCode> {
        let mut devices = self.engine.scan();
        if tokio::time::timeout(timeout, devices.changed()).await.is_err() {
            warn!(seconds = timeout.as_secs(), "scan timed out");
        }
        let found = devices.borrow().clone();
        if found.is_empty() {
            println!("No printers found.");
        }
        for device in found {
            println!(
                "{:<24} {:<22} {:?}{}",
                device.name,
                device.address,
                device.vendor,
                if device.bonded { "" } else { " (not paired)" }
            );
        }
        Ok(ExitCode::SUCCESS)
    }

    async fn watch(&self, printer: Option<&str>, poll: Duration) -> Result<ExitCode> {
        if let Some(address) = printer {
            let config = self.printer(address);
            self.settings.update(|app| {
                app.default_printer = Some(config);
                app.auto_print = true;
            })?;
            info!(address, path = %self.settings.path().display(), "default printer saved");
        }
        let config = self
            .settings
            .app_config()
            .default_printer
            .ok_or(ReceiptError::NoDefaultPrinter)?;
        if !self.engine.connect(&config).await {
            warn!(address = %config.address, "printer not reachable yet, will keep trying");
        }

        let stop = CancellationToken::new();
        let worker = self.engine.start_queue();
        let alerts = {
            let mut alerts = self.engine.alerts();
            let stop = stop.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        alert = alerts.recv() => match alert {
                            Ok(alert) => warn!(
                                address = %alert.address,
                                kind = ?alert.kind,
                                suggestion = %alert.message.suggestion,
                                "{}", alert.message.message
                            ),
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                                warn!(missed = n, "alerts dropped");
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        },
                    }
                }
            })
        };

        info!(address = %config.address, "watching for new orders (Ctrl-C to stop)");
        let mut seen: HashSet<OrderId> = HashSet::new();
        let mut ticker = tokio::time::interval(poll);
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        loop {
            tokio::select! {
                _ = &mut ctrl_c => break,
                _ = ticker.tick() => self.enqueue_new_orders(&mut seen).await,
            }
        }

        info!("stopping");
        stop.cancel();
        self.engine.shutdown().await;
        if let Err(e) = worker.await {
            error!(error = %e, "queue worker panicked");
        }
        let _ = alerts.await;
        Ok(ExitCode::SUCCESS)
    }

    async fn enqueue_new_orders(&self, seen: &mut HashSet<OrderId>) {
        let pending = match self.orders.unprinted_orders() {
            Ok(pending) => pending,
            Err(e) => {
                error!(error = %e, "cannot read orders");
                return;
            }
        };
        for order in pending {
            if !seen.insert(order.id) {
                continue;
            }
            match self.engine.auto_print(&order).await {
                Ok(Some(job)) => info!(order = %order.number, job = %job, "queued"),
                Ok(None) => {}
                Err(e) => {
                    warn!(order = %order.number, error = %e, "auto-print skipped");
                    seen.remove(&order.id);
                }
            }
        }
    }

    fn dump(&self) {
        let Some(dry) = &self.dry_run else {
            return;
        };
        for (i, write) in dry.wire.writes().iter().enumerate() {
            println!("{i:>4}  {}", hex::encode(write));
        }
        let raster = dry.raster.printed();
        if !raster.is_empty() {
            println!("raster: {}", hex::encode(raster));
        }
    }
}

fn printer_for(app: &AppConfig, address: &str) -> PrinterConfig {
    if let Some(saved) = app.default_printer.as_ref().filter(|p| p.address == address) {
        return saved.clone();
    }
    let name = app
        .known_devices
        .iter()
        .find(|d| d.address == address)
        .map_or(address, |d| d.name.as_str());
    PrinterConfig::new(address, name)
}

fn exit(ok: bool) -> ExitCode {
    if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}
