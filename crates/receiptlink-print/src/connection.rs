// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Connection state machine.
//
// One `ConnectionManager` owns the single active printer driver.  Structural
// transitions (open, replace, tear down) happen under one async mutex; the
// per-address `ConnectionState` is published through watch channels so reads
// never wait.  Connect calls for the same address collapse onto one in-flight
// attempt, and every connect, successful or not, leaves a liveness monitor
// running for its printer.
//
//   Disconnected ──connect──▶ Connecting ──ok──▶ Connected
//        ▲                        │                  │
//        └──────disconnect────────┴──fail──▶ Error ◀─┘ (probe/write failure
//                                                       goes to Disconnected)

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use receiptlink_bridge::{RadioAdapter, RasterSdk};
use receiptlink_core::error::{ReceiptError, Result, classify_error};
use receiptlink_core::{ConnectionState, EngineConfig, ErrorClass, PrinterConfig, Vendor};

use crate::driver::{GenericDriver, PrinterDriver, RasterDriver};
use crate::monitor::{self, MonitorHandle, PrinterAlert};
use crate::retry::{RetryPolicy, retry_with_backoff};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The live driver and the config it was opened for.
struct Active {
    config: PrinterConfig,
    driver: Arc<dyn PrinterDriver>,
    generation: u64,
}

#[derive(Default)]
struct Slot {
    active: Option<Active>,
    generation: u64,
}

/// Outcome of an in-flight connect, replayed to callers that joined it.
#[derive(Debug, Clone)]
enum SharedOutcome {
    Connected,
    Unavailable(String),
    Platform,
    Cancelled,
    Failed { attempts: u32, reason: String },
}

impl SharedOutcome {
    fn from_result(result: &Result<()>) -> Self {
        match result {
            Ok(()) => Self::Connected,
            Err(ReceiptError::TransportUnavailable(m)) => Self::Unavailable(m.clone()),
            Err(ReceiptError::PlatformUnavailable) => Self::Platform,
            Err(ReceiptError::Cancelled) => Self::Cancelled,
            Err(ReceiptError::ConnectFailed {
                attempts, reason, ..
            }) => Self::Failed {
                attempts: *attempts,
                reason: reason.clone(),
            },
            Err(e) => Self::Failed {
                attempts: 1,
                reason: e.to_string(),
            },
        }
    }

    fn replay(self, address: &str) -> Result<()> {
        match self {
            Self::Connected => Ok(()),
            Self::Unavailable(m) => Err(ReceiptError::TransportUnavailable(m)),
            Self::Platform => Err(ReceiptError::PlatformUnavailable),
            Self::Cancelled => Err(ReceiptError::Cancelled),
            Self::Failed { attempts, reason } => Err(ReceiptError::ConnectFailed {
                address: address.to_string(),
                attempts,
                reason,
            }),
        }
    }
}

pub(crate) struct Inner {
    pub(crate) radio: Arc<dyn RadioAdapter>,
    raster: Arc<dyn RasterSdk>,
    pub(crate) config: EngineConfig,
    /// Structural mutex.
    slot: tokio::sync::Mutex<Slot>,
    states: RwLock<HashMap<String, watch::Sender<ConnectionState>>>,
    in_flight: Mutex<HashMap<String, watch::Receiver<Option<SharedOutcome>>>>,
    /// Addresses the caller disconnected on purpose.
    suppressed: Mutex<HashSet<String>>,
    monitor: Mutex<Option<MonitorHandle>>,
    alerts: broadcast::Sender<PrinterAlert>,
    pub(crate) shutdown: CancellationToken,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Removes the in-flight entry when the leading connect finishes or is
/// dropped.
struct InFlightGuard<'a> {
    inner: &'a Inner,
    address: String,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        lock(&self.inner.in_flight).remove(&self.address);
    }
}

/// Owner of the printer connection. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionManager {
    pub(crate) inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(radio: Arc<dyn RadioAdapter>, raster: Arc<dyn RasterSdk>, config: EngineConfig) -> Self {
        let (alerts, _) = broadcast::channel(32);
        Self {
            inner: Arc::new(Inner {
                radio,
                raster,
                config,
                slot: tokio::sync::Mutex::new(Slot::default()),
                states: RwLock::new(HashMap::new()),
                in_flight: Mutex::new(HashMap::new()),
                suppressed: Mutex::new(HashSet::new()),
                monitor: Mutex::new(None),
                alerts,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn engine_config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn radio(&self) -> &Arc<dyn RadioAdapter> {
        &self.inner.radio
    }

    pub fn raster_available(&self) -> bool {
        self.inner.raster.is_available()
    }

    // -- State -------------------------------------------------------------

    fn with_sender<R>(&self, address: &str, f: impl FnOnce(&watch::Sender<ConnectionState>) -> R) -> R {
        {
            let states = self.inner.states.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(tx) = states.get(address) {
                return f(tx);
            }
        }
        let mut states = self.inner.states.write().unwrap_or_else(PoisonError::into_inner);
        let tx = states
            .entry(address.to_string())
            .or_insert_with(|| watch::channel(ConnectionState::Disconnected).0);
        f(tx)
    }

    pub(crate) fn set_state(&self, address: &str, state: ConnectionState) {
        let changed = self.with_sender(address, |tx| {
            tx.send_if_modified(|current| {
                if *current == state {
                    false
                } else {
                    *current = state;
                    true
                }
            })
        });
        if changed {
            info!(address, %state, "connection state");
        }
    }

    /// Last published state, without the liveness cross-check.
    pub(crate) fn published_state(&self, address: &str) -> ConnectionState {
        self.with_sender(address, |tx| *tx.borrow())
    }

    /// Current state of `config`'s printer.
    ///
    /// A `Connected` state whose driver has gone away is corrected to
    /// `Disconnected` on the spot.
    pub fn status(&self, config: &PrinterConfig) -> ConnectionState {
        let address = config.address.as_str();
        let state = self.published_state(address);
        if state != ConnectionState::Connected {
            return state;
        }
        // A held lock means a transition is under way; its outcome will be
        // published shortly.
        let Ok(slot) = self.inner.slot.try_lock() else {
            return state;
        };
        let live = slot
            .active
            .as_ref()
            .is_some_and(|a| a.config.address == address && a.driver.is_live());
        drop(slot);
        if live {
            state
        } else {
            warn!(address, "connected without a live link, correcting");
            self.set_state(address, ConnectionState::Disconnected);
            ConnectionState::Disconnected
        }
    }

    pub fn status_stream(&self, config: &PrinterConfig) -> watch::Receiver<ConnectionState> {
        self.with_sender(&config.address, |tx| tx.subscribe())
    }

    pub fn alerts(&self) -> broadcast::Receiver<PrinterAlert> {
        self.inner.alerts.subscribe()
    }

    pub(crate) fn emit(&self, alert: PrinterAlert) {
        warn!(address = %alert.address, kind = ?alert.kind, "{}", alert.message.message);
        let _ = self.inner.alerts.send(alert);
    }

    pub(crate) fn is_suppressed(&self, address: &str) -> bool {
        lock(&self.inner.suppressed).contains(address)
    }

    /// Config of the printer currently holding the link, if any.
    pub async fn active_config(&self) -> Option<PrinterConfig> {
        let slot = self.inner.slot.lock().await;
        slot.active.as_ref().map(|a| a.config.clone())
    }

    /// Address of the running liveness monitor, if any.
    pub fn monitored_address(&self) -> Option<String> {
        lock(&self.inner.monitor)
            .as_ref()
            .filter(|h| !h.is_finished())
            .map(|h| h.address.clone())
    }

    // -- Connect -----------------------------------------------------------

    /// Connect to `config`'s printer, retrying with linear backoff.
    pub async fn connect(&self, config: &PrinterConfig) -> Result<()> {
        let shutdown = self.inner.shutdown.clone();
        self.connect_cancellable(config, &shutdown).await
    }

    /// `connect`, giving up with `Cancelled` as soon as `cancel` fires.
    #[instrument(skip(self, config, cancel), fields(address = %config.address, vendor = ?config.vendor))]
    pub async fn connect_cancellable(
        &self,
        config: &PrinterConfig,
        cancel: &CancellationToken,
    ) -> Result<()> {
        lock(&self.inner.suppressed).remove(&config.address);
        self.connect_with(config, RetryPolicy::connect(&self.inner.config), cancel)
            .await
    }

    /// A single connect attempt on behalf of a caller that runs its own
    /// retry budget.
    pub async fn connect_once(
        &self,
        config: &PrinterConfig,
        cancel: &CancellationToken,
    ) -> Result<()> {
        lock(&self.inner.suppressed).remove(&config.address);
        self.connect_with(config, RetryPolicy::once(), cancel).await
    }

    /// Connect with an explicit retry policy, joining an in-flight attempt
    /// for the same address when there is one.
    ///
    /// A joined caller stops waiting when its own `cancel` fires.  If the
    /// attempt it joined was cancelled by someone else, it starts over.
    pub(crate) async fn connect_with(
        &self,
        config: &PrinterConfig,
        policy: RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let address = config.address.clone();

        loop {
            if cancel.is_cancelled() {
                return Err(ReceiptError::Cancelled);
            }

            let joined = {
                let mut in_flight = lock(&self.inner.in_flight);
                match in_flight.get(&address) {
                    Some(rx) => Err(rx.clone()),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        in_flight.insert(address.clone(), rx);
                        Ok(tx)
                    }
                }
            };

            let tx = match joined {
                Ok(tx) => tx,
                Err(mut rx) => {
                    debug!(address, "joining in-flight connect");
                    let outcome = tokio::select! {
                        _ = cancel.cancelled() => return Err(ReceiptError::Cancelled),
                        waited = rx.wait_for(Option::is_some) => match waited {
                            Ok(outcome) => outcome.clone(),
                            Err(_) => None,
                        },
                    };
                    match outcome.unwrap_or(SharedOutcome::Cancelled) {
                        SharedOutcome::Cancelled if !self.inner.shutdown.is_cancelled() => {
                            debug!(address, "joined connect was cancelled, starting over");
                            tokio::task::yield_now().await;
                            continue;
                        }
                        other => return other.replay(&address),
                    }
                }
            };

            let guard = InFlightGuard {
                inner: &self.inner,
                address: address.clone(),
            };
            let result = self.connect_leader(config, policy, cancel).await;
            let _ = tx.send(Some(SharedOutcome::from_result(&result)));
            drop(guard);
            return result;
        }
    }

    async fn connect_leader(
        &self,
        config: &PrinterConfig,
        policy: RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let address = config.address.as_str();
        let mut slot = tokio::select! {
            _ = cancel.cancelled() => return Err(ReceiptError::Cancelled),
            slot = self.inner.slot.lock() => slot,
        };

        if !self.inner.radio.is_enabled() {
            warn!(address, "radio is off");
            self.set_state(address, ConnectionState::Error);
            // The monitor stays with a printer that still holds the link.
            let holds_other = slot
                .active
                .as_ref()
                .is_some_and(|a| a.config.address != config.address);
            if !holds_other {
                self.ensure_monitor(config).await;
            }
            return Err(ReceiptError::TransportUnavailable("radio disabled".into()));
        }

        let reusable = slot
            .active
            .as_ref()
            .filter(|a| a.config == *config)
            .map(|a| Arc::clone(&a.driver));
        if let Some(driver) = reusable {
            if driver.is_live() && driver.probe().await.is_ok() {
                debug!(address, "already connected, probe ok");
                self.set_state(address, ConnectionState::Connected);
                self.ensure_monitor(config).await;
                return Ok(());
            }
            warn!(address, "existing link failed its probe, reconnecting");
        }
        if slot.active.is_some() {
            self.teardown(&mut slot).await;
        }

        self.set_state(address, ConnectionState::Connecting);
        let mut attempts = 0;
        let opened = tokio::select! {
            _ = cancel.cancelled() => Err(ReceiptError::Cancelled),
            opened = retry_with_backoff(&policy, &self.inner.shutdown, "connect", |attempt| {
                attempts = attempt.number;
                self.open_driver(config)
            }) => opened,
        };

        match opened {
            Ok(driver) => {
                slot.generation += 1;
                slot.active = Some(Active {
                    config: config.clone(),
                    driver,
                    generation: slot.generation,
                });
                self.set_state(address, ConnectionState::Connected);
                info!(address, attempts, "printer connected");
                self.ensure_monitor(config).await;
                Ok(())
            }
            Err(ReceiptError::Cancelled) => {
                self.set_state(address, ConnectionState::Disconnected);
                info!(address, attempts, "connect cancelled");
                Err(ReceiptError::Cancelled)
            }
            Err(e) => {
                self.set_state(address, ConnectionState::Error);
                error!(address, attempts, error = %e, "connect failed");
                self.ensure_monitor(config).await;
                Err(match classify_error(&e) {
                    ErrorClass::Transient | ErrorClass::LinkLost => {
                        let reason = match e {
                            ReceiptError::ConnectFailed { reason, .. } => reason,
                            other => other.to_string(),
                        };
                        ReceiptError::ConnectFailed {
                            address: address.to_string(),
                            attempts,
                            reason,
                        }
                    }
                    ErrorClass::UserAction | ErrorClass::Permanent => e,
                })
            }
        }
    }

    /// Open the vendor-appropriate driver. Called under the structural lock.
    async fn open_driver(&self, config: &PrinterConfig) -> Result<Arc<dyn PrinterDriver>> {
        let settings = self.inner.config.transport_settings();
        match config.vendor {
            Vendor::RasterVendor => {
                let driver =
                    RasterDriver::open(self.inner.raster.as_ref(), config, settings.connect_timeout)
                        .await?;
                Ok(Arc::new(driver))
            }
            Vendor::Generic => {
                let device = self
                    .inner
                    .radio
                    .resolve(&config.address)
                    .await?
                    .ok_or_else(|| {
                        ReceiptError::TransportUnavailable(format!(
                            "{} is not paired or out of range",
                            config.address
                        ))
                    })?;
                let transport = self.inner.radio.open(&device, &settings).await?;
                debug!(transport = %transport.describe(), "transport open");
                Ok(Arc::new(GenericDriver::new(config, transport, &self.inner.config)))
            }
        }
    }

    // -- Teardown ----------------------------------------------------------

    async fn teardown(&self, slot: &mut Slot) {
        if let Some(active) = slot.active.take() {
            active.driver.shutdown().await;
            self.set_state(&active.config.address, ConnectionState::Disconnected);
            info!(address = %active.config.address, "link closed");
        }
    }

    /// Caller-initiated disconnect. Idempotent and never alerts.
    #[instrument(skip(self, config), fields(address = %config.address))]
    pub async fn disconnect(&self, config: &PrinterConfig) {
        let address = config.address.as_str();
        lock(&self.inner.suppressed).insert(address.to_string());

        if self.monitored_address().as_deref() == Some(address) {
            self.stop_monitor().await;
        }

        let mut slot = self.inner.slot.lock().await;
        if slot
            .active
            .as_ref()
            .is_some_and(|a| a.config.address == address)
        {
            self.teardown(&mut slot).await;
        }
        self.set_state(address, ConnectionState::Disconnected);
    }

    /// Tear down the link to `address` after a failure seen by a caller.
    pub async fn mark_disconnected(&self, address: &str) {
        let mut slot = self.inner.slot.lock().await;
        if slot
            .active
            .as_ref()
            .is_some_and(|a| a.config.address == address)
        {
            warn!(address, "link reported broken");
            self.teardown(&mut slot).await;
        }
        self.set_state(address, ConnectionState::Disconnected);
    }

    /// Handle a radio link-loss notification for `address`.
    ///
    /// Only a driver that has actually lost its link is torn down; a link
    /// that was replaced since the notification was raised stays up.
    /// Returns whether the printer is now without a link.
    pub(crate) async fn drop_if_dead(&self, address: &str) -> bool {
        let mut slot = self.inner.slot.lock().await;
        let live = match slot.active.as_ref() {
            Some(a) if a.config.address == address => a.driver.is_live(),
            Some(_) => return false,
            None => return true,
        };
        if live {
            debug!(address, "link event for a replaced link, ignoring");
            return false;
        }
        self.teardown(&mut slot).await;
        true
    }

    /// Tear down only if the driver of `generation` is still the active one.
    pub(crate) async fn drop_generation(&self, generation: u64) {
        let mut slot = self.inner.slot.lock().await;
        if slot
            .active
            .as_ref()
            .is_some_and(|a| a.generation == generation)
        {
            self.teardown(&mut slot).await;
        }
    }

    /// Driver for `config`'s printer if it currently holds the link.
    pub async fn driver(&self, config: &PrinterConfig) -> Option<Arc<dyn PrinterDriver>> {
        self.current_driver(&config.address)
            .await
            .map(|(_, driver)| driver)
    }

    pub(crate) async fn current_driver(&self, address: &str) -> Option<(u64, Arc<dyn PrinterDriver>)> {
        let slot = self.inner.slot.lock().await;
        slot.active
            .as_ref()
            .filter(|a| a.config.address == address)
            .map(|a| (a.generation, Arc::clone(&a.driver)))
    }

    /// Stop the monitor, abandon in-flight connects and release the link.
    /// The manager accepts no further work afterwards.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.stop_monitor().await;
        let mut slot = self.inner.slot.lock().await;
        self.teardown(&mut slot).await;
    }

    // -- Monitor -----------------------------------------------------------

    /// Make sure exactly one monitor runs, and that it watches `config`.
    async fn ensure_monitor(&self, config: &PrinterConfig) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        let stale = {
            let mut current = lock(&self.inner.monitor);
            match current.as_ref() {
                Some(h) if h.address == config.address && !h.is_finished() => return,
                _ => current.take(),
            }
        };
        if let Some(old) = stale {
            old.stop().await;
        }
        let handle = monitor::spawn(self, config.clone());
        *lock(&self.inner.monitor) = Some(handle);
    }

    /// Stop the monitor and wait until its task has ended.
    pub(crate) async fn stop_monitor(&self) {
        let handle = lock(&self.inner.monitor).take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }
}
