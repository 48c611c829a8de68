// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// In-memory implementations of every seam.
//
// Used by the test suites and by the CLI's `--dry-run` mode.  The radio and
// its transports share one `Wire`, which records every byte the engine sends
// and answers status queries from a script.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

use receiptlink_core::error::{ReceiptError, Result};
use receiptlink_core::{DiscoveredDevice, Order, OrderId, PrinterConfig, TransportSettings};

use crate::traits::{
    ByteTransport, ContentSource, DeviceHandle, LinkEvent, OrderStore, RadioAdapter, RasterPort,
    RasterSdk, RasterStatus, SettingsStore,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Wire
// ---------------------------------------------------------------------------

#[derive(Default)]
struct WireState {
    writes: Vec<Vec<u8>>,
    replies: HashMap<Vec<u8>, Vec<u8>>,
    inbound: VecDeque<u8>,
    /// Successful writes remaining before the wire starts failing.
    writes_until_failure: Option<usize>,
}

/// The far end of every in-memory transport.
#[derive(Default)]
pub struct Wire {
    state: Mutex<WireState>,
}

impl Wire {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every write, in order, as it reached the printer.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        lock(&self.state).writes.clone()
    }

    /// All written bytes concatenated.
    pub fn written_bytes(&self) -> Vec<u8> {
        lock(&self.state).writes.concat()
    }

    pub fn clear_writes(&self) {
        lock(&self.state).writes.clear();
    }

    /// Answer `reply` whenever a write equals `query` exactly.
    pub fn reply_to(&self, query: &[u8], reply: &[u8]) {
        lock(&self.state)
            .replies
            .insert(query.to_vec(), reply.to_vec());
    }

    /// Queue bytes the printer sends without being asked.
    pub fn push_unsolicited(&self, bytes: &[u8]) {
        lock(&self.state).inbound.extend(bytes.iter().copied());
    }

    /// Let `n` more writes through, then fail every write after that.
    pub fn fail_writes_after(&self, n: usize) {
        lock(&self.state).writes_until_failure = Some(n);
    }

    /// Stop failing writes.
    pub fn heal(&self) {
        lock(&self.state).writes_until_failure = None;
    }

    fn record(&self, bytes: &[u8]) -> Result<()> {
        let mut state = lock(&self.state);
        if let Some(remaining) = state.writes_until_failure.as_mut() {
            if *remaining == 0 {
                return Err(ReceiptError::WriteFailed("broken pipe".into()));
            }
            *remaining -= 1;
        }
        state.writes.push(bytes.to_vec());
        if let Some(reply) = state.replies.get(bytes).cloned() {
            state.inbound.extend(reply);
        }
        Ok(())
    }

    fn drain(&self) -> Vec<u8> {
        lock(&self.state).inbound.drain(..).collect()
    }
}

// ---------------------------------------------------------------------------
// Radio and transport
// ---------------------------------------------------------------------------

/// Scriptable radio.
pub struct MemoryRadio {
    wire: Arc<Wire>,
    enabled: AtomicBool,
    devices: Mutex<Vec<DiscoveredDevice>>,
    unresolvable: Mutex<HashSet<String>>,
    failing_opens: AtomicU32,
    open_delay: Mutex<Duration>,
    opens: Mutex<Vec<Instant>>,
    live: Mutex<Vec<(String, Arc<AtomicBool>)>>,
    events: broadcast::Sender<LinkEvent>,
}

impl MemoryRadio {
    pub fn new(wire: Arc<Wire>) -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            wire,
            enabled: AtomicBool::new(true),
            devices: Mutex::new(Vec::new()),
            unresolvable: Mutex::new(HashSet::new()),
            failing_opens: AtomicU32::new(0),
            open_delay: Mutex::new(Duration::ZERO),
            opens: Mutex::new(Vec::new()),
            live: Mutex::new(Vec::new()),
            events,
        })
    }

    pub fn wire(&self) -> &Arc<Wire> {
        &self.wire
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Make a device visible to `discover`.
    pub fn add_device(&self, device: DiscoveredDevice) {
        lock(&self.devices).push(device);
    }

    /// `resolve` returns `None` for this address from now on.
    pub fn make_unresolvable(&self, address: &str) {
        lock(&self.unresolvable).insert(address.to_string());
    }

    /// Refuse the next `n` opens.
    pub fn fail_next_opens(&self, n: u32) {
        self.failing_opens.store(n, Ordering::SeqCst);
    }

    /// Delay every open by `delay` (virtual time under a paused clock).
    pub fn set_open_delay(&self, delay: Duration) {
        *lock(&self.open_delay) = delay;
    }

    /// Number of open attempts, successful or not.
    pub fn open_count(&self) -> usize {
        lock(&self.opens).len()
    }

    /// When each open attempt started.
    pub fn open_times(&self) -> Vec<Instant> {
        lock(&self.opens).clone()
    }

    /// Transports for `address` that are still open.
    pub fn live_transports(&self, address: &str) -> usize {
        lock(&self.live)
            .iter()
            .filter(|(a, open)| a == address && open.load(Ordering::SeqCst))
            .count()
    }

    /// Kill every open transport to `address` and announce the loss.
    pub fn drop_link(&self, address: &str) {
        for (a, open) in lock(&self.live).iter() {
            if a == address {
                open.store(false, Ordering::SeqCst);
            }
        }
        let _ = self.events.send(LinkEvent::Disconnected {
            address: address.to_string(),
        });
    }
}

#[async_trait]
impl RadioAdapter for MemoryRadio {
    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    async fn resolve(&self, address: &str) -> Result<Option<DeviceHandle>> {
        if lock(&self.unresolvable).contains(address) {
            return Ok(None);
        }
        let name = lock(&self.devices)
            .iter()
            .find(|d| d.address == address)
            .map(|d| d.name.clone());
        Ok(Some(DeviceHandle {
            address: address.to_string(),
            name,
        }))
    }

    async fn open(
        &self,
        device: &DeviceHandle,
        _settings: &TransportSettings,
    ) -> Result<Box<dyn ByteTransport>> {
        lock(&self.opens).push(Instant::now());

        let delay = *lock(&self.open_delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if !self.is_enabled() {
            return Err(ReceiptError::TransportUnavailable("radio disabled".into()));
        }

        let refused = self
            .failing_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            debug!(address = %device.address, "memory radio refusing open");
            return Err(ReceiptError::ConnectFailed {
                address: device.address.clone(),
                attempts: 1,
                reason: "connection refused".into(),
            });
        }

        let open = Arc::new(AtomicBool::new(true));
        lock(&self.live).push((device.address.clone(), Arc::clone(&open)));
        Ok(Box::new(MemoryTransport {
            address: device.address.clone(),
            wire: Arc::clone(&self.wire),
            open,
        }))
    }

    async fn discover(&self) -> Result<Vec<DiscoveredDevice>> {
        Ok(lock(&self.devices).clone())
    }

    fn link_events(&self) -> Option<broadcast::Receiver<LinkEvent>> {
        Some(self.events.subscribe())
    }
}

/// Transport writing into a shared [`Wire`].
pub struct MemoryTransport {
    address: String,
    wire: Arc<Wire>,
    open: Arc<AtomicBool>,
}

#[async_trait]
impl ByteTransport for MemoryTransport {
    async fn write(&self, bytes: &[u8]) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(ReceiptError::WriteFailed(format!("{} socket closed", self.address)));
        }
        self.wire.record(bytes).inspect_err(|_| {
            self.open.store(false, Ordering::SeqCst);
        })
    }

    async fn read_available(&self) -> Result<Vec<u8>> {
        Ok(self.wire.drain())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    fn describe(&self) -> String {
        format!("memory://{}", self.address)
    }
}

// ---------------------------------------------------------------------------
// Raster vendor SDK
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RasterState {
    status: Mutex<RasterStatus>,
    printed: Mutex<Vec<u8>>,
    ports_opened: AtomicUsize,
    ports_released: AtomicUsize,
    status_fails: AtomicBool,
}

/// In-memory raster SDK.
#[derive(Clone, Default)]
pub struct MemoryRasterSdk {
    state: Arc<RasterState>,
}

impl MemoryRasterSdk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, status: RasterStatus) {
        *lock(&self.state.status) = status;
    }

    /// Make `retrieve_status` fail, as a port whose printer went away does.
    pub fn fail_status(&self, fail: bool) {
        self.state.status_fails.store(fail, Ordering::SeqCst);
    }

    pub fn printed(&self) -> Vec<u8> {
        lock(&self.state.printed).clone()
    }

    pub fn ports_opened(&self) -> usize {
        self.state.ports_opened.load(Ordering::SeqCst)
    }

    pub fn ports_released(&self) -> usize {
        self.state.ports_released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RasterSdk for MemoryRasterSdk {
    fn is_available(&self) -> bool {
        true
    }

    async fn open_port(&self, _address: &str, _timeout: Duration) -> Result<Box<dyn RasterPort>> {
        self.state.ports_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryRasterPort {
            state: Arc::clone(&self.state),
        }))
    }
}

struct MemoryRasterPort {
    state: Arc<RasterState>,
}

#[async_trait]
impl RasterPort for MemoryRasterPort {
    async fn retrieve_status(&self) -> Result<RasterStatus> {
        if self.state.status_fails.load(Ordering::SeqCst) {
            return Err(ReceiptError::Driver("port not responding".into()));
        }
        Ok(*lock(&self.state.status))
    }

    async fn write_port(&self, data: &[u8]) -> Result<usize> {
        lock(&self.state.printed).extend_from_slice(data);
        Ok(data.len())
    }

    async fn release(&self) {
        self.state.ports_released.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Application collaborators
// ---------------------------------------------------------------------------

/// Order store kept in a map.
#[derive(Default)]
pub struct MemoryOrderStore {
    orders: Mutex<HashMap<OrderId, Order>>,
    mark_calls: AtomicUsize,
}

impl MemoryOrderStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, order: Order) {
        lock(&self.orders).insert(order.id, order);
    }

    pub fn is_printed(&self, id: OrderId) -> bool {
        lock(&self.orders).get(&id).is_some_and(|o| o.printed)
    }

    /// How many times `mark_printed` was called.
    pub fn mark_calls(&self) -> usize {
        self.mark_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn get_by_id(&self, id: OrderId) -> Result<Option<Order>> {
        Ok(lock(&self.orders).get(&id).cloned())
    }

    async fn mark_printed(&self, id: OrderId) -> Result<bool> {
        self.mark_calls.fetch_add(1, Ordering::SeqCst);
        let mut orders = lock(&self.orders);
        match orders.get_mut(&id) {
            Some(order) if !order.printed => {
                order.printed = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Settings fixed at construction.
#[derive(Debug, Clone, Default)]
pub struct StaticSettings {
    pub default_printer: Option<PrinterConfig>,
    pub auto_print: bool,
}

impl SettingsStore for StaticSettings {
    fn default_printer(&self) -> Option<PrinterConfig> {
        self.default_printer.clone()
    }

    fn auto_print_enabled(&self) -> bool {
        self.auto_print
    }
}

/// Content source that renders every order with the same text.
///
/// `{number}` is replaced by the order number.
#[derive(Debug, Clone)]
pub struct FixedContent(pub String);

impl ContentSource for FixedContent {
    fn order_receipt(
        &self,
        order: &Order,
        _config: &PrinterConfig,
        _template_id: Option<&str>,
    ) -> Result<String> {
        Ok(self.0.replace("{number}", &order.number))
    }
}
