// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Liveness monitor.
//
// One background task per connection manager watches the active printer.
// Every heartbeat it probes the live driver; with no driver it tries to
// reconnect, spacing attempts with an exponential window so a printer that
// has been switched off is not hammered.  Radio link-loss notifications tear
// the link down at once and, unless the link comes back within a short
// debounce, raise an operator alert.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use receiptlink_bridge::LinkEvent;
use receiptlink_core::human_errors::{self, HumanError};
use receiptlink_core::{ConnectionState, EngineConfig, PrinterConfig};

use crate::connection::{ConnectionManager, Inner};
use crate::retry::{Backoff, RetryPolicy};

/// What the operator is told about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    /// The radio reported the link gone and it did not come back.
    LinkLost,
    /// Reconnecting has failed repeatedly.
    ReconnectFailing,
}

#[derive(Debug, Clone)]
pub struct PrinterAlert {
    pub address: String,
    pub kind: AlertKind,
    pub message: HumanError,
}

// ---------------------------------------------------------------------------
// Reconnect spacing
// ---------------------------------------------------------------------------

/// Exponential spacing between reconnect attempts.
///
/// After the n-th consecutive failure the next attempt waits
/// `base * 2^(n-1)`, capped at `max`.  A failure streak longer than
/// `reset_after` starts the window over.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    window: Backoff,
    reset_after: Duration,
    failures: u32,
    last_attempt: Option<Instant>,
    failing_since: Option<Instant>,
}

impl ReconnectBackoff {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            window: Backoff::Exponential {
                base: config.reconnect_base(),
                max: config.reconnect_max(),
            },
            reset_after: config.backoff_reset_after(),
            failures: 0,
            last_attempt: None,
            failing_since: None,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Current spacing window.
    pub fn window(&self) -> Duration {
        if self.failures == 0 {
            Duration::ZERO
        } else {
            self.window.delay(self.failures)
        }
    }

    /// Whether an attempt may be made at `now`.
    pub fn ready(&mut self, now: Instant) -> bool {
        if let Some(since) = self.failing_since {
            if now.saturating_duration_since(since) >= self.reset_after {
                info!(failures = self.failures, "reconnect backoff reset after sustained failure");
                self.failures = 0;
                self.failing_since = Some(now);
            }
        }
        match self.last_attempt {
            None => true,
            Some(at) => now.saturating_duration_since(at) >= self.window(),
        }
    }

    pub fn record_failure(&mut self, at: Instant) {
        self.failures = self.failures.saturating_add(1);
        self.last_attempt = Some(at);
        self.failing_since.get_or_insert(at);
    }

    pub fn record_success(&mut self) {
        if self.failures > 0 {
            info!(failures = self.failures, "printer recovered, backoff cleared");
        }
        self.failures = 0;
        self.last_attempt = None;
        self.failing_since = None;
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

pub(crate) struct MonitorHandle {
    pub(crate) address: String,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub(crate) fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel and wait for the task to end.
    pub(crate) async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
        debug!(address = %self.address, "monitor joined");
    }
}

pub(crate) fn spawn(manager: &ConnectionManager, config: PrinterConfig) -> MonitorHandle {
    let cancel = manager.inner.shutdown.child_token();
    let events = manager.inner.radio.link_events();
    let weak = Arc::downgrade(&manager.inner);
    let address = config.address.clone();
    let task = tokio::spawn(run(weak, config, cancel.clone(), events));
    MonitorHandle {
        address,
        cancel,
        task,
    }
}

enum Wake {
    Tick,
    Link(LinkEvent),
    Debounce,
}

/// Per-task bookkeeping.
struct Watch {
    config: PrinterConfig,
    backoff: ReconnectBackoff,
    alert_after: u32,
    debounce: Duration,
    reconnect_alerted: bool,
    link_alert_at: Option<Instant>,
}

async fn run(
    weak: Weak<Inner>,
    config: PrinterConfig,
    cancel: CancellationToken,
    mut events: Option<broadcast::Receiver<LinkEvent>>,
) {
    let engine = match weak.upgrade() {
        Some(inner) => inner.config.clone(),
        None => return,
    };
    let period = engine.heartbeat_interval();
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut watch = Watch {
        backoff: ReconnectBackoff::new(&engine),
        alert_after: engine.alert_after_failures.max(1),
        debounce: engine.alert_debounce(),
        reconnect_alerted: false,
        link_alert_at: None,
        config,
    };
    info!(address = %watch.config.address, period_ms = period.as_millis() as u64, "liveness monitor started");

    loop {
        let debounce_at = watch.link_alert_at;
        let wake = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = next_event(&mut events) => Wake::Link(event),
            _ = tokio::time::sleep_until(debounce_at.unwrap_or_else(Instant::now)), if debounce_at.is_some() => Wake::Debounce,
            _ = ticker.tick() => Wake::Tick,
        };

        // The manager is only borrowed for one wake-up so dropping it ends
        // the task.
        let Some(inner) = weak.upgrade() else { break };
        let manager = ConnectionManager { inner };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = watch.handle(wake, &manager) => {}
        }
    }

    info!(address = %watch.config.address, "liveness monitor stopped");
}

async fn next_event(events: &mut Option<broadcast::Receiver<LinkEvent>>) -> LinkEvent {
    loop {
        let Some(rx) = events.as_mut() else {
            return std::future::pending().await;
        };
        let received = rx.recv().await;
        match received {
            Ok(event) => return event,
            Err(RecvError::Lagged(missed)) => debug!(missed, "link events lagged"),
            Err(RecvError::Closed) => *events = None,
        }
    }
}

impl Watch {
    async fn handle(&mut self, wake: Wake, manager: &ConnectionManager) {
        match wake {
            Wake::Tick => self.cycle(manager).await,
            Wake::Link(LinkEvent::Disconnected { address }) => {
                if address != self.config.address {
                    return;
                }
                warn!(address, "radio reports link lost");
                if manager.drop_if_dead(&address).await && !manager.is_suppressed(&address) {
                    self.link_alert_at = Some(Instant::now() + self.debounce);
                }
            }
            Wake::Debounce => {
                self.link_alert_at = None;
                let address = self.config.address.as_str();
                if manager.published_state(address) != ConnectionState::Connected
                    && !manager.is_suppressed(address)
                {
                    manager.emit(PrinterAlert {
                        address: address.to_string(),
                        kind: AlertKind::LinkLost,
                        message: human_errors::link_lost(&self.config.display_name),
                    });
                }
            }
        }
    }

    async fn cycle(&mut self, manager: &ConnectionManager) {
        let address = self.config.address.as_str();

        if let Some((generation, driver)) = manager.current_driver(address).await {
            let alive = if driver.is_live() {
                match driver.probe().await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(address, error = %e, "heartbeat probe failed");
                        false
                    }
                }
            } else {
                false
            };

            if alive {
                self.recovered();
            } else {
                manager.drop_generation(generation).await;
                manager.set_state(address, ConnectionState::Disconnected);
                self.backoff.record_failure(Instant::now());
                self.maybe_alert(manager);
            }
            return;
        }

        let now = Instant::now();
        if !self.backoff.ready(now) {
            debug!(address, failures = self.backoff.failures(), "inside reconnect window");
            return;
        }

        match manager
            .connect_with(&self.config, RetryPolicy::once(), &manager.inner.shutdown)
            .await
        {
            Ok(()) => {
                info!(address, "monitor reconnected");
                self.recovered();
            }
            Err(e) => {
                self.backoff.record_failure(now);
                warn!(
                    address,
                    failures = self.backoff.failures(),
                    next_window_ms = self.backoff.window().as_millis() as u64,
                    error = %e,
                    "monitor reconnect failed"
                );
                self.maybe_alert(manager);
            }
        }
    }

    fn recovered(&mut self) {
        self.backoff.record_success();
        self.reconnect_alerted = false;
    }

    fn maybe_alert(&mut self, manager: &ConnectionManager) {
        let address = self.config.address.as_str();
        if self.reconnect_alerted
            || self.backoff.failures() < self.alert_after
            || manager.is_suppressed(address)
        {
            return;
        }
        self.reconnect_alerted = true;
        manager.emit(PrinterAlert {
            address: address.to_string(),
            kind: AlertKind::ReconnectFailing,
            message: human_errors::reconnect_failing(
                &self.config.display_name,
                self.backoff.failures(),
            ),
        });
    }
}
