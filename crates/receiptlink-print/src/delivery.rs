// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Print job delivery: ensure connected, nudge, transmit, confirm.
//
// A job gets a bounded number of attempts.  A failure that looks like a dead
// link tears the connection down on the spot, and the next attempt starts by
// reconnecting.  Receipt text is produced once per job and reused by every
// attempt and every copy.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use receiptlink_bridge::{ContentSource, OrderStore};
use receiptlink_core::error::{ReceiptError, Result};
use receiptlink_core::{ErrorClass, Order, OrderId, PrintJob, PrinterConfig};

use crate::connection::ConnectionManager;
use crate::retry::{Attempt, RetryPolicy, retry_with_backoff};
use crate::transmitter::TransmitReport;

pub struct Delivery {
    connection: ConnectionManager,
    orders: Arc<dyn OrderStore>,
    content: Arc<dyn ContentSource>,
    policy: RetryPolicy,
    /// Serialises the read-then-mark confirmation step.
    confirm: tokio::sync::Mutex<()>,
}

impl Delivery {
    pub fn new(
        connection: ConnectionManager,
        orders: Arc<dyn OrderStore>,
        content: Arc<dyn ContentSource>,
    ) -> Self {
        let policy = RetryPolicy::delivery(connection.engine_config());
        Self {
            connection,
            orders,
            content,
            policy,
            confirm: tokio::sync::Mutex::new(()),
        }
    }

    pub fn content(&self) -> &Arc<dyn ContentSource> {
        &self.content
    }

    pub fn orders(&self) -> &Arc<dyn OrderStore> {
        &self.orders
    }

    /// Receipt text for `job`, generated on first use and cached on the job.
    pub fn payload(&self, order: &Order, job: &mut PrintJob, template_id: Option<&str>) -> Result<String> {
        if let Some(cached) = &job.cached_payload {
            return Ok(cached.clone());
        }
        let markup = self.content.order_receipt(order, &job.config, template_id)?;
        if markup.trim().is_empty() {
            return Err(ReceiptError::EmptyContent);
        }
        job.cached_payload = Some(markup.clone());
        Ok(markup)
    }

    /// Deliver one copy of `order` and mark it printed.
    #[instrument(skip_all, fields(order = %order.number, address = %job.config.address, job = %job.id))]
    pub async fn deliver(
        &self,
        order: &Order,
        job: &mut PrintJob,
        template_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<TransmitReport> {
        let markup = self.payload(order, job, template_id)?;
        let report = self.send(&job.config, &markup, cancel).await?;
        info!(bytes = report.bytes, groups = report.groups, "receipt delivered");
        self.confirm(order.id).await;
        Ok(report)
    }

    /// Send marked-up text with the full retry budget, without touching the
    /// order store.
    pub async fn send(
        &self,
        config: &PrinterConfig,
        markup: &str,
        cancel: &CancellationToken,
    ) -> Result<TransmitReport> {
        if markup.trim().is_empty() {
            return Err(ReceiptError::EmptyContent);
        }
        let result = retry_with_backoff(&self.policy, cancel, "print", |attempt| {
            self.attempt(config, markup, attempt, cancel)
        })
        .await;
        if let Err(e) = &result {
            error!(address = %config.address, error = %e, "print failed");
        }
        result
    }

    async fn attempt(
        &self,
        config: &PrinterConfig,
        markup: &str,
        attempt: Attempt,
        cancel: &CancellationToken,
    ) -> Result<TransmitReport> {
        if attempt.previous == Some(ErrorClass::LinkLost) {
            info!(address = %config.address, attempt = attempt.number, "reconnecting before retry");
        }
        self.connection.connect_once(config, cancel).await?;

        let driver = self
            .connection
            .driver(config)
            .await
            .ok_or_else(|| ReceiptError::WriteFailed("link closed before printing".into()))?;

        if let Err(e) = driver.nudge().await {
            debug!(error = %e, "nudge failed, printing anyway");
        }

        match driver.print(markup, cancel).await {
            Ok(report) => Ok(report),
            Err(e) => {
                if e.is_connection_related() {
                    warn!(address = %config.address, error = %e, "link broke mid-job");
                    self.connection.mark_disconnected(&config.address).await;
                }
                Err(e)
            }
        }
    }

    /// Mark `id` printed once, re-reading it first so racing deliveries of
    /// the same order do not both mark it.
    async fn confirm(&self, id: OrderId) {
        let _serial = self.confirm.lock().await;
        let current = match self.orders.get_by_id(id).await {
            Ok(order) => order,
            Err(e) => {
                error!(order = %id, error = %e, "could not re-read order after printing");
                return;
            }
        };
        match current {
            None => warn!(order = %id, "order vanished before it could be marked printed"),
            Some(order) if order.printed => debug!(order = %id, "already marked printed"),
            Some(_) => match self.orders.mark_printed(id).await {
                Ok(true) => info!(order = %id, "order marked printed"),
                Ok(false) => debug!(order = %id, "order marked printed elsewhere"),
                Err(e) => error!(order = %id, error = %e, "could not mark order printed"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use receiptlink_bridge::memory::{FixedContent, MemoryOrderStore, MemoryRadio, Wire};
    use receiptlink_bridge::stub::StubRasterSdk;
    use receiptlink_core::{ConnectionState, EngineConfig};

    use super::*;
    use crate::encoder::cmd;

    struct Fixture {
        radio: Arc<MemoryRadio>,
        orders: Arc<MemoryOrderStore>,
        connection: ConnectionManager,
        delivery: Delivery,
        config: PrinterConfig,
    }

    fn fixture(content: &str) -> Fixture {
        let radio = MemoryRadio::new(Wire::new());
        let orders = MemoryOrderStore::new();
        let connection = ConnectionManager::new(radio.clone(), Arc::new(StubRasterSdk), EngineConfig::default());
        let delivery = Delivery::new(
            connection.clone(),
            orders.clone(),
            Arc::new(FixedContent(content.into())),
        );
        orders.insert(Order::new(7, "A-007"));
        Fixture {
            radio,
            orders,
            connection,
            delivery,
            config: PrinterConfig::new("A", "Counter"),
        }
    }

    async fn order(f: &Fixture) -> Order {
        f.orders.get_by_id(OrderId(7)).await.unwrap().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_and_marks_printed() {
        let f = fixture("[C]Order {number}");
        let order = order(&f).await;
        let mut job = PrintJob::new(order.id, f.config.clone());

        f.delivery
            .deliver(&order, &mut job, None, &CancellationToken::new())
            .await
            .unwrap();

        assert!(f.orders.is_printed(order.id));
        assert_eq!(job.cached_payload.as_deref(), Some("[C]Order A-007"));
        let writes = f.radio.wire().writes();
        assert_eq!(writes.first().unwrap(), cmd::INIT);
        assert_eq!(writes.last().unwrap(), cmd::NUDGE);
        assert_eq!(f.connection.status(&f.config), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_content_is_not_retried() {
        let f = fixture("   ");
        let order = order(&f).await;
        let mut job = PrintJob::new(order.id, f.config.clone());

        let err = f
            .delivery
            .deliver(&order, &mut job, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ReceiptError::EmptyContent));
        assert_eq!(f.radio.open_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn broken_link_reconnects_between_attempts() {
        let f = fixture("[L]line 1\n[L]line 2");
        let order = order(&f).await;
        let mut job = PrintJob::new(order.id, f.config.clone());
        f.connection.connect(&f.config).await.unwrap();
        // Probe and nudge go through, the receipt itself does not.
        f.radio.wire().fail_writes_after(2);

        let started = tokio::time::Instant::now();
        let err = f
            .delivery
            .deliver(&order, &mut job, None, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.is_connection_related());
        assert!(!f.orders.is_printed(order.id));
        // The first connect plus one reconnect before each retry.
        assert_eq!(f.radio.open_count(), 3);
        assert_eq!(f.connection.status(&f.config), ConnectionState::Disconnected);
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_on_a_later_attempt() {
        let f = fixture("[L]hello");
        let order = order(&f).await;
        let mut job = PrintJob::new(order.id, f.config.clone());
        f.connection.connect(&f.config).await.unwrap();
        f.radio.wire().fail_writes_after(2);

        let radio = f.radio.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            radio.wire().heal();
        });

        f.delivery
            .deliver(&order, &mut job, None, &CancellationToken::new())
            .await
            .unwrap();
        assert!(f.orders.is_printed(order.id));
        assert_eq!(f.orders.mark_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_deliveries_mark_once() {
        let f = fixture("[L]hello");
        let order = order(&f).await;
        let mut first = PrintJob::new(order.id, f.config.clone());
        let mut second = PrintJob::new(order.id, f.config.clone());
        let cancel = CancellationToken::new();

        let (a, b) = tokio::join!(
            f.delivery.deliver(&order, &mut first, None, &cancel),
            f.delivery.deliver(&order, &mut second, None, &cancel),
        );
        assert!(a.is_ok() && b.is_ok());
        assert!(f.orders.is_printed(order.id));
        assert_eq!(f.orders.mark_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn refusing_printer_is_opened_once_per_attempt() {
        let f = fixture("[L]hello");
        f.radio.fail_next_opens(1_000);

        let started = tokio::time::Instant::now();
        let err = f
            .delivery
            .send(&f.config, "[L]hello", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ReceiptError::ConnectFailed { attempts: 1, .. }));
        assert_eq!(f.radio.open_count(), 3);
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(f.connection.status(&f.config), ConnectionState::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_a_slow_open_returns_promptly() {
        let f = fixture("[L]hello");
        f.radio.set_open_delay(Duration::from_secs(5));
        let cancel = CancellationToken::new();
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(500)).await;
                cancel.cancel();
            });
        }

        let started = tokio::time::Instant::now();
        let err = f.delivery.send(&f.config, "[L]hello", &cancel).await.unwrap_err();

        assert!(matches!(err, ReceiptError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(f.connection.status(&f.config), ConnectionState::Disconnected);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(f.radio.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn radio_off_fails_without_retrying() {
        let f = fixture("[L]hello");
        f.radio.set_enabled(false);
        let err = f
            .delivery
            .send(&f.config, "[L]hello", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ReceiptError::TransportUnavailable(_)));
    }
}
