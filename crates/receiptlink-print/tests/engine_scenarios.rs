// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// End-to-end scenarios against the public engine API, on the in-memory radio
// and the paused clock.

use std::sync::Arc;
use std::time::Duration;

use receiptlink_bridge::memory::{FixedContent, MemoryOrderStore, MemoryRadio, StaticSettings, Wire};
use receiptlink_bridge::stub::StubRasterSdk;
use receiptlink_core::{ConnectionState, EngineConfig, HealthState, Order, PrinterConfig};
use receiptlink_print::encoder::cmd;
use receiptlink_print::status::QUERIES;
use receiptlink_print::{Collaborators, PrinterEngine};

struct Harness {
    radio: Arc<MemoryRadio>,
    orders: Arc<MemoryOrderStore>,
    engine: Arc<PrinterEngine>,
    printer: PrinterConfig,
}

fn harness(receipt: &str) -> Harness {
    let radio = MemoryRadio::new(Wire::new());
    let orders = MemoryOrderStore::new();
    let engine = PrinterEngine::new(
        radio.clone(),
        Arc::new(StubRasterSdk),
        Collaborators {
            orders: orders.clone(),
            settings: Arc::new(StaticSettings::default()),
            content: Arc::new(FixedContent(receipt.into())),
        },
        EngineConfig::default(),
    );
    Harness {
        radio,
        orders,
        engine: Arc::new(engine),
        printer: PrinterConfig::new("66:22:B3:0F:1C:9A", "MPT-II"),
    }
}

fn occurrences(haystack: &[u8], needle: &[u8]) -> usize {
    haystack.windows(needle.len()).filter(|w| *w == needle).count()
}

/// `Connected` must never be published without a live driver behind it.
async fn assert_connected_means_live(h: &Harness) {
    let connection = h.engine.connection();
    if connection.status(&h.printer) == ConnectionState::Connected {
        let driver = connection.driver(&h.printer).await;
        assert!(driver.is_some_and(|d| d.is_live()));
    }
}

#[tokio::test(start_paused = true)]
async fn concurrent_connects_share_one_open() {
    let h = harness("[L]x");
    h.radio.set_open_delay(Duration::from_millis(200));

    let (a, b, c) = tokio::join!(
        h.engine.connect(&h.printer),
        h.engine.connect(&h.printer),
        h.engine.connect(&h.printer),
    );
    assert!(a && b && c);
    assert_eq!(h.radio.open_count(), 1);
    assert_connected_means_live(&h).await;
}

#[tokio::test(start_paused = true)]
async fn short_auto_cut_receipt_is_one_group_and_a_nudge() {
    let h = harness("[C]<b>ORDER {number}</b>\n[L]Latte[R]4.50\n[L]Total[R]4.50");
    let order = Order::new(1, "A-1");
    h.orders.insert(order.clone());
    assert!(h.printer.auto_cut);

    assert!(h.engine.print_job(&order, &h.printer, None).await);

    let writes = h.radio.wire().writes();
    let bytes = h.radio.wire().written_bytes();
    assert_eq!(writes.iter().filter(|w| w.as_slice() == cmd::FLUSH).count(), 1);
    assert_eq!(writes.last().map(Vec::as_slice), Some(cmd::NUDGE));
    assert_eq!(occurrences(&bytes, cmd::PARTIAL_CUT), 1);
    assert_eq!(h.engine.status(&h.printer), ConnectionState::Connected);
    assert!(h.orders.is_printed(order.id));
    assert_connected_means_live(&h).await;
}

#[tokio::test(start_paused = true)]
async fn cover_open_reads_as_offline() {
    let h = harness("[L]x");
    h.radio.wire().reply_to(&QUERIES[0].command, &[0x16]);
    h.radio.wire().reply_to(&QUERIES[1].command, &[0x12]);
    h.radio.wire().reply_to(&QUERIES[2].command, &[0x12]);

    let health = h.engine.query_health(&h.printer).await.unwrap();
    assert_eq!(health.state, HealthState::Offline);
    let detail = health.detail.unwrap();
    assert!(detail.contains("cover") || detail.contains("paper"), "{detail}");
    // A printer reporting a problem is still connected.
    assert_eq!(h.engine.status(&h.printer), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn broken_pipe_mid_job_fails_after_three_attempts() {
    let h = harness("[L]line one\n[L]line two\n[L]line three");
    let order = Order::new(2, "B-2");
    h.orders.insert(order.clone());
    assert!(h.engine.connect(&h.printer).await);
    // Probe and nudge pass, the receipt write breaks the pipe.
    h.radio.wire().fail_writes_after(2);

    assert!(!h.engine.print_job(&order, &h.printer, None).await);

    assert!(!h.orders.is_printed(order.id));
    assert_eq!(h.engine.status(&h.printer), ConnectionState::Disconnected);
    let opens = h.radio.open_times();
    assert_eq!(opens.len(), 3, "one connect and a reconnect before each retry");
    assert!(opens[1] - opens[0] >= Duration::from_secs(1));
    assert!(opens[2] - opens[1] >= Duration::from_secs(1));
    assert_connected_means_live(&h).await;
}

#[tokio::test(start_paused = true)]
async fn monitor_spaces_out_failing_reconnects() {
    let h = harness("[L]x");
    h.radio.fail_next_opens(1_000);
    assert!(!h.engine.connect(&h.printer).await);
    assert_eq!(h.engine.status(&h.printer), ConnectionState::Error);
    let caller_opens = h.radio.open_count();

    tokio::time::sleep(Duration::from_secs(90)).await;

    let monitor_opens = h.radio.open_times()[caller_opens..].to_vec();
    assert!(monitor_opens.len() >= 3);
    let gaps: Vec<Duration> = monitor_opens.windows(2).map(|w| w[1] - w[0]).collect();
    assert!(gaps[1] > gaps[0], "{gaps:?}");
    assert!(gaps.iter().all(|g| *g <= Duration::from_secs(65)));
}

#[tokio::test(start_paused = true)]
async fn racing_print_jobs_mark_the_order_once() {
    let h = harness("[L]{number}");
    let order = Order::new(3, "C-3");
    h.orders.insert(order.clone());

    let jobs: Vec<_> = (0..4)
        .map(|_| {
            let engine = Arc::clone(&h.engine);
            let order = order.clone();
            let printer = h.printer.clone();
            tokio::spawn(async move { engine.print_job(&order, &printer, None).await })
        })
        .collect();
    for job in jobs {
        assert!(job.await.unwrap());
    }

    assert!(h.orders.is_printed(order.id));
    assert_eq!(h.orders.mark_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn link_loss_then_recovery_without_caller_action() {
    let h = harness("[L]x");
    assert!(h.engine.connect(&h.printer).await);
    let mut states = h.engine.status_stream(&h.printer);

    h.radio.drop_link(&h.printer.address);
    states
        .wait_for(|s| *s == ConnectionState::Disconnected)
        .await
        .unwrap();
    assert_connected_means_live(&h).await;

    states
        .wait_for(|s| *s == ConnectionState::Connected)
        .await
        .unwrap();
    assert_eq!(h.radio.open_count(), 2);
    assert_connected_means_live(&h).await;
}

#[tokio::test(start_paused = true)]
async fn disconnect_is_quiet_and_final() {
    let h = harness("[L]x");
    let mut alerts = h.engine.alerts();
    assert!(h.engine.connect(&h.printer).await);

    h.engine.disconnect(&h.printer).await;
    h.engine.disconnect(&h.printer).await;
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(h.engine.status(&h.printer), ConnectionState::Disconnected);
    assert_eq!(h.radio.open_count(), 1);
    assert!(alerts.try_recv().is_err());
}
