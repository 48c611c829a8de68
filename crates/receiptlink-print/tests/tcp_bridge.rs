// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Delivery over a real socket: a local listener plays the serial bridge and
// the SQLite store holds the order.

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

use receiptlink_bridge::memory::{FixedContent, StaticSettings};
use receiptlink_bridge::{platform_radio, platform_raster_sdk};
use receiptlink_core::{ConnectionState, EngineConfig, Order, PrinterConfig};
use receiptlink_print::encoder::cmd;
use receiptlink_print::{Collaborators, PrinterEngine, SqliteOrderStore};

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[tokio::test]
async fn order_prints_through_a_tcp_bridge() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let bridge = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        socket.read_to_end(&mut received).await.unwrap();
        received
    });

    let store = Arc::new(SqliteOrderStore::open_in_memory().unwrap());
    let order = Order::new(7, "T-7");
    store.insert_order(&order).unwrap();

    let engine = PrinterEngine::new(
        platform_radio(Vec::new()),
        platform_raster_sdk(),
        Collaborators {
            orders: store.clone(),
            settings: Arc::new(StaticSettings::default()),
            content: Arc::new(FixedContent("[C]<b>ORDER {number}</b>\n[L]Soup[R]6.00".into())),
        },
        EngineConfig::default(),
    );
    let printer = PrinterConfig::new(address, "Bridge");

    assert!(engine.print_job(&order, &printer, None).await);
    assert_eq!(engine.status(&printer), ConnectionState::Connected);
    assert!(store.order(order.id).unwrap().unwrap().printed);

    engine.disconnect(&printer).await;
    let received = bridge.await.unwrap();

    assert!(contains(&received, cmd::INIT));
    assert!(contains(&received, b"ORDER T-7"));
    assert!(contains(&received, cmd::PARTIAL_CUT));
    assert!(received.ends_with(cmd::NUDGE));
    engine.shutdown().await;
}

#[tokio::test]
async fn refused_connection_is_reported_not_panicked() {
    // Bind then drop so the port is known to be closed.
    let address = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    };
    let engine = PrinterEngine::new(
        platform_radio(Vec::new()),
        platform_raster_sdk(),
        Collaborators {
            orders: Arc::new(SqliteOrderStore::open_in_memory().unwrap()),
            settings: Arc::new(StaticSettings::default()),
            content: Arc::new(FixedContent("[L]x".into())),
        },
        EngineConfig {
            connect_attempts: 1,
            ..EngineConfig::default()
        },
    );
    let printer = PrinterConfig::new(address, "Gone");

    assert!(engine.try_connect(&printer).await.is_err());
    assert_eq!(engine.status(&printer), ConnectionState::Error);
    engine.shutdown().await;
}
