// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Criterion benchmarks for markup encoding, column layout and transmission
// grouping in the receiptlink-print crate.

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use receiptlink_core::{EngineConfig, PaperWidth};
use receiptlink_print::encoder::{ContentEncoder, ReceiptFormat};
use receiptlink_print::transmitter::{ChunkedTransmitter, TransmitSettings};

// ---------------------------------------------------------------------------
// Helper: a realistic receipt
// ---------------------------------------------------------------------------

/// Header, `items` priced lines and a total, in the markup the content
/// generator produces.
fn receipt(items: usize, item_name: &str) -> String {
    let mut lines = vec![
        "[C]<b><dw>CORNER CAFE</dw></b>".to_string(),
        "[C]12 Market Street".to_string(),
        "[C]--------------------------------".to_string(),
        "[L]Order:[R]<b>A-1042</b>".to_string(),
    ];
    for i in 0..items {
        lines.push(format!("[L]{item_name} {i}[R]{}.50", i + 2));
    }
    lines.push("[C]--------------------------------".to_string());
    lines.push("[L]<b>TOTAL</b>[R]<b><dh>123.00</dh></b>".to_string());
    lines.push("[C]<u>Thank you!</u>".to_string());
    lines.join("\n")
}

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

fn bench_encode(c: &mut Criterion) {
    let encoder = ContentEncoder::new(ReceiptFormat::for_paper(PaperWidth::Narrow), true);

    let latin = receipt(20, "Flat white");
    c.bench_function("encode (20 items, latin)", |b| {
        b.iter(|| black_box(encoder.encode(black_box(&latin))));
    });

    // A CJK code point anywhere switches the whole payload to GBK.
    let cjk = receipt(20, "拿铁咖啡");
    c.bench_function("encode (20 items, cjk)", |b| {
        b.iter(|| black_box(encoder.encode(black_box(&cjk))));
    });

    let long = receipt(300, "Flat white");
    c.bench_function("encode (300 items, latin)", |b| {
        b.iter(|| black_box(encoder.encode(black_box(&long))));
    });
}

fn bench_plain_lines(c: &mut Criterion) {
    let encoder = ContentEncoder::new(ReceiptFormat::for_paper(PaperWidth::Wide), false);
    let markup = receipt(50, "Espresso");

    c.bench_function("plain_lines (50 items)", |b| {
        b.iter(|| black_box(encoder.plain_lines(black_box(&markup))));
    });
}

fn bench_grouping(c: &mut Criterion) {
    let encoder = ContentEncoder::new(ReceiptFormat::for_paper(PaperWidth::Narrow), true);
    let payload = encoder.encode(&receipt(300, "Flat white"));
    let transmitter = ChunkedTransmitter::new(TransmitSettings::from(&EngineConfig::default()));

    c.bench_function("groups (300 items)", |b| {
        b.iter(|| black_box(transmitter.groups(black_box(&payload))));
    });
}

criterion_group!(benches, bench_encode, bench_plain_lines, bench_grouping);
criterion_main!(benches);
