// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Receiptlink Print: the printer connection and delivery engine.  This crate
// turns marked-up receipt text into ESC/POS bytes, keeps one unreliable link
// to a thermal printer alive, and delivers print jobs over it with bounded
// retries.

pub mod connection;
pub mod delivery;
pub mod diagnostics;
pub mod driver;
pub mod encoder;
pub mod engine;
pub mod monitor;
pub mod queue;
pub mod retry;
pub mod status;
pub mod store;
pub mod transmitter;

pub use connection::ConnectionManager;
pub use delivery::Delivery;
pub use diagnostics::{DiagnosticReport, StepResult, diagnose};
pub use driver::{GenericDriver, PrinterDriver, RasterDriver};
pub use encoder::{ContentEncoder, EncodedPayload, ReceiptFormat};
pub use engine::{Collaborators, PrinterEngine};
pub use monitor::{AlertKind, PrinterAlert, ReconnectBackoff};
pub use queue::{PrintQueue, QueueStats};
pub use retry::{Backoff, RetryPolicy, retry_with_backoff};
pub use status::StatusProtocol;
pub use store::SqliteOrderStore;
pub use transmitter::{ChunkedTransmitter, TransmitReport};
