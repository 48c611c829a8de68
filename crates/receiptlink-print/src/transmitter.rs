// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Chunked transmitter.
//
// Cheap thermal printers have small receive buffers and firmware that holds
// on to an unpredictable amount of data.  The payload is pushed in groups of
// whole lines, each followed by a flush sequence and a settle pause, and the
// job ends with a nudge that makes the printer execute a trailing cut.
//
// A failed write aborts the whole job.  There is no resume: the caller
// reconnects and prints again.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use receiptlink_bridge::ByteTransport;
use receiptlink_core::EngineConfig;
use receiptlink_core::error::{ReceiptError, Result};

use crate::encoder::{EncodedPayload, cmd};

/// Sizing and pacing of one transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransmitSettings {
    pub chunk_lines: usize,
    pub max_write_bytes: usize,
    pub settle: Duration,
}

impl From<&EngineConfig> for TransmitSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            chunk_lines: config.chunk_lines.max(1),
            max_write_bytes: config.max_write_bytes.max(1),
            settle: config.settle(),
        }
    }
}

/// What went over the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransmitReport {
    pub groups: usize,
    pub writes: usize,
    pub bytes: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkedTransmitter {
    settings: TransmitSettings,
}

impl ChunkedTransmitter {
    pub fn new(settings: TransmitSettings) -> Self {
        Self { settings }
    }

    /// Split the payload into per-group byte buffers.
    ///
    /// The prologue rides with the first group and the epilogue with the
    /// last, so a short receipt is exactly one group.
    pub fn groups(&self, payload: &EncodedPayload) -> Vec<Vec<u8>> {
        let chunks: Vec<&[Vec<u8>]> = if payload.lines.is_empty() {
            vec![&payload.lines[..]]
        } else {
            payload.lines.chunks(self.settings.chunk_lines).collect()
        };
        let last = chunks.len() - 1;

        chunks
            .into_iter()
            .enumerate()
            .map(|(i, lines)| {
                let mut group = Vec::new();
                if i == 0 {
                    group.extend_from_slice(&payload.prologue);
                }
                for line in lines {
                    group.extend_from_slice(line);
                }
                if i == last {
                    group.extend_from_slice(&payload.epilogue);
                }
                group
            })
            .collect()
    }

    pub async fn transmit(
        &self,
        transport: &dyn ByteTransport,
        payload: &EncodedPayload,
        cancel: &CancellationToken,
    ) -> Result<TransmitReport> {
        let mut report = TransmitReport::default();

        for group in self.groups(payload) {
            if cancel.is_cancelled() {
                return Err(ReceiptError::Cancelled);
            }

            for piece in group.chunks(self.settings.max_write_bytes) {
                self.write(transport, piece, &mut report).await?;
            }
            self.write(transport, cmd::FLUSH, &mut report).await?;
            report.groups += 1;

            debug!(
                group = report.groups,
                bytes = group.len(),
                transport = %transport.describe(),
                "group sent, settling"
            );

            tokio::select! {
                _ = cancel.cancelled() => return Err(ReceiptError::Cancelled),
                _ = tokio::time::sleep(self.settings.settle) => {}
            }
        }

        self.write(transport, cmd::NUDGE, &mut report).await?;
        Ok(report)
    }

    async fn write(
        &self,
        transport: &dyn ByteTransport,
        bytes: &[u8],
        report: &mut TransmitReport,
    ) -> Result<()> {
        transport.write(bytes).await?;
        report.writes += 1;
        report.bytes += bytes.len();
        Ok(())
    }
}
