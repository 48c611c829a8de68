// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// ESC/POS real-time status protocol (DLE EOT n).
//
// Each query is three bytes and the printer answers with one status byte
// whose bits 1 and 4 are always set and bits 0 and 7 always clear.  Bit
// layouts differ between firmware revisions, so parsing is best-effort:
// silence or garbage is reported as inconclusive, never as a failure.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use receiptlink_bridge::ByteTransport;
use receiptlink_core::error::{ReceiptError, Result};
use receiptlink_core::{EngineConfig, HealthState, StatusQueryResult};

/// Fixed bits of every real-time status byte.
const FIXED_MASK: u8 = 0x93;
const FIXED_VALUE: u8 = 0x12;

/// Decoded status byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reading {
    pub state: HealthState,
    pub summary: &'static str,
    pub issues: Vec<&'static str>,
}

/// One status query and the parser for its reply.
pub struct StatusQuery {
    pub name: &'static str,
    pub command: [u8; 3],
    parse: fn(u8) -> Reading,
}

impl StatusQuery {
    /// Decode a reply, using the last byte that carries the fixed bits.
    pub fn parse(&self, reply: &[u8]) -> Result<Reading> {
        reply
            .iter()
            .rev()
            .find(|b| *b & FIXED_MASK == FIXED_VALUE)
            .map(|b| (self.parse)(*b))
            .ok_or_else(|| {
                ReceiptError::StatusUnparseable(format!("{}: {}", self.name, hex::encode(reply)))
            })
    }
}

fn offline_cause(b: u8) -> Reading {
    let mut issues = Vec::new();
    if b & 0x04 != 0 {
        issues.push("cover open");
    }
    if b & 0x20 != 0 {
        issues.push("paper end");
    }
    if b & 0x40 != 0 {
        issues.push("error");
    }
    if issues.is_empty() {
        Reading {
            state: HealthState::Online,
            summary: "printer online",
            issues,
        }
    } else {
        Reading {
            state: HealthState::Offline,
            summary: "printer offline",
            issues,
        }
    }
}

fn error_cause(b: u8) -> Reading {
    let mut issues = Vec::new();
    if b & 0x08 != 0 {
        issues.push("autocutter error");
    }
    if b & 0x20 != 0 {
        issues.push("unrecoverable error");
    }
    if b & 0x40 != 0 {
        issues.push("auto-recoverable error");
    }
    let (state, summary) = if b & 0x20 != 0 {
        (HealthState::Error, "printer hardware error")
    } else if issues.is_empty() {
        (HealthState::Online, "no printer errors")
    } else {
        (HealthState::Warning, "printer reported a recoverable error")
    };
    Reading {
        state,
        summary,
        issues,
    }
}

fn paper_sensor(b: u8) -> Reading {
    if b & 0x60 != 0 {
        Reading {
            state: HealthState::Offline,
            summary: "printer out of paper",
            issues: vec!["paper end"],
        }
    } else if b & 0x0C != 0 {
        Reading {
            state: HealthState::Warning,
            summary: "paper roll nearly empty",
            issues: vec!["paper near end"],
        }
    } else {
        Reading {
            state: HealthState::Online,
            summary: "paper ok",
            issues: Vec::new(),
        }
    }
}

/// Queries run by [`StatusProtocol::query`], in order.
pub const QUERIES: [StatusQuery; 3] = [
    StatusQuery {
        name: "DLE EOT 2",
        command: [0x10, 0x04, 0x02],
        parse: offline_cause,
    },
    StatusQuery {
        name: "DLE EOT 3",
        command: [0x10, 0x04, 0x03],
        parse: error_cause,
    },
    StatusQuery {
        name: "DLE EOT 4",
        command: [0x10, 0x04, 0x04],
        parse: paper_sensor,
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusSettings {
    /// Longest wait for one reply.
    pub timeout: Duration,
    /// Silence that ends a reply once bytes arrived.
    pub quiet: Duration,
    pub poll: Duration,
}

impl From<&EngineConfig> for StatusSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            timeout: config.status_timeout(),
            quiet: config.status_quiet(),
            poll: config.status_poll(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StatusProtocol {
    settings: StatusSettings,
}

impl StatusProtocol {
    pub fn new(settings: StatusSettings) -> Self {
        Self { settings }
    }

    /// Drain stale input, send `command` and collect the reply.
    ///
    /// Returns an empty vector when the printer stayed silent.
    pub async fn exchange(&self, transport: &dyn ByteTransport, command: &[u8]) -> Result<Vec<u8>> {
        let stale = transport.read_available().await?;
        if !stale.is_empty() {
            debug!(stale = %hex::encode(&stale), "discarded stale status bytes");
        }

        transport.write(command).await?;

        let deadline = Instant::now() + self.settings.timeout;
        let mut reply = Vec::new();
        let mut last_byte_at: Option<Instant> = None;

        loop {
            tokio::time::sleep(self.settings.poll).await;
            let chunk = transport.read_available().await?;
            let now = Instant::now();
            if !chunk.is_empty() {
                reply.extend_from_slice(&chunk);
                last_byte_at = Some(now);
            } else if last_byte_at.is_some_and(|t| now - t >= self.settings.quiet) {
                break;
            }
            if now >= deadline {
                break;
            }
        }

        debug!(
            command = %hex::encode(command),
            reply = %hex::encode(&reply),
            "status exchange"
        );
        Ok(reply)
    }

    /// Run every query and combine the answers into one verdict.
    ///
    /// Transport errors propagate; everything else degrades to a verdict.
    #[instrument(skip_all, fields(transport = %transport.describe()))]
    pub async fn query(&self, transport: &dyn ByteTransport) -> Result<StatusQueryResult> {
        let mut raw = Vec::new();
        let mut readings = Vec::new();

        for query in &QUERIES {
            let reply = self.exchange(transport, &query.command).await?;
            if reply.is_empty() {
                debug!(query = query.name, "no reply, trying next query");
                continue;
            }
            raw.extend_from_slice(&reply);
            match query.parse(&reply) {
                Ok(reading) => readings.push(reading),
                Err(e) => warn!(error = %e, "ignoring status reply"),
            }
        }

        Ok(combine(readings, raw))
    }
}

fn combine(readings: Vec<Reading>, raw: Vec<u8>) -> StatusQueryResult {
    if readings.is_empty() {
        return if raw.is_empty() {
            StatusQueryResult {
                state: HealthState::Warning,
                summary: "no status response".into(),
                detail: Some("the printer did not answer any status query".into()),
                raw_bytes: None,
            }
        } else {
            StatusQueryResult {
                state: HealthState::Online,
                summary: "printer responded".into(),
                detail: Some("could not parse status reply".into()),
                raw_bytes: Some(raw),
            }
        };
    }

    let state = readings
        .iter()
        .map(|r| r.state)
        .max()
        .unwrap_or(HealthState::Online);
    let summary = readings
        .iter()
        .find(|r| r.state == state)
        .map(|r| r.summary)
        .unwrap_or("printer online");

    let mut issues: Vec<&str> = Vec::new();
    for issue in readings.iter().flat_map(|r| r.issues.iter().copied()) {
        if !issues.contains(&issue) {
            issues.push(issue);
        }
    }

    StatusQueryResult {
        state,
        summary: summary.into(),
        detail: (!issues.is_empty()).then(|| issues.join(", ")),
        raw_bytes: Some(raw),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use receiptlink_bridge::RadioAdapter;
    use receiptlink_bridge::memory::{MemoryRadio, Wire};
    use receiptlink_core::TransportSettings;

    use super::*;

    const EOT2: [u8; 3] = [0x10, 0x04, 0x02];
    const EOT3: [u8; 3] = [0x10, 0x04, 0x03];
    const EOT4: [u8; 3] = [0x10, 0x04, 0x04];

    fn protocol() -> StatusProtocol {
        StatusProtocol::new(StatusSettings::from(&EngineConfig::default()))
    }

    async fn open(wire: &Arc<Wire>) -> Box<dyn ByteTransport> {
        let radio = MemoryRadio::new(Arc::clone(wire));
        let device = radio.resolve("printer").await.unwrap().unwrap();
        radio.open(&device, &TransportSettings::default()).await.unwrap()
    }

    fn healthy(wire: &Wire) {
        wire.reply_to(&EOT2, &[0x12]);
        wire.reply_to(&EOT3, &[0x12]);
        wire.reply_to(&EOT4, &[0x12]);
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_printer_is_online() {
        let wire = Wire::new();
        healthy(&wire);
        let transport = open(&wire).await;
        let result = protocol().query(transport.as_ref()).await.unwrap();
        assert_eq!(result.state, HealthState::Online);
        assert_eq!(result.raw_bytes, Some(vec![0x12, 0x12, 0x12]));
    }

    #[tokio::test(start_paused = true)]
    async fn cover_open_is_offline() {
        let wire = Wire::new();
        healthy(&wire);
        wire.reply_to(&EOT2, &[0x16]);
        let transport = open(&wire).await;

        let result = protocol().query(transport.as_ref()).await.unwrap();
        assert_eq!(result.state, HealthState::Offline);
        assert!(result.detail.as_deref().unwrap().contains("cover"));
        assert!(matches!(result.as_error(), Some(ReceiptError::StatusOffline(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn paper_sensor_distinguishes_near_end_from_end() {
        let wire = Wire::new();
        healthy(&wire);
        wire.reply_to(&EOT4, &[0x1E]);
        let transport = open(&wire).await;
        let result = protocol().query(transport.as_ref()).await.unwrap();
        assert_eq!(result.state, HealthState::Warning);

        wire.reply_to(&EOT4, &[0x72]);
        let result = protocol().query(transport.as_ref()).await.unwrap();
        assert_eq!(result.state, HealthState::Offline);
        assert!(result.detail.unwrap().contains("paper"));
    }

    #[tokio::test(start_paused = true)]
    async fn unrecoverable_error_beats_everything() {
        let wire = Wire::new();
        healthy(&wire);
        wire.reply_to(&EOT2, &[0x16]);
        wire.reply_to(&EOT3, &[0x32]);
        let transport = open(&wire).await;
        let result = protocol().query(transport.as_ref()).await.unwrap();
        assert_eq!(result.state, HealthState::Error);
        assert_eq!(result.summary, "printer hardware error");
    }

    #[tokio::test(start_paused = true)]
    async fn garbage_reply_is_online_with_a_note() {
        let wire = Wire::new();
        wire.reply_to(&EOT2, &[0xFF]);
        let transport = open(&wire).await;
        let result = protocol().query(transport.as_ref()).await.unwrap();
        assert_eq!(result.state, HealthState::Online);
        assert_eq!(result.detail.as_deref(), Some("could not parse status reply"));
        assert_eq!(result.raw_bytes, Some(vec![0xFF]));
    }

    #[tokio::test(start_paused = true)]
    async fn silence_is_inconclusive_and_bounded() {
        let wire = Wire::new();
        let transport = open(&wire).await;
        let start = Instant::now();
        let result = protocol().query(transport.as_ref()).await.unwrap();
        assert_eq!(result.state, HealthState::Warning);
        assert!(result.raw_bytes.is_none());
        // Three queries, each waiting out the full timeout.
        assert!(start.elapsed() >= Duration::from_secs(9));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_bytes_are_drained_before_querying() {
        let wire = Wire::new();
        healthy(&wire);
        wire.push_unsolicited(&[0x16, 0x16]);
        let transport = open(&wire).await;
        let result = protocol().query(transport.as_ref()).await.unwrap();
        assert_eq!(result.state, HealthState::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn write_failure_propagates() {
        let wire = Wire::new();
        wire.fail_writes_after(0);
        let transport = open(&wire).await;
        let err = protocol().query(transport.as_ref()).await.unwrap_err();
        assert!(err.is_connection_related());
    }

    #[test]
    fn parse_picks_the_last_valid_byte() {
        let reading = QUERIES[0].parse(&[0xFF, 0x12]).unwrap();
        assert_eq!(reading.state, HealthState::Online);
        assert!(matches!(
            QUERIES[0].parse(&[0x00]),
            Err(ReceiptError::StatusUnparseable(_))
        ));
    }
}
