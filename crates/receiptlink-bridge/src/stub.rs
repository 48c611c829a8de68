// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Stub raster SDK for builds where the vendor library is not linked.
//
// Every call returns `PlatformUnavailable`; raster printers fail to connect
// gracefully instead of crashing the engine.

use std::time::Duration;

use async_trait::async_trait;

use receiptlink_core::error::{ReceiptError, Result};

use crate::traits::*;

/// No-op vendor SDK.
pub struct StubRasterSdk;

#[async_trait]
impl RasterSdk for StubRasterSdk {
    fn is_available(&self) -> bool {
        false
    }

    async fn open_port(&self, address: &str, _timeout: Duration) -> Result<Box<dyn RasterPort>> {
        tracing::warn!(address, "RasterSdk::open_port called on stub SDK");
        Err(ReceiptError::PlatformUnavailable)
    }
}
