// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Receiptlink: Platform and collaborator seams.
//
// The engine never talks to a socket, a vendor SDK or a database directly.
// Everything outside the engine is reached through the traits in `traits`,
// with a TCP implementation for serial-over-wireless bridges, an in-memory
// implementation for tests and dry runs, and stubs for what this platform
// does not provide.

use std::sync::Arc;

use receiptlink_core::DiscoveredDevice;

pub mod memory;
pub mod stub;
pub mod tcp;
pub mod traits;

pub use traits::*;

/// Radio used on this platform.
///
/// Desktop and CI builds reach printers through TCP serial bridges; the
/// `known_devices` list stands in for native discovery.
pub fn platform_radio(known_devices: Vec<DiscoveredDevice>) -> Arc<dyn RadioAdapter> {
    Arc::new(tcp::TcpRadio::new(known_devices))
}

/// Raster vendor SDK linked into this build.
pub fn platform_raster_sdk() -> Arc<dyn RasterSdk> {
    Arc::new(stub::StubRasterSdk)
}
