// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// TCP transport for serial-over-wireless print bridges.
//
// Wi-Fi serial servers and networked ESC/POS printers expose the printer's
// serial port as a raw TCP socket (usually port 9100).  No framing, no
// handshake: bytes in, status bytes out.  The address is `host:port`.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use receiptlink_core::error::{ReceiptError, Result};
use receiptlink_core::{DiscoveredDevice, TransportSettings};

use crate::traits::{ByteTransport, DeviceHandle, RadioAdapter};

/// Default raw TCP port (JetDirect-style).
pub const RAW_PORT: u16 = 9100;

/// Read buffer used when draining the socket.
const READ_CHUNK: usize = 256;

/// Radio backed by the host's IP stack.
pub struct TcpRadio {
    known_devices: Vec<DiscoveredDevice>,
}

impl TcpRadio {
    pub fn new(known_devices: Vec<DiscoveredDevice>) -> Self {
        Self { known_devices }
    }
}

/// Resolve `host[:port]` to the first socket address, defaulting the port.
async fn resolve_addr(address: &str) -> Option<SocketAddr> {
    if let Ok(addr) = address.parse::<SocketAddr>() {
        return Some(addr);
    }
    let target = if address.contains(':') {
        address.to_string()
    } else {
        format!("{address}:{RAW_PORT}")
    };
    match tokio::net::lookup_host(target).await {
        Ok(mut addrs) => addrs.next(),
        Err(e) => {
            debug!(address, error = %e, "address lookup failed");
            None
        }
    }
}

#[async_trait]
impl RadioAdapter for TcpRadio {
    fn is_enabled(&self) -> bool {
        true
    }

    async fn resolve(&self, address: &str) -> Result<Option<DeviceHandle>> {
        let name = self
            .known_devices
            .iter()
            .find(|d| d.address == address)
            .map(|d| d.name.clone());
        Ok(resolve_addr(address).await.map(|_| DeviceHandle {
            address: address.to_string(),
            name,
        }))
    }

    async fn open(
        &self,
        device: &DeviceHandle,
        settings: &TransportSettings,
    ) -> Result<Box<dyn ByteTransport>> {
        let addr = resolve_addr(&device.address).await.ok_or_else(|| {
            ReceiptError::TransportUnavailable(format!("cannot resolve {}", device.address))
        })?;

        info!(addr = %addr, "opening raw TCP printer link");

        let stream = tokio::time::timeout(settings.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                ReceiptError::Timeout(format!(
                    "TCP connect to {addr} after {}ms",
                    settings.connect_timeout.as_millis()
                ))
            })?
            .map_err(|e| ReceiptError::ConnectFailed {
                address: device.address.clone(),
                attempts: 1,
                reason: e.to_string(),
            })?;

        // Receipts are many tiny writes; don't let Nagle batch the flush bytes.
        if let Err(e) = stream.set_nodelay(true) {
            warn!(addr = %addr, error = %e, "TCP_NODELAY not applied");
        }

        Ok(Box::new(TcpTransport {
            addr,
            stream: RwLock::new(Some(stream)),
            open: AtomicBool::new(true),
            write_timeout: settings.write_timeout,
        }))
    }

    async fn discover(&self) -> Result<Vec<DiscoveredDevice>> {
        Ok(self.known_devices.clone())
    }
}

/// One open TCP link.
///
/// I/O goes through `&TcpStream` readiness calls so reads and writes share a
/// read lock; only `close` takes the write lock.
pub struct TcpTransport {
    addr: SocketAddr,
    stream: RwLock<Option<TcpStream>>,
    open: AtomicBool,
    write_timeout: Duration,
}

async fn write_all_shared(stream: &TcpStream, mut bytes: &[u8]) -> io::Result<()> {
    while !bytes.is_empty() {
        stream.writable().await?;
        match stream.try_write(bytes) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => bytes = &bytes[n..],
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[async_trait]
impl ByteTransport for TcpTransport {
    async fn write(&self, bytes: &[u8]) -> Result<()> {
        let guard = self.stream.read().await;
        let stream = guard
            .as_ref()
            .ok_or_else(|| ReceiptError::WriteFailed(format!("{} is closed", self.addr)))?;

        let outcome = tokio::time::timeout(self.write_timeout, write_all_shared(stream, bytes)).await;
        match outcome {
            Ok(Ok(())) => {
                debug!(addr = %self.addr, bytes = bytes.len(), "TCP write");
                Ok(())
            }
            Ok(Err(e)) => {
                self.open.store(false, Ordering::SeqCst);
                Err(ReceiptError::write_failed(&self.addr.to_string(), e))
            }
            Err(_) => {
                self.open.store(false, Ordering::SeqCst);
                Err(ReceiptError::Timeout(format!(
                    "write to {} after {}ms",
                    self.addr,
                    self.write_timeout.as_millis()
                )))
            }
        }
    }

    async fn read_available(&self) -> Result<Vec<u8>> {
        let guard = self.stream.read().await;
        let Some(stream) = guard.as_ref() else {
            return Ok(Vec::new());
        };

        let mut collected = Vec::new();
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match stream.try_read(&mut buf) {
                Ok(0) => {
                    // Peer closed its side.
                    self.open.store(false, Ordering::SeqCst);
                    break;
                }
                Ok(n) => collected.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.open.store(false, Ordering::SeqCst);
                    return Err(ReceiptError::Io(e));
                }
            }
        }
        Ok(collected)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        if self.stream.write().await.take().is_some() {
            info!(addr = %self.addr, "raw TCP printer link closed");
        }
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}
