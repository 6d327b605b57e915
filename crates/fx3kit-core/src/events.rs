//! Event system for UI decoupling.
//!
//! Allows the CLI (or any other front end) to follow bring-up progress
//! without tight coupling to the core logic.

use std::sync::Mutex;

/// Events emitted during discovery, upload and open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BringupEvent {
    /// Plausible device found during a scan.
    DeviceDiscovered { vid: u16, pid: u16, bus_id: String, address: u8 },
    /// Candidate dropped from the scan.
    DeviceSkipped { vid: u16, pid: u16, reason: String },
    /// Firmware upload started.
    UploadStarted { firmware: String, size: usize },
    /// One firmware chunk accepted by the device.
    ChunkUploaded { address: u32, length: usize },
    /// Upload finished.
    UploadComplete { bytes: usize },
    /// CPU reset asserted or released.
    ResetChanged { asserted: bool },
    /// Polling for the renumerated device.
    WaitingForRenumeration { elapsed_ms: u64 },
    /// Renumerated device found again.
    Renumerated { elapsed_ms: u64, address: u8 },
    /// Device opened and interface claimed.
    DeviceOpened { bus_id: String, address: u8 },
    /// Device closed.
    DeviceClosed { bus_id: String, address: u8 },
}

/// Observer trait for receiving bring-up events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait BringupObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &BringupEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl BringupObserver for NullObserver {
    fn on_event(&self, _event: &BringupEvent) {}
}

/// Observer that keeps every event, for tests and post-mortem dumps.
#[derive(Debug, Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<BringupEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<BringupEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl BringupObserver for RecordingObserver {
    fn on_event(&self, event: &BringupEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl BringupObserver for TracingObserver {
    fn on_event(&self, event: &BringupEvent) {
        match event {
            BringupEvent::DeviceDiscovered {
                vid,
                pid,
                bus_id,
                address,
            } => {
                tracing::debug!(
                    vid = %format!("{:04X}", vid),
                    pid = %format!("{:04X}", pid),
                    "Found candidate device on {}.{}",
                    bus_id,
                    address
                );
            }
            BringupEvent::DeviceSkipped { vid, pid, reason } => {
                tracing::warn!(
                    vid = %format!("{:04X}", vid),
                    pid = %format!("{:04X}", pid),
                    "Skipping device: {}",
                    reason
                );
            }
            BringupEvent::UploadStarted { firmware, size } => {
                tracing::info!(size, "Uploading firmware '{}'", firmware);
            }
            BringupEvent::ChunkUploaded { address, length } => {
                tracing::trace!(address = %format!("0x{:08X}", address), "Uploaded {} bytes", length);
            }
            BringupEvent::UploadComplete { bytes } => {
                tracing::info!(bytes, "Firmware upload done");
            }
            BringupEvent::ResetChanged { asserted } => {
                tracing::info!(
                    "Setting CPU reset mode {}",
                    if *asserted { "on" } else { "off" }
                );
            }
            BringupEvent::WaitingForRenumeration { elapsed_ms } => {
                tracing::trace!("Waited {}ms", elapsed_ms);
            }
            BringupEvent::Renumerated {
                elapsed_ms,
                address,
            } => {
                tracing::info!(address, "Device came back after {}ms", elapsed_ms);
            }
            BringupEvent::DeviceOpened { bus_id, address } => {
                tracing::info!("Opened device on {}.{}", bus_id, address);
            }
            BringupEvent::DeviceClosed { bus_id, address } => {
                tracing::info!("Closed device on {}.{}", bus_id, address);
            }
        }
    }
}
