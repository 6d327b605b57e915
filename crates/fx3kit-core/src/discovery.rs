//! Device discovery and firmware upload.
//!
//! [`discover`] walks the bus once. Devices already running the analyzer
//! firmware are reported ready; boot loaders get their firmware uploaded and
//! are reported as pending renumeration. Nothing here touches global state:
//! the caller folds the returned outcomes into its
//! [`Inventory`](crate::inventory::Inventory).

use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use tracing::{debug, error, info, instrument, warn};

use crate::error::BringupError;
use crate::events::{BringupEvent, BringupObserver};
use crate::image::FirmwareLoader;
use crate::inventory::{DeviceRecord, DeviceStatus, Discovery, SkipReason, UsbConn};
use crate::profile::{self, DeviceProfile};
use crate::protocol::constants::{ADDRESS_UNKNOWN, USB_CONFIGURATION, USB_INTERFACE};
use crate::transport::{UsbBus, UsbCandidate, UsbHandle};
use crate::upload::{set_reset, upload_image};

/// Restricts a scan to one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnFilter {
    /// `BUS.ADDRESS`, decimal.
    BusAddress { bus_id: String, address: u8 },
    /// `VID.PID`, four hex digits each.
    VidPid { vid: u16, pid: u16 },
}

impl ConnFilter {
    pub fn matches(&self, candidate: &UsbCandidate) -> bool {
        match self {
            ConnFilter::BusAddress { bus_id, address } => {
                normalize_bus(&candidate.bus_id) == *bus_id && candidate.address == *address
            }
            ConnFilter::VidPid { vid, pid } => {
                candidate.vendor_id == *vid && candidate.product_id == *pid
            }
        }
    }
}

impl FromStr for ConnFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (left, right) = s
            .split_once('.')
            .ok_or_else(|| format!("invalid connection '{}', expected BUS.ADDRESS or VID.PID", s))?;

        let is_hex4 = |part: &str| part.len() == 4 && part.chars().all(|c| c.is_ascii_hexdigit());
        if is_hex4(left) && is_hex4(right) {
            let vid = u16::from_str_radix(left, 16).map_err(|e| e.to_string())?;
            let pid = u16::from_str_radix(right, 16).map_err(|e| e.to_string())?;
            return Ok(ConnFilter::VidPid { vid, pid });
        }

        let is_dec = |part: &str| !part.is_empty() && part.chars().all(|c| c.is_ascii_digit());
        if is_dec(left) && is_dec(right) {
            let address = right
                .parse::<u8>()
                .map_err(|_| format!("device address '{}' out of range", right))?;
            return Ok(ConnFilter::BusAddress {
                bus_id: normalize_bus(left),
                address,
            });
        }

        Err(format!(
            "invalid connection '{}', expected BUS.ADDRESS or VID.PID",
            s
        ))
    }
}

/// Strip zero padding from numeric bus ids ("002" and "2" are the same bus).
fn normalize_bus(bus_id: &str) -> String {
    bus_id
        .parse::<u32>()
        .map(|n| n.to_string())
        .unwrap_or_else(|_| bus_id.to_string())
}

impl fmt::Display for ConnFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnFilter::BusAddress { bus_id, address } => write!(f, "{}.{}", bus_id, address),
            ConnFilter::VidPid { vid, pid } => write!(f, "{:04x}.{:04x}", vid, pid),
        }
    }
}

/// Knobs for one discovery pass.
#[derive(Debug, Clone)]
pub struct DiscoverOptions {
    pub conn: Option<ConnFilter>,
    /// Configuration selected before uploading.
    pub configuration: u8,
    /// Interface the kernel driver is detached from.
    pub interface: u8,
}

impl Default for DiscoverOptions {
    fn default() -> Self {
        Self {
            conn: None,
            configuration: USB_CONFIGURATION,
            interface: USB_INTERFACE,
        }
    }
}

/// Scan the bus and bring up every supported device.
///
/// Returns one outcome per plausible candidate. Failures are per device;
/// a bus that cannot be listed yields no outcomes.
#[instrument(skip_all)]
pub fn discover<B, L, O>(
    bus: &B,
    loader: &L,
    profiles: &[DeviceProfile],
    observer: &O,
    options: &DiscoverOptions,
) -> Vec<Discovery>
where
    B: UsbBus,
    L: FirmwareLoader + ?Sized,
    O: BringupObserver + ?Sized,
{
    let candidates = match bus.list_devices() {
        Ok(candidates) => candidates,
        Err(e) => {
            error!("Failed to list USB devices: {}", e);
            return Vec::new();
        }
    };

    candidates
        .into_iter()
        .filter(|c| options.conn.as_ref().is_none_or(|f| f.matches(c)))
        .filter(|c| profile::is_plausible(profiles, c.vendor_id, c.product_id))
        .map(|candidate| probe(bus, loader, profiles, observer, options, candidate))
        .collect()
}

fn probe<B, L, O>(
    bus: &B,
    loader: &L,
    profiles: &[DeviceProfile],
    observer: &O,
    options: &DiscoverOptions,
    candidate: UsbCandidate,
) -> Discovery
where
    B: UsbBus,
    L: FirmwareLoader + ?Sized,
    O: BringupObserver + ?Sized,
{
    observer.on_event(&BringupEvent::DeviceDiscovered {
        vid: candidate.vendor_id,
        pid: candidate.product_id,
        bus_id: candidate.bus_id.clone(),
        address: candidate.address,
    });

    let skip = |candidate: UsbCandidate, reason: SkipReason| {
        observer.on_event(&BringupEvent::DeviceSkipped {
            vid: candidate.vendor_id,
            pid: candidate.product_id,
            reason: reason.to_string(),
        });
        Discovery::Skipped { candidate, reason }
    };

    // The handle only lives for the string read.
    let strings = match bus.open(&candidate) {
        Ok(handle) => handle.read_strings(),
        Err(e) => return skip(candidate, SkipReason::OpenFailed(e.to_string())),
    };
    let strings = match strings {
        Ok(strings) => strings,
        Err(e) => return skip(candidate, SkipReason::StringsUnreadable(e.to_string())),
    };

    let Some(connection_id) = candidate.port_path.clone() else {
        return skip(candidate, SkipReason::NoPortPath);
    };

    let Some(profile) =
        profile::find_profile(profiles, candidate.vendor_id, candidate.product_id, &strings)
    else {
        return skip(candidate, SkipReason::NoProfile);
    };
    let profile = *profile;

    let conn = UsbConn {
        bus_id: candidate.bus_id.clone(),
        address: candidate.address,
    };
    let mut record = DeviceRecord::new(profile, strings.serial_number.clone(), connection_id, conn);

    if profile::has_firmware(&strings) {
        info!(device = %candidate, "Found {} with firmware loaded", profile);
        record.status = DeviceStatus::Inactive;
        return Discovery::Ready(record);
    }

    record.conn.address = ADDRESS_UNKNOWN;
    match upload_firmware(bus, loader, &profile, observer, options, &candidate) {
        Ok(()) => {
            record.context.mark_uploaded(Instant::now());
            Discovery::Uploaded(record)
        }
        Err(error) => {
            warn!(device = %candidate, "Firmware upload failed: {}", error);
            Discovery::UploadFailed { record, error }
        }
    }
}

/// Upload the profile's firmware to a boot loader.
///
/// The handle is opened here and dropped on return, whatever the outcome.
#[instrument(skip_all, fields(firmware = profile.firmware))]
pub fn upload_firmware<B, L, O>(
    bus: &B,
    loader: &L,
    profile: &DeviceProfile,
    observer: &O,
    options: &DiscoverOptions,
    candidate: &UsbCandidate,
) -> Result<(), BringupError>
where
    B: UsbBus,
    L: FirmwareLoader + ?Sized,
    O: BringupObserver + ?Sized,
{
    info!(device = %candidate, "Uploading firmware to {}", profile);

    let handle = bus
        .open(candidate)
        .map_err(|e| BringupError::ConfigurationFailed(format!("failed to open device: {}", e)))?;

    // macOS has no kernel driver to detach from a boot loader.
    if !cfg!(target_os = "macos") {
        handle
            .detach_kernel_driver(options.interface)
            .map_err(|e| BringupError::ConfigurationFailed(e.to_string()))?;
    }

    handle.set_configuration(options.configuration).map_err(|e| {
        error!("Unable to set configuration: {}", e);
        BringupError::ConfigurationFailed(e.to_string())
    })?;

    if profile.needs_reset() {
        set_reset(&handle, true, observer)?;
    }

    let format = profile.image_format();
    let image = loader.load(profile.firmware, format.max_size())?;
    observer.on_event(&BringupEvent::UploadStarted {
        firmware: profile.firmware.to_string(),
        size: image.len(),
    });
    let sent = upload_image(&handle, &image, format, observer)?;
    debug!(bytes = sent, "Image written");

    if profile.needs_reset() {
        set_reset(&handle, false, observer)?;
    }
    Ok(())
}
