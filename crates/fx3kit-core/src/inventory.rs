//! Discovered devices and their per-device state.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Instant;

use crate::error::BringupError;
use crate::profile::DeviceProfile;
use crate::protocol::constants::ADDRESS_UNKNOWN;
use crate::transport::UsbCandidate;

/// Lifecycle of an inventory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    /// Firmware uploaded (or attempted); waiting for renumeration.
    Initializing,
    /// Running the analyzer firmware, not opened.
    Inactive,
    /// Opened, interface claimed.
    Active,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceStatus::Initializing => write!(f, "initializing"),
            DeviceStatus::Inactive => write!(f, "inactive"),
            DeviceStatus::Active => write!(f, "active"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Logic,
    Analog,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub index: usize,
    pub kind: ChannelKind,
    pub name: String,
}

/// Named set of channel indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelGroup {
    pub name: String,
    pub channels: Vec<usize>,
}

/// Bus location of a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbConn {
    pub bus_id: String,
    /// [`ADDRESS_UNKNOWN`] until the device has renumerated.
    pub address: u8,
}

impl UsbConn {
    pub fn is_known(&self) -> bool {
        self.address != ADDRESS_UNKNOWN
    }
}

impl fmt::Display for UsbConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.bus_id, self.address)
    }
}

/// Mutable per-device driver state.
#[derive(Debug, Clone)]
pub struct DeviceContext {
    pub profile: DeviceProfile,
    fw_updated: Option<Instant>,
    pub samplerates: &'static [u64],
    /// Zero until set or defaulted at open.
    pub cur_samplerate: u64,
    pub limit_samples: u64,
    pub capture_ratio: u64,
    pub enabled_channels: BTreeSet<usize>,
}

impl DeviceContext {
    pub fn new(profile: DeviceProfile) -> Self {
        Self {
            profile,
            fw_updated: None,
            samplerates: profile.samplerates(),
            cur_samplerate: 0,
            limit_samples: 0,
            capture_ratio: 0,
            enabled_channels: BTreeSet::new(),
        }
    }

    /// When firmware was last uploaded during this run.
    pub fn fw_updated(&self) -> Option<Instant> {
        self.fw_updated
    }

    /// Record a successful upload. Never moves the timestamp backwards.
    pub fn mark_uploaded(&mut self, at: Instant) {
        self.fw_updated = Some(self.fw_updated.map_or(at, |prev| prev.max(at)));
    }
}

/// One inventory entry.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub status: DeviceStatus,
    pub vendor: String,
    pub model: String,
    pub version: Option<String>,
    pub serial_number: String,
    /// Physical port path, stable across renumeration.
    pub connection_id: String,
    pub conn: UsbConn,
    pub channels: Vec<Channel>,
    pub channel_groups: Vec<ChannelGroup>,
    pub context: DeviceContext,
}

impl DeviceRecord {
    /// Build a record with channels laid out from the profile.
    ///
    /// Logic channels `D0..Dn` share the "Logic" group; each analog channel
    /// gets a group of its own. All channels start enabled.
    pub fn new(
        profile: DeviceProfile,
        serial_number: String,
        connection_id: String,
        conn: UsbConn,
    ) -> Self {
        let num_logic = profile.num_logic_channels();
        let mut channels: Vec<Channel> = (0..num_logic)
            .map(|i| Channel {
                index: i,
                kind: ChannelKind::Logic,
                name: format!("D{}", i),
            })
            .collect();
        let mut channel_groups = vec![ChannelGroup {
            name: "Logic".to_string(),
            channels: (0..num_logic).collect(),
        }];

        for j in 0..profile.num_analog_channels() {
            let name = format!("A{}", j);
            channels.push(Channel {
                index: num_logic + j,
                kind: ChannelKind::Analog,
                name: name.clone(),
            });
            channel_groups.push(ChannelGroup {
                name,
                channels: vec![num_logic + j],
            });
        }

        let mut context = DeviceContext::new(profile);
        context.enabled_channels = channels.iter().map(|c| c.index).collect();

        Self {
            status: DeviceStatus::Initializing,
            vendor: profile.vendor.to_string(),
            model: profile.model.to_string(),
            version: profile.model_version.map(str::to_string),
            serial_number,
            connection_id,
            conn,
            channels,
            channel_groups,
            context,
        }
    }

    pub fn set_channel_enabled(&mut self, index: usize, enabled: bool) -> bool {
        if index >= self.channels.len() {
            return false;
        }
        if enabled {
            self.context.enabled_channels.insert(index);
        } else {
            self.context.enabled_channels.remove(&index);
        }
        true
    }
}

/// Why a candidate was dropped during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    OpenFailed(String),
    StringsUnreadable(String),
    NoPortPath,
    NoProfile,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::OpenFailed(e) => write!(f, "failed to open: {}", e),
            SkipReason::StringsUnreadable(e) => write!(f, "failed to read strings: {}", e),
            SkipReason::NoPortPath => write!(f, "port path unavailable"),
            SkipReason::NoProfile => write!(f, "no matching profile"),
        }
    }
}

/// Outcome of discovery for one candidate.
#[derive(Debug)]
pub enum Discovery {
    /// Already running the analyzer firmware.
    Ready(DeviceRecord),
    /// Firmware uploaded; must renumerate before use.
    Uploaded(DeviceRecord),
    /// Upload attempted and failed. The record is kept so the caller can
    /// still try to open it.
    UploadFailed {
        record: DeviceRecord,
        error: BringupError,
    },
    Skipped {
        candidate: UsbCandidate,
        reason: SkipReason,
    },
}

impl Discovery {
    pub fn record(&self) -> Option<&DeviceRecord> {
        match self {
            Discovery::Ready(record)
            | Discovery::Uploaded(record)
            | Discovery::UploadFailed { record, .. } => Some(record),
            Discovery::Skipped { .. } => None,
        }
    }

    pub fn into_record(self) -> Option<DeviceRecord> {
        match self {
            Discovery::Ready(record)
            | Discovery::Uploaded(record)
            | Discovery::UploadFailed { record, .. } => Some(record),
            Discovery::Skipped { .. } => None,
        }
    }
}

/// Devices known to the driver.
#[derive(Debug, Default)]
pub struct Inventory {
    devices: Vec<DeviceRecord>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the records of a scan, dropping skipped candidates.
    pub fn absorb(&mut self, outcomes: impl IntoIterator<Item = Discovery>) -> usize {
        let before = self.devices.len();
        self.devices
            .extend(outcomes.into_iter().filter_map(Discovery::into_record));
        self.devices.len() - before
    }

    pub fn devices(&self) -> &[DeviceRecord] {
        &self.devices
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut DeviceRecord> {
        self.devices.get_mut(index)
    }

    pub fn remove(&mut self, index: usize) -> Option<DeviceRecord> {
        (index < self.devices.len()).then(|| self.devices.remove(index))
    }

    pub fn clear(&mut self) {
        self.devices.clear();
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{DevCaps, SUPPORTED_PROFILES, TEST_FX2_PROFILE};
    use std::time::Duration;

    fn conn() -> UsbConn {
        UsbConn {
            bus_id: "2".into(),
            address: ADDRESS_UNKNOWN,
        }
    }

    #[test]
    fn test_fx3_channel_layout() {
        let record = DeviceRecord::new(SUPPORTED_PROFILES[0], "".into(), "2-1".into(), conn());
        assert_eq!(record.channels.len(), 32);
        assert_eq!(record.channels[31].name, "D31");
        assert_eq!(record.channel_groups.len(), 1);
        assert_eq!(record.context.enabled_channels.len(), 32);
        assert_eq!(record.status, DeviceStatus::Initializing);
    }

    #[test]
    fn test_analog_channel_groups() {
        let profile = DeviceProfile {
            dev_caps: DevCaps::AX_ANALOG,
            ..TEST_FX2_PROFILE
        };
        let record = DeviceRecord::new(profile, "".into(), "2-1".into(), conn());
        assert_eq!(record.channels.len(), 9);
        assert_eq!(record.channels[8].name, "A0");
        assert_eq!(record.channels[8].kind, ChannelKind::Analog);
        assert_eq!(record.channel_groups[1].channels, vec![8]);
    }

    #[test]
    fn test_upload_timestamp_monotonic() {
        let mut ctx = DeviceContext::new(SUPPORTED_PROFILES[0]);
        assert!(ctx.fw_updated().is_none());

        let t0 = Instant::now();
        let t1 = t0 + Duration::from_millis(10);
        ctx.mark_uploaded(t1);
        ctx.mark_uploaded(t0);
        assert_eq!(ctx.fw_updated(), Some(t1));
    }

    #[test]
    fn test_conn_display() {
        let mut c = conn();
        assert!(!c.is_known());
        c.address = 7;
        assert!(c.is_known());
        assert_eq!(c.to_string(), "2.7");
    }

    #[test]
    fn test_inventory_absorbs_records_only() {
        let record = DeviceRecord::new(SUPPORTED_PROFILES[0], "".into(), "2-1".into(), conn());
        let skipped = Discovery::Skipped {
            candidate: UsbCandidate {
                bus_id: "2".into(),
                address: 4,
                vendor_id: 0x04B4,
                product_id: 0x00F3,
                port_path: None,
            },
            reason: SkipReason::NoPortPath,
        };

        let mut inventory = Inventory::new();
        assert_eq!(inventory.absorb([Discovery::Uploaded(record), skipped]), 1);
        assert_eq!(inventory.len(), 1);
        assert_eq!(inventory.devices()[0].connection_id, "2-1");

        assert!(inventory.remove(5).is_none());
        assert!(inventory.remove(0).is_some());
        assert!(inventory.is_empty());
    }

    #[test]
    fn test_toggle_channel() {
        let mut record = DeviceRecord::new(TEST_FX2_PROFILE, "".into(), "".into(), conn());
        assert!(record.set_channel_enabled(3, false));
        assert!(!record.context.enabled_channels.contains(&3));
        assert!(!record.set_channel_enabled(99, true));
    }
}
