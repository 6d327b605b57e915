//! Driver front end: scan, open and close.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::discovery::{ConnFilter, DiscoverOptions, discover};
use crate::error::BringupError;
use crate::events::{BringupEvent, BringupObserver, TracingObserver};
use crate::image::{FirmwareDirs, FirmwareLoader};
use crate::inventory::{DeviceRecord, DeviceStatus, Discovery};
use crate::profile::{DeviceProfile, SUPPORTED_PROFILES, has_firmware};
use crate::protocol::constants::{
    MAX_RENUM_DELAY_MS, RENUM_POLL_INTERVAL_MS, RENUM_SETTLE_MS, USB_CONFIGURATION, USB_INTERFACE,
};
use crate::renum::{RenumerationPolicy, wait_for_renumeration};
use crate::transport::{NusbBus, TransportError, UsbBus, UsbHandle};

/// Driver configuration, loadable from TOML.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Searched for firmware before `$FX3KIT_FIRMWARE_DIR` and the system
    /// directories.
    pub firmware_dirs: Vec<PathBuf>,
    pub usb_configuration: u8,
    pub usb_interface: u8,
    pub renum_settle_ms: u64,
    pub renum_poll_interval_ms: u64,
    pub max_renum_delay_ms: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            firmware_dirs: Vec::new(),
            usb_configuration: USB_CONFIGURATION,
            usb_interface: USB_INTERFACE,
            renum_settle_ms: RENUM_SETTLE_MS,
            renum_poll_interval_ms: RENUM_POLL_INTERVAL_MS,
            max_renum_delay_ms: MAX_RENUM_DELAY_MS,
        }
    }
}

impl DriverConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: DriverConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn renumeration_policy(&self) -> RenumerationPolicy {
        RenumerationPolicy::from_millis(
            self.renum_settle_ms,
            self.renum_poll_interval_ms,
            self.max_renum_delay_ms,
        )
    }

    pub fn firmware_loader(&self) -> FirmwareDirs {
        FirmwareDirs::with_defaults(self.firmware_dirs.as_slice())
    }

    pub fn discover_options(&self, conn: Option<ConnFilter>) -> DiscoverOptions {
        DiscoverOptions {
            conn,
            configuration: self.usb_configuration,
            interface: self.usb_interface,
        }
    }
}

/// An opened device. Dropping it closes the handle without releasing the
/// interface first; prefer [`Driver::close`].
#[derive(Debug)]
pub struct OpenDevice<H: UsbHandle> {
    handle: H,
    interface: u8,
}

impl<H: UsbHandle> OpenDevice<H> {
    pub fn handle(&self) -> &H {
        &self.handle
    }

    pub fn interface(&self) -> u8 {
        self.interface
    }
}

/// Ties a bus, a firmware source and an observer together.
pub struct Driver<B: UsbBus, L: FirmwareLoader, O: BringupObserver> {
    bus: B,
    loader: L,
    observer: Arc<O>,
    profiles: Vec<DeviceProfile>,
    config: DriverConfig,
}

impl Driver<NusbBus, FirmwareDirs, TracingObserver> {
    /// Create a driver on the system USB bus with the default tracing observer.
    pub fn new(config: DriverConfig) -> Self {
        let loader = config.firmware_loader();
        Self::with_parts(NusbBus::new(), loader, Arc::new(TracingObserver), config)
    }
}

impl<B: UsbBus, L: FirmwareLoader, O: BringupObserver> Driver<B, L, O> {
    pub fn with_parts(bus: B, loader: L, observer: Arc<O>, config: DriverConfig) -> Self {
        Self {
            bus,
            loader,
            observer,
            profiles: SUPPORTED_PROFILES.to_vec(),
            config,
        }
    }

    /// Replace the supported model table.
    pub fn with_profiles(mut self, profiles: Vec<DeviceProfile>) -> Self {
        self.profiles = profiles;
        self
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn profiles(&self) -> &[DeviceProfile] {
        &self.profiles
    }

    /// Find supported devices, uploading firmware where needed.
    pub fn scan(&self, conn: Option<ConnFilter>) -> Vec<Discovery> {
        let options = self.config.discover_options(conn);
        discover(
            &self.bus,
            &self.loader,
            &self.profiles,
            self.observer.as_ref(),
            &options,
        )
    }

    /// Open a scanned device and claim its interface.
    ///
    /// If firmware was uploaded during the scan this first waits for the
    /// device to renumerate, then records its new address.
    #[instrument(skip_all, fields(port = %record.connection_id))]
    pub fn open(&self, record: &mut DeviceRecord) -> Result<OpenDevice<B::Handle>, BringupError> {
        let fw_updated = record.context.fw_updated();
        let policy = self.config.renumeration_policy();

        let (mut handle, address) = {
            let record = &*record;
            wait_for_renumeration(fw_updated, &policy, self.observer.as_ref(), || {
                self.acquire(record)
            })?
        };

        if let Some(uploaded_at) = fw_updated {
            self.observer.on_event(&BringupEvent::Renumerated {
                elapsed_ms: uploaded_at.elapsed().as_millis() as u64,
                address,
            });
        }
        record.conn.address = address;

        let interface = self.config.usb_interface;
        handle.claim_interface(interface).map_err(|e| {
            BringupError::ConfigurationFailed(match e {
                TransportError::Busy { .. } => "Unable to claim USB interface. Another program \
                     or driver has already claimed it."
                    .to_string(),
                TransportError::Disconnected => "Device has been disconnected.".to_string(),
                other => format!("Unable to claim interface: {}", other),
            })
        })?;

        let ctx = &mut record.context;
        if ctx.cur_samplerate == 0 {
            // Default to the slowest rate.
            ctx.cur_samplerate = ctx.samplerates.first().copied().unwrap_or_default();
        }

        record.status = DeviceStatus::Active;
        info!(
            "Opened device on {} (logical) / {} (physical), interface {}",
            record.conn, record.connection_id, interface
        );
        self.observer.on_event(&BringupEvent::DeviceOpened {
            bus_id: record.conn.bus_id.clone(),
            address,
        });

        Ok(OpenDevice { handle, interface })
    }

    /// Release the interface and close the device.
    pub fn close(
        &self,
        record: &mut DeviceRecord,
        device: OpenDevice<B::Handle>,
    ) -> Result<(), BringupError> {
        let OpenDevice {
            mut handle,
            interface,
        } = device;

        info!(
            "Closing device on {} (logical) / {} (physical) interface {}",
            record.conn, record.connection_id, interface
        );
        let released = handle
            .release_interface(interface)
            .map_err(|e| BringupError::ConfigurationFailed(e.to_string()));
        drop(handle);

        record.status = DeviceStatus::Inactive;
        self.observer.on_event(&BringupEvent::DeviceClosed {
            bus_id: record.conn.bus_id.clone(),
            address: record.conn.address,
        });
        released
    }

    /// Find the device on the record's port that runs the analyzer firmware.
    fn acquire(&self, record: &DeviceRecord) -> Result<(B::Handle, u8), BringupError> {
        let candidates = self
            .bus
            .list_devices()
            .map_err(|e| BringupError::ConfigurationFailed(e.to_string()))?;

        let on_port = candidates
            .iter()
            .filter(|c| c.port_path.as_deref() == Some(record.connection_id.as_str()));

        for candidate in on_port {
            let handle = match self.bus.open(candidate) {
                Ok(handle) => handle,
                Err(e) => {
                    debug!(device = %candidate, "Failed to open: {}", e);
                    continue;
                }
            };
            match handle.read_strings() {
                Ok(strings) if has_firmware(&strings) => return Ok((handle, candidate.address)),
                Ok(_) => debug!(device = %candidate, "Firmware not running yet"),
                Err(e) => debug!(device = %candidate, "Failed to read strings: {}", e),
            }
        }

        Err(BringupError::ConfigurationFailed(format!(
            "no device running the firmware on port {}",
            record.connection_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{NullObserver, RecordingObserver};
    use crate::image::MemoryLoader;
    use crate::options::{ConfigKey, ConfigValue, config_get};
    use crate::protocol::constants::ADDRESS_UNKNOWN;
    use crate::transport::{MockBus, MockCall, MockDevice};

    fn fast_config() -> DriverConfig {
        DriverConfig {
            renum_settle_ms: 1,
            renum_poll_interval_ms: 2,
            max_renum_delay_ms: 2000,
            ..DriverConfig::default()
        }
    }

    fn fx3_image() -> Vec<u8> {
        let mut image = b"CY\x1c\xb0".to_vec();
        image.extend_from_slice(&1u32.to_le_bytes());
        image.extend_from_slice(&0x4000_0000u32.to_le_bytes());
        image.extend_from_slice(&[0xAA; 4]);
        image.extend_from_slice(&0u32.to_le_bytes());
        image.extend_from_slice(&0x4000_0000u32.to_le_bytes());
        image.extend_from_slice(&0xAAAA_AAAAu32.to_le_bytes());
        image
    }

    fn driver(bus: &MockBus, config: DriverConfig) -> Driver<MockBus, MemoryLoader, NullObserver> {
        let loader = MemoryLoader::new().with_image("fx3lafw-cypress-fx3.fw", fx3_image());
        Driver::with_parts(bus.clone(), loader, Arc::new(NullObserver), config)
    }

    fn single_record<O: BringupObserver>(driver: &Driver<MockBus, MemoryLoader, O>) -> DeviceRecord {
        let mut outcomes = driver.scan(None);
        assert_eq!(outcomes.len(), 1);
        outcomes.remove(0).into_record().unwrap()
    }

    #[test]
    fn test_open_ready_device_immediately() {
        let bus = MockBus::new();
        bus.add_device(
            MockDevice::new("2", 7, 0x04B4, 0x00F3).with_strings("sigrok", "fx3lafw", "0001"),
        );
        let driver = driver(&bus, DriverConfig::default());
        let mut record = single_record(&driver);
        let listings = bus.list_count();

        let started = std::time::Instant::now();
        let device = driver.open(&mut record).unwrap();
        // No settle delay for a device that never took an upload.
        assert!(started.elapsed() < std::time::Duration::from_millis(RENUM_SETTLE_MS / 2));
        assert!(bus.transfers().is_empty());
        assert_eq!(bus.list_count(), listings + 1);
        assert_eq!(record.status, DeviceStatus::Active);
        assert_eq!(record.conn.address, 7);
        assert_eq!(record.context.cur_samplerate, 200_000);
        assert_eq!(device.interface(), 0);
        assert_eq!(bus.open_handles(), 1);

        driver.close(&mut record, device).unwrap();
        assert_eq!(record.status, DeviceStatus::Inactive);
        assert_eq!(bus.open_handles(), 0);
        let calls = bus.calls();
        assert!(calls.contains(&MockCall::ClaimInterface(0)));
        assert!(calls.contains(&MockCall::ReleaseInterface(0)));
    }

    #[test]
    fn test_open_after_renumeration() {
        let bus = MockBus::new();
        bus.add_device(MockDevice::new("2", 3, 0x04B4, 0x00F3));
        let driver = driver(&bus, fast_config());
        let mut record = single_record(&driver);
        assert_eq!(record.status, DeviceStatus::Initializing);
        assert!(matches!(
            config_get(ConfigKey::Conn, &record),
            Err(BringupError::AddressUnknown)
        ));

        // The boot loader drops off and the firmware shows up on the same
        // port a few polls later.
        bus.remove_device(3);
        bus.add_device_after(
            MockDevice::new("2", 9, 0x04B4, 0x00F3).with_strings("sigrok", "fx3lafw", ""),
            2,
        );

        let device = driver.open(&mut record).unwrap();
        assert_eq!(record.conn.address, 9);
        assert_eq!(
            config_get(ConfigKey::Conn, &record).unwrap(),
            ConfigValue::Str("2.9".into())
        );
        driver.close(&mut record, device).unwrap();
        assert_eq!(bus.open_handles(), 0);
    }

    #[test]
    fn test_stale_boot_loader_not_acquired() {
        let bus = MockBus::new();
        bus.add_device(MockDevice::new("2", 3, 0x04B4, 0x00F3));
        let config = DriverConfig {
            max_renum_delay_ms: 30,
            ..fast_config()
        };
        let driver = driver(&bus, config);
        let mut record = single_record(&driver);

        // The boot loader never goes away.
        let result = driver.open(&mut record);
        assert!(matches!(
            result,
            Err(BringupError::RenumerationTimeout { .. })
        ));
        assert_eq!(record.conn.address, ADDRESS_UNKNOWN);
        assert_eq!(record.status, DeviceStatus::Initializing);
        assert_eq!(bus.open_handles(), 0);
    }

    #[test]
    fn test_busy_interface() {
        let bus = MockBus::new();
        bus.add_device(
            MockDevice::new("2", 7, 0x04B4, 0x00F3).with_strings("sigrok", "fx3lafw", ""),
        );
        bus.set_interface_busy(true);
        let driver = driver(&bus, DriverConfig::default());
        let mut record = single_record(&driver);

        match driver.open(&mut record) {
            Err(BringupError::ConfigurationFailed(msg)) => assert!(msg.contains("already claimed")),
            other => panic!("expected ConfigurationFailed, got {:?}", other.map(|_| ())),
        }
        assert_eq!(record.status, DeviceStatus::Inactive);
        assert_eq!(bus.open_handles(), 0);
    }

    #[test]
    fn test_open_emits_renumerated() {
        let bus = MockBus::new();
        bus.add_device(
            MockDevice::new("1", 4, 0x04B4, 0x00F3).with_strings("sigrok", "fx3lafw", ""),
        );
        let observer = Arc::new(RecordingObserver::new());
        let driver = Driver::with_parts(
            bus.clone(),
            MemoryLoader::new(),
            Arc::clone(&observer),
            fast_config(),
        );
        let mut record = single_record(&driver);
        record.context.mark_uploaded(std::time::Instant::now());

        let device = driver.open(&mut record).unwrap();
        let events = observer.events();
        assert!(events.iter().any(|e| matches!(e, BringupEvent::Renumerated { address: 4, .. })));
        assert!(events.iter().any(|e| matches!(e, BringupEvent::DeviceOpened { address: 4, .. })));
        drop(device);
    }

    #[test]
    fn test_config_toml() {
        let path = std::env::temp_dir().join(format!("fx3kit-config-{}.toml", std::process::id()));
        let config = DriverConfig {
            firmware_dirs: vec![PathBuf::from("/opt/fw")],
            max_renum_delay_ms: 5000,
            ..DriverConfig::default()
        };
        config.save_to_file(&path).unwrap();
        assert_eq!(DriverConfig::load_from_file(&path).unwrap(), config);
        std::fs::remove_file(&path).unwrap();

        let partial: DriverConfig = toml::from_str("renum_settle_ms = 500").unwrap();
        assert_eq!(partial.renum_settle_ms, 500);
        assert_eq!(partial.usb_interface, USB_INTERFACE);
        assert_eq!(
            partial.renumeration_policy().max_delay,
            std::time::Duration::from_millis(MAX_RENUM_DELAY_MS)
        );
    }
}
