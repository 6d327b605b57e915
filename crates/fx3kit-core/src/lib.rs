//! fx3kit-core: firmware bring-up for Cypress FX2/FX3 based logic analyzers.
//!
//! Boards built around the FX2 or FX3 enumerate as a bare boot loader. This
//! crate finds them, uploads the analyzer firmware over vendor control
//! requests, waits for the device to come back at its new bus address and
//! opens it.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Boot loader constants and chunk address splitting
//! - **Transport**: USB access abstraction (nusb, mock)
//! - **Image**: Firmware lookup, validation and segmentation
//! - **Upload**: Chunked transfers and FX2 CPU reset control
//! - **Discovery**: Per-device bring-up outcomes for one bus scan
//! - **Renum**: Waiting out renumeration after an upload
//! - **Driver**: Scan / open / close front end and its TOML configuration
//! - **Options**: Config keys (samplerate, sample limit, connection, ...)
//! - **Events**: Observer pattern for UI decoupling
//!
//! # Example
//!
//! ```no_run
//! use fx3kit_core::driver::{Driver, DriverConfig};
//! use fx3kit_core::inventory::Inventory;
//!
//! let driver = Driver::new(DriverConfig::default());
//! let mut inventory = Inventory::new();
//! inventory.absorb(driver.scan(None));
//!
//! if let Some(record) = inventory.get_mut(0) {
//!     let device = driver.open(record).expect("open failed");
//!     driver.close(record, device).expect("close failed");
//! }
//! ```

pub mod discovery;
pub mod driver;
pub mod error;
pub mod events;
pub mod image;
pub mod inventory;
pub mod options;
pub mod profile;
pub mod protocol;
pub mod renum;
pub mod transport;
pub mod upload;

// Re-exports for convenience
pub use discovery::{ConnFilter, DiscoverOptions, discover, upload_firmware};
pub use driver::{Driver, DriverConfig, OpenDevice};
pub use error::BringupError;
pub use events::{BringupEvent, BringupObserver, NullObserver, RecordingObserver, TracingObserver};
pub use image::{FirmwareDirs, FirmwareLoader, ImageFormat, MemoryLoader, inspect, segments};
pub use inventory::{DeviceRecord, DeviceStatus, Discovery, Inventory, SkipReason};
pub use options::{ConfigKey, ConfigValue, config_get, config_list, config_set};
pub use profile::{DevCaps, DeviceProfile, SUPPORTED_PROFILES};
pub use protocol::ChunkAddress;
pub use renum::{RenumerationPolicy, wait_for_renumeration};
pub use transport::{MockBus, NusbBus, TransportError, UsbBus, UsbHandle};
pub use upload::{set_reset, upload_image};
