//! Transport layer module.

pub mod mock;
pub mod nusb;
pub mod traits;

pub use mock::{ControlRecord, MockBus, MockCall, MockDevice, MockHandle};
pub use nusb::{NusbBus, NusbHandle};
pub use traits::{TransportError, UsbBus, UsbCandidate, UsbHandle, UsbStrings, VendorRequest};
