//! USB Transport layer abstraction.
//!
//! Defines the `UsbBus` and `UsbHandle` traits for the handful of USB
//! operations bring-up needs, allowing different implementations
//! (nusb, mock, etc.).

use std::fmt;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: VID={vid:04X} PID={pid:04X}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("Failed to enumerate devices: {0}")]
    EnumerationFailed(String),

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to read string descriptor {index}: {message}")]
    StringDescriptor { index: u8, message: String },

    #[error("Failed to detach kernel driver from interface {interface}: {message}")]
    DetachKernelDriverFailed { interface: u8, message: String },

    #[error("Failed to set configuration {configuration}: {message}")]
    SetConfigurationFailed { configuration: u8, message: String },

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Interface {interface} already claimed by another program or driver")]
    Busy { interface: u8 },

    #[error("Control transfer failed: {0}")]
    ControlTransferFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A device seen during enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbCandidate {
    /// Platform bus identifier (the bus number on Linux).
    pub bus_id: String,
    /// Address on that bus; changes on every renumeration.
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    /// Physical port path such as `"1-4.2"`, stable across renumeration.
    pub port_path: Option<String>,
}

impl fmt::Display for UsbCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04X}:{:04X} at {}.{}",
            self.vendor_id, self.product_id, self.bus_id, self.address
        )
    }
}

/// Manufacturer, product and serial number strings.
///
/// A descriptor index of zero reads back as an empty string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsbStrings {
    pub manufacturer: String,
    pub product: String,
    pub serial_number: String,
}

impl UsbStrings {
    pub fn new(manufacturer: &str, product: &str, serial_number: &str) -> Self {
        Self {
            manufacturer: manufacturer.to_string(),
            product: product.to_string(),
            serial_number: serial_number.to_string(),
        }
    }
}

/// Setup packet fields of a vendor OUT request addressed to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VendorRequest {
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

/// An open device.
///
/// Dropping the handle closes the device.
pub trait UsbHandle: Send + Sync {
    /// Read the manufacturer, product and serial number strings.
    fn read_strings(&self) -> Result<UsbStrings, TransportError>;

    /// Detach whatever kernel driver is bound to `interface`.
    fn detach_kernel_driver(&self, interface: u8) -> Result<(), TransportError>;

    /// Select a configuration.
    fn set_configuration(&self, configuration: u8) -> Result<(), TransportError>;

    /// Send a vendor OUT control transfer, returning the bytes written.
    fn vendor_out(
        &self,
        request: VendorRequest,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    /// Claim an interface for exclusive use.
    fn claim_interface(&mut self, interface: u8) -> Result<(), TransportError>;

    /// Release a previously claimed interface.
    fn release_interface(&mut self, interface: u8) -> Result<(), TransportError>;
}

/// Device enumeration and opening.
pub trait UsbBus {
    type Handle: UsbHandle;

    /// List every device currently on the bus.
    fn list_devices(&self) -> Result<Vec<UsbCandidate>, TransportError>;

    /// Open the device at the candidate's bus address.
    fn open(&self, candidate: &UsbCandidate) -> Result<Self::Handle, TransportError>;
}
