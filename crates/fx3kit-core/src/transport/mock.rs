//! Mock USB transport for testing.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::traits::{TransportError, UsbBus, UsbCandidate, UsbHandle, UsbStrings, VendorRequest};

/// A captured vendor control transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRecord {
    pub request: VendorRequest,
    pub data: Vec<u8>,
    pub timeout: Duration,
}

/// Every handle-level call made against the mock, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Open { address: u8 },
    ReadStrings { address: u8 },
    DetachKernelDriver(u8),
    SetConfiguration(u8),
    ClaimInterface(u8),
    ReleaseInterface(u8),
    Close { address: u8 },
}

/// A simulated device on the mock bus.
#[derive(Debug, Clone)]
pub struct MockDevice {
    pub candidate: UsbCandidate,
    pub strings: UsbStrings,
    pub fail_open: bool,
    pub fail_strings: bool,
}

impl MockDevice {
    pub fn new(bus_id: &str, address: u8, vid: u16, pid: u16) -> Self {
        Self {
            candidate: UsbCandidate {
                bus_id: bus_id.to_string(),
                address,
                vendor_id: vid,
                product_id: pid,
                port_path: Some(format!("{}-1", bus_id)),
            },
            strings: UsbStrings::default(),
            fail_open: false,
            fail_strings: false,
        }
    }

    pub fn with_strings(mut self, manufacturer: &str, product: &str, serial: &str) -> Self {
        self.strings = UsbStrings::new(manufacturer, product, serial);
        self
    }

    pub fn with_port_path(mut self, port_path: Option<&str>) -> Self {
        self.candidate.port_path = port_path.map(str::to_string);
        self
    }

    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub fn failing_strings(mut self) -> Self {
        self.fail_strings = true;
        self
    }
}

#[derive(Debug, Default)]
struct MockState {
    devices: Vec<MockDevice>,
    /// Devices that show up after the given number of further listings.
    pending: Vec<(usize, MockDevice)>,
    calls: Vec<MockCall>,
    transfers: Vec<ControlRecord>,
    /// Zero-based index of the transfer that should fail.
    fail_transfer_at: Option<usize>,
    fail_set_configuration: bool,
    interface_busy: bool,
    open_handles: usize,
    list_count: usize,
}

/// Mock bus for unit testing discovery, upload and renumeration logic.
#[derive(Debug, Clone, Default)]
pub struct MockBus {
    state: Arc<Mutex<MockState>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plug in a device, visible from the next listing on.
    pub fn add_device(&self, device: MockDevice) {
        self.state.lock().unwrap().devices.push(device);
    }

    /// Plug in a device that only appears after `listings` more listings.
    pub fn add_device_after(&self, device: MockDevice, listings: usize) {
        self.state.lock().unwrap().pending.push((listings, device));
    }

    /// Unplug the device at `address`.
    pub fn remove_device(&self, address: u8) {
        self.state
            .lock()
            .unwrap()
            .devices
            .retain(|d| d.candidate.address != address);
    }

    /// Make the `n`th control transfer (zero-based) fail.
    pub fn fail_transfer_at(&self, n: usize) {
        self.state.lock().unwrap().fail_transfer_at = Some(n);
    }

    pub fn fail_set_configuration(&self) {
        self.state.lock().unwrap().fail_set_configuration = true;
    }

    /// Simulate another program holding the interface.
    pub fn set_interface_busy(&self, busy: bool) {
        self.state.lock().unwrap().interface_busy = busy;
    }

    /// Get all captured control transfers.
    pub fn transfers(&self) -> Vec<ControlRecord> {
        self.state.lock().unwrap().transfers.clone()
    }

    /// Get all captured handle calls.
    pub fn calls(&self) -> Vec<MockCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Number of handles currently open.
    pub fn open_handles(&self) -> usize {
        self.state.lock().unwrap().open_handles
    }

    /// Number of `list_devices` calls so far.
    pub fn list_count(&self) -> usize {
        self.state.lock().unwrap().list_count
    }
}

impl UsbBus for MockBus {
    type Handle = MockHandle;

    fn list_devices(&self) -> Result<Vec<UsbCandidate>, TransportError> {
        let mut state = self.state.lock().unwrap();
        state.list_count += 1;

        let mut still_pending = Vec::new();
        for (remaining, device) in std::mem::take(&mut state.pending) {
            if remaining == 0 {
                state.devices.push(device);
            } else {
                still_pending.push((remaining - 1, device));
            }
        }
        state.pending = still_pending;

        Ok(state.devices.iter().map(|d| d.candidate.clone()).collect())
    }

    fn open(&self, candidate: &UsbCandidate) -> Result<MockHandle, TransportError> {
        let mut state = self.state.lock().unwrap();
        let device = state
            .devices
            .iter()
            .find(|d| {
                d.candidate.bus_id == candidate.bus_id && d.candidate.address == candidate.address
            })
            .cloned()
            .ok_or(TransportError::DeviceNotFound {
                vid: candidate.vendor_id,
                pid: candidate.product_id,
            })?;

        if device.fail_open {
            return Err(TransportError::OpenFailed("Access denied".into()));
        }

        state.open_handles += 1;
        state.calls.push(MockCall::Open {
            address: candidate.address,
        });

        Ok(MockHandle {
            device,
            state: Arc::clone(&self.state),
            claimed: None,
        })
    }
}

/// Handle to a mock device. Dropping it counts as a close.
#[derive(Debug)]
pub struct MockHandle {
    device: MockDevice,
    state: Arc<Mutex<MockState>>,
    claimed: Option<u8>,
}

impl MockHandle {
    fn record(&self, call: MockCall) {
        self.state.lock().unwrap().calls.push(call);
    }
}

impl UsbHandle for MockHandle {
    fn read_strings(&self) -> Result<UsbStrings, TransportError> {
        self.record(MockCall::ReadStrings {
            address: self.device.candidate.address,
        });
        if self.device.fail_strings {
            return Err(TransportError::StringDescriptor {
                index: 1,
                message: "Pipe error".into(),
            });
        }
        Ok(self.device.strings.clone())
    }

    fn detach_kernel_driver(&self, interface: u8) -> Result<(), TransportError> {
        self.record(MockCall::DetachKernelDriver(interface));
        Ok(())
    }

    fn set_configuration(&self, configuration: u8) -> Result<(), TransportError> {
        self.record(MockCall::SetConfiguration(configuration));
        if self.state.lock().unwrap().fail_set_configuration {
            return Err(TransportError::SetConfigurationFailed {
                configuration,
                message: "Resource busy".into(),
            });
        }
        Ok(())
    }

    fn vendor_out(
        &self,
        request: VendorRequest,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_transfer_at == Some(state.transfers.len()) {
            state.fail_transfer_at = None;
            return Err(TransportError::ControlTransferFailed("Pipe error".into()));
        }
        state.transfers.push(ControlRecord {
            request,
            data: data.to_vec(),
            timeout,
        });
        Ok(data.len())
    }

    fn claim_interface(&mut self, interface: u8) -> Result<(), TransportError> {
        self.record(MockCall::ClaimInterface(interface));
        if self.state.lock().unwrap().interface_busy {
            return Err(TransportError::Busy { interface });
        }
        self.claimed = Some(interface);
        Ok(())
    }

    fn release_interface(&mut self, interface: u8) -> Result<(), TransportError> {
        self.record(MockCall::ReleaseInterface(interface));
        if self.claimed.take() != Some(interface) {
            return Err(TransportError::ClaimInterfaceFailed {
                interface,
                message: "interface is not claimed".into(),
            });
        }
        Ok(())
    }
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.open_handles -= 1;
        state.calls.push(MockCall::Close {
            address: self.device.candidate.address,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_transfer_capture() {
        let bus = MockBus::new();
        bus.add_device(MockDevice::new("1", 5, 0x04B4, 0x00F3));

        let candidates = bus.list_devices().unwrap();
        let handle = bus.open(&candidates[0]).unwrap();
        let req = VendorRequest {
            request: 0xA0,
            value: 0x1234,
            index: 0,
        };
        handle.vendor_out(req, b"Hello", Duration::from_millis(100)).unwrap();

        let transfers = bus.transfers();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].request, req);
        assert_eq!(transfers[0].data, b"Hello");
    }

    #[test]
    fn test_mock_handle_drop_closes() {
        let bus = MockBus::new();
        bus.add_device(MockDevice::new("1", 5, 0x04B4, 0x00F3));
        let candidates = bus.list_devices().unwrap();

        let handle = bus.open(&candidates[0]).unwrap();
        assert_eq!(bus.open_handles(), 1);
        drop(handle);
        assert_eq!(bus.open_handles(), 0);
        assert_eq!(bus.calls().last(), Some(&MockCall::Close { address: 5 }));
    }

    #[test]
    fn test_mock_pending_device_appears() {
        let bus = MockBus::new();
        bus.add_device_after(MockDevice::new("1", 9, 0x04B4, 0x00F3), 1);

        assert!(bus.list_devices().unwrap().is_empty());
        assert_eq!(bus.list_devices().unwrap().len(), 1);
    }

    #[test]
    fn test_mock_failing_transfer() {
        let bus = MockBus::new();
        bus.add_device(MockDevice::new("1", 5, 0x04B4, 0x00F3));
        bus.fail_transfer_at(1);
        let candidates = bus.list_devices().unwrap();
        let handle = bus.open(&candidates[0]).unwrap();
        let req = VendorRequest {
            request: 0xA0,
            value: 0,
            index: 0,
        };

        assert!(handle.vendor_out(req, b"a", Duration::ZERO).is_ok());
        assert!(handle.vendor_out(req, b"b", Duration::ZERO).is_err());
        assert!(handle.vendor_out(req, b"c", Duration::ZERO).is_ok());
        assert_eq!(bus.transfers().len(), 2);
    }
}
