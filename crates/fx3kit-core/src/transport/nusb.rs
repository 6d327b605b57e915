//! nusb-based USB transport implementation.

use std::num::NonZeroU8;
use std::time::Duration;

use nusb::transfer::{ControlOut, ControlType, Recipient, TransferError};
use nusb::{Device, ErrorKind, Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument};

use super::traits::{TransportError, UsbBus, UsbCandidate, UsbHandle, UsbStrings, VendorRequest};
use crate::protocol::constants::{LANGUAGE_ID_US_ENGLISH, STRING_DESCRIPTOR_TIMEOUT};

fn claim_error(interface: u8, kind: ErrorKind, message: String) -> TransportError {
    match kind {
        ErrorKind::Busy => TransportError::Busy { interface },
        ErrorKind::Disconnected => TransportError::Disconnected,
        _ => TransportError::ClaimInterfaceFailed { interface, message },
    }
}

fn transfer_error(e: TransferError) -> TransportError {
    match e {
        TransferError::Disconnected => TransportError::Disconnected,
        other => TransportError::ControlTransferFailed(other.to_string()),
    }
}

/// nusb-backed bus access.
#[derive(Debug, Default, Clone, Copy)]
pub struct NusbBus;

impl NusbBus {
    pub fn new() -> Self {
        Self
    }
}

fn candidate_from_info(info: &nusb::DeviceInfo) -> UsbCandidate {
    let ports = info.port_chain();
    let port_path = if ports.is_empty() {
        None
    } else {
        let chain: Vec<String> = ports.iter().map(|p| p.to_string()).collect();
        Some(format!("{}-{}", info.bus_id(), chain.join(".")))
    };

    UsbCandidate {
        bus_id: info.bus_id().to_string(),
        address: info.device_address(),
        vendor_id: info.vendor_id(),
        product_id: info.product_id(),
        port_path,
    }
}

impl UsbBus for NusbBus {
    type Handle = NusbHandle;

    #[instrument(level = "debug", skip(self))]
    fn list_devices(&self) -> Result<Vec<UsbCandidate>, TransportError> {
        let devices = list_devices()
            .wait()
            .map_err(|e| TransportError::EnumerationFailed(e.to_string()))?;

        Ok(devices.map(|info| candidate_from_info(&info)).collect())
    }

    #[instrument(level = "debug", skip(self), fields(device = %candidate))]
    fn open(&self, candidate: &UsbCandidate) -> Result<NusbHandle, TransportError> {
        let device_info = list_devices()
            .wait()
            .map_err(|e| TransportError::EnumerationFailed(e.to_string()))?
            .find(|d| d.bus_id() == candidate.bus_id && d.device_address() == candidate.address)
            .ok_or(TransportError::DeviceNotFound {
                vid: candidate.vendor_id,
                pid: candidate.product_id,
            })?;

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        debug!(
            vendor_id = %format!("{:04X}", candidate.vendor_id),
            product_id = %format!("{:04X}", candidate.product_id),
            "Device opened"
        );

        Ok(NusbHandle {
            device,
            interface: None,
        })
    }
}

/// An open nusb device, plus the interface claimed on it (if any).
pub struct NusbHandle {
    device: Device,
    interface: Option<Interface>,
}

impl NusbHandle {
    fn read_string(&self, index: Option<NonZeroU8>) -> Result<String, TransportError> {
        let Some(index) = index else {
            return Ok(String::new());
        };
        self.device
            .get_string_descriptor(index, LANGUAGE_ID_US_ENGLISH, STRING_DESCRIPTOR_TIMEOUT)
            .wait()
            .map_err(|e| TransportError::StringDescriptor {
                index: index.get(),
                message: e.to_string(),
            })
    }
}

impl UsbHandle for NusbHandle {
    fn read_strings(&self) -> Result<UsbStrings, TransportError> {
        let desc = self.device.device_descriptor();
        Ok(UsbStrings {
            manufacturer: self.read_string(desc.manufacturer_string_index())?,
            product: self.read_string(desc.product_string_index())?,
            serial_number: self.read_string(desc.serial_number_string_index())?,
        })
    }

    fn detach_kernel_driver(&self, interface: u8) -> Result<(), TransportError> {
        // Linux reports an error when nothing is bound, which is the common
        // case for a bare boot loader.
        if let Err(e) = self.device.detach_kernel_driver(interface) {
            debug!(interface, error = %e, "No kernel driver detached");
        }
        Ok(())
    }

    fn set_configuration(&self, configuration: u8) -> Result<(), TransportError> {
        self.device
            .set_configuration(configuration)
            .wait()
            .map_err(|e| TransportError::SetConfigurationFailed {
                configuration,
                message: e.to_string(),
            })
    }

    #[instrument(level = "trace", skip(self, data), fields(len = data.len()))]
    fn vendor_out(
        &self,
        request: VendorRequest,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError> {
        self.device
            .control_out(
                ControlOut {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request: request.request,
                    value: request.value,
                    index: request.index,
                    data,
                },
                timeout,
            )
            .wait()
            .map_err(transfer_error)?;

        Ok(data.len())
    }

    fn claim_interface(&mut self, interface: u8) -> Result<(), TransportError> {
        let claimed = self
            .device
            .claim_interface(interface)
            .wait()
            .map_err(|e| claim_error(interface, e.kind(), e.to_string()))?;
        info!(interface, "Interface claimed");
        self.interface = Some(claimed);
        Ok(())
    }

    fn release_interface(&mut self, interface: u8) -> Result<(), TransportError> {
        match self.interface.take() {
            Some(claimed) if claimed.interface_number() == interface => {
                drop(claimed);
                Ok(())
            }
            other => {
                self.interface = other;
                Err(TransportError::ClaimInterfaceFailed {
                    interface,
                    message: "interface is not claimed".into(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_error_kinds() {
        assert!(matches!(
            claim_error(0, ErrorKind::Busy, "busy".into()),
            TransportError::Busy { interface: 0 }
        ));
        assert!(matches!(
            claim_error(0, ErrorKind::Disconnected, "gone".into()),
            TransportError::Disconnected
        ));
        match claim_error(1, ErrorKind::PermissionDenied, "denied".into()) {
            TransportError::ClaimInterfaceFailed { interface, message } => {
                assert_eq!(interface, 1);
                assert_eq!(message, "denied");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_transfer_error_disconnected() {
        assert!(matches!(
            transfer_error(TransferError::Disconnected),
            TransportError::Disconnected
        ));
        assert!(matches!(
            transfer_error(TransferError::Stall),
            TransportError::ControlTransferFailed(_)
        ));
    }
}
