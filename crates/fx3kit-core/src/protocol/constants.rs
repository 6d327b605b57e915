//! Protocol constants for the Cypress FX2/FX3 boot loaders.
//!
//! Both chips accept firmware through the same vendor request that the
//! EZ-USB "A0" loader has always used; the FX3 ROM additionally understands
//! the segmented `.img` boot format.

use std::time::Duration;

// ============================================================================
// Device Identification
// ============================================================================

/// Cypress Semiconductor Vendor ID
pub const CYPRESS_VENDOR_ID: u16 = 0x04B4;

/// FX3 boot loader Product ID (SuperSpeed Explorer Kit, CYUSB3KIT-003)
pub const FX3_BOOTLOADER_PID: u16 = 0x00F3;

/// FX2 boot loader Product ID (bare CY7C68013A)
pub const FX2_BOOTLOADER_PID: u16 = 0x8613;

/// Manufacturer string reported once the analyzer firmware is running.
pub const FIRMWARE_MANUFACTURER: &str = "sigrok";
/// Product string reported once the analyzer firmware is running.
pub const FIRMWARE_PRODUCT: &str = "fx3lafw";

/// US English, the only language the boot loaders answer in.
pub const LANGUAGE_ID_US_ENGLISH: u16 = 0x0409;

/// Configuration selected before talking to the boot loader.
pub const USB_CONFIGURATION: u8 = 1;
/// Interface claimed once the analyzer firmware is running.
pub const USB_INTERFACE: u8 = 0;

/// Bus address stored for a device that has not renumerated yet.
pub const ADDRESS_UNKNOWN: u8 = 0xFF;

// ============================================================================
// Vendor Requests
// ============================================================================

/// Firmware load / RAM write request ("A0" loader).
pub const VENDOR_REQUEST_FIRMWARE_LOAD: u8 = 0xA0;

/// FX2 CPUCS register; bit 0 holds the 8051 in reset.
pub const FX2_CPUCS_ADDR: u16 = 0xE600;

// ============================================================================
// Size Constants
// ============================================================================

/// Largest payload carried by a single firmware control transfer.
pub const FW_CHUNK_SIZE: usize = 4 * 1024;

/// FX2 images are addressed through the 16-bit `wValue` field only.
pub const FX2_MAX_IMAGE_SIZE: usize = 1 << 16;

/// FX3 images span up to 512 KiB of SYSMEM plus headers.
pub const FX3_MAX_IMAGE_SIZE: usize = 536 << 10;

// ============================================================================
// FX3 Boot Image Format
// ============================================================================

/// `"CY"` signature at the start of every FX3 boot image.
pub const FX3_IMAGE_SIGNATURE: [u8; 2] = *b"CY";

/// Fourth header byte: "normal FW binary, no SPI/I2C boot".
pub const FX3_IMAGE_TYPE: u8 = 0xB0;

/// Signature + control byte + image type.
pub const FX3_IMAGE_HEADER_SIZE: usize = 4;

/// Word count + load address.
pub const FX3_SECTION_HEADER_SIZE: usize = 8;

/// Trailing 32-bit checksum.
pub const FX3_CHECKSUM_SIZE: usize = 4;

// ============================================================================
// Timing
// ============================================================================

/// Timeout of every firmware or reset control transfer.
pub const CONTROL_TIMEOUT: Duration = Duration::from_millis(100);

/// Timeout used for string descriptor reads during discovery.
pub const STRING_DESCRIPTOR_TIMEOUT: Duration = Duration::from_millis(500);

/// Time the old device identity needs to drop off the bus.
pub const RENUM_SETTLE_MS: u64 = 300;

/// Interval between re-acquisition attempts while waiting.
pub const RENUM_POLL_INTERVAL_MS: u64 = 100;

/// Give up on renumeration after this long since the upload finished.
pub const MAX_RENUM_DELAY_MS: u64 = 3000;
