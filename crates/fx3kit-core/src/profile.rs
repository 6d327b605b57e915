//! Supported device models.

use std::fmt;
use std::ops::BitOr;

use crate::image::ImageFormat;
use crate::protocol::constants::{
    CYPRESS_VENDOR_ID, FIRMWARE_MANUFACTURER, FIRMWARE_PRODUCT, FX3_BOOTLOADER_PID,
};
use crate::transport::UsbStrings;

/// Device capability flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DevCaps(u32);

impl DevCaps {
    pub const NONE: Self = Self(0);
    /// SuperSpeed FX3: segmented images, no reset bracketing, fast rates.
    pub const FX3: Self = Self(1 << 0);
    pub const BITS_16: Self = Self(1 << 1);
    pub const BITS_24: Self = Self(1 << 2);
    pub const BITS_32: Self = Self(1 << 3);
    /// One analog input next to the logic channels.
    pub const AX_ANALOG: Self = Self(1 << 4);

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for DevCaps {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

/// Static description of one supported model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceProfile {
    pub vendor_id: u16,
    pub product_id: u16,
    pub vendor: &'static str,
    pub model: &'static str,
    pub model_version: Option<&'static str>,
    /// Firmware resource name.
    pub firmware: &'static str,
    pub dev_caps: DevCaps,
    /// Required manufacturer string, if the IDs alone are ambiguous.
    pub usb_manufacturer: Option<&'static str>,
    /// Required product string, if the IDs alone are ambiguous.
    pub usb_product: Option<&'static str>,
}

impl DeviceProfile {
    pub fn is_fx3(&self) -> bool {
        self.dev_caps.contains(DevCaps::FX3)
    }

    pub fn image_format(&self) -> ImageFormat {
        if self.is_fx3() {
            ImageFormat::Segmented
        } else {
            ImageFormat::Simple
        }
    }

    /// Whether the upload must be bracketed by CPU reset requests.
    pub fn needs_reset(&self) -> bool {
        !self.is_fx3()
    }

    pub fn samplerates(&self) -> &'static [u64] {
        if self.is_fx3() {
            &SAMPLERATES
        } else {
            &SAMPLERATES[..SAMPLERATES.len() - NUM_FX3_RATES]
        }
    }

    pub fn num_logic_channels(&self) -> usize {
        if self.dev_caps.contains(DevCaps::BITS_32) {
            32
        } else if self.dev_caps.contains(DevCaps::BITS_24) {
            24
        } else if self.dev_caps.contains(DevCaps::BITS_16) {
            16
        } else {
            8
        }
    }

    pub fn num_analog_channels(&self) -> usize {
        usize::from(self.dev_caps.contains(DevCaps::AX_ANALOG))
    }

    /// Whether the (vid, pid) pair is one this profile could describe.
    pub fn is_plausible(&self, vid: u16, pid: u16) -> bool {
        self.vendor_id == vid && self.product_id == pid
    }

    /// IDs equal, and each required string unset or equal.
    pub fn matches(&self, vid: u16, pid: u16, strings: &UsbStrings) -> bool {
        self.is_plausible(vid, pid)
            && self
                .usb_manufacturer
                .is_none_or(|m| m == strings.manufacturer)
            && self.usb_product.is_none_or(|p| p == strings.product)
    }
}

impl fmt::Display for DeviceProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.vendor, self.model)?;
        if let Some(version) = self.model_version {
            write!(f, " {}", version)?;
        }
        Ok(())
    }
}

/// Known models, in match priority order.
pub static SUPPORTED_PROFILES: &[DeviceProfile] = &[
    // Cypress SuperSpeed Explorer Kit (CYUSB3KIT-003)
    DeviceProfile {
        vendor_id: CYPRESS_VENDOR_ID,
        product_id: FX3_BOOTLOADER_PID,
        vendor: "Cypress",
        model: "SuperSpeed Explorer Kit",
        model_version: None,
        firmware: "fx3lafw-cypress-fx3.fw",
        dev_caps: DevCaps::FX3.union(DevCaps::BITS_32),
        usb_manufacturer: None,
        usb_product: None,
    },
];

/// Bare CY7C68013A boot loader, for exercising the FX2 upload path.
#[cfg(test)]
pub(crate) const TEST_FX2_PROFILE: DeviceProfile = DeviceProfile {
    vendor_id: CYPRESS_VENDOR_ID,
    product_id: crate::protocol::constants::FX2_BOOTLOADER_PID,
    vendor: "Cypress",
    model: "FX2",
    model_version: None,
    firmware: "fx2-test.fw",
    dev_caps: DevCaps::BITS_16,
    usb_manufacturer: None,
    usb_product: None,
};

const fn khz(n: u64) -> u64 {
    n * 1_000
}

const fn mhz(n: u64) -> u64 {
    n * 1_000_000
}

/// Supported samplerates, ascending. The last [`NUM_FX3_RATES`] need an FX3.
pub static SAMPLERATES: [u64; 17] = [
    khz(200),
    khz(250),
    khz(500),
    mhz(1),
    mhz(2),
    mhz(3),
    mhz(4),
    mhz(6),
    mhz(8),
    mhz(12),
    mhz(16),
    mhz(24),
    mhz(32),
    mhz(48),
    mhz(64),
    mhz(96),
    mhz(192),
];

pub const NUM_FX3_RATES: usize = 5;

/// Whether any profile could describe a device with these IDs.
pub fn is_plausible(profiles: &[DeviceProfile], vid: u16, pid: u16) -> bool {
    profiles.iter().any(|p| p.is_plausible(vid, pid))
}

/// First profile, in declaration order, that matches the device.
pub fn find_profile<'a>(
    profiles: &'a [DeviceProfile],
    vid: u16,
    pid: u16,
    strings: &UsbStrings,
) -> Option<&'a DeviceProfile> {
    profiles.iter().find(|p| p.matches(vid, pid, strings))
}

/// Whether the device already runs the analyzer firmware.
pub fn has_firmware(strings: &UsbStrings) -> bool {
    strings.manufacturer == FIRMWARE_MANUFACTURER && strings.product == FIRMWARE_PRODUCT
}

#[cfg(test)]
mod tests {
    use super::*;

    const STRICT: DeviceProfile = DeviceProfile {
        vendor_id: 0x1D50,
        product_id: 0x608C,
        vendor: "Strict",
        model: "A",
        model_version: Some("rev2"),
        firmware: "a.fw",
        dev_caps: DevCaps::BITS_16,
        usb_manufacturer: Some("Acme"),
        usb_product: Some("Probe"),
    };

    const LOOSE: DeviceProfile = DeviceProfile {
        vendor: "Loose",
        model: "B",
        model_version: None,
        firmware: "b.fw",
        usb_manufacturer: None,
        usb_product: None,
        ..STRICT
    };

    #[test]
    fn test_first_match_wins() {
        let profiles = [STRICT, LOOSE];
        let acme = UsbStrings::new("Acme", "Probe", "");
        let other = UsbStrings::new("Other", "Probe", "");

        assert_eq!(find_profile(&profiles, 0x1D50, 0x608C, &acme).unwrap().vendor, "Strict");
        assert_eq!(find_profile(&profiles, 0x1D50, 0x608C, &other).unwrap().vendor, "Loose");
        assert!(find_profile(&profiles, 0x1D50, 0x608D, &acme).is_none());
        assert!(find_profile(&[STRICT], 0x1D50, 0x608C, &other).is_none());
    }

    #[test]
    fn test_fx3_profile() {
        let fx3 = &SUPPORTED_PROFILES[0];
        assert!(fx3.is_fx3());
        assert!(!fx3.needs_reset());
        assert_eq!(fx3.image_format(), ImageFormat::Segmented);
        assert_eq!(fx3.samplerates().len(), 17);
        assert_eq!(*fx3.samplerates().last().unwrap(), mhz(192));
        assert_eq!(fx3.num_logic_channels(), 32);
        assert_eq!(fx3.num_analog_channels(), 0);
    }

    #[test]
    fn test_only_fx3_shipped() {
        assert_eq!(SUPPORTED_PROFILES.len(), 1);
        assert!(!is_plausible(SUPPORTED_PROFILES, CYPRESS_VENDOR_ID, 0x8613));
    }

    #[test]
    fn test_fx2_profile() {
        let fx2 = &TEST_FX2_PROFILE;
        assert!(fx2.needs_reset());
        assert_eq!(fx2.image_format(), ImageFormat::Simple);
        assert_eq!(fx2.samplerates().len(), 12);
        assert_eq!(*fx2.samplerates().last().unwrap(), mhz(24));
        assert_eq!(fx2.num_logic_channels(), 16);
    }

    #[test]
    fn test_has_firmware() {
        assert!(has_firmware(&UsbStrings::new("sigrok", "fx3lafw", "")));
        assert!(!has_firmware(&UsbStrings::new("Cypress", "fx3lafw", "")));
        assert!(!has_firmware(&UsbStrings::default()));
    }

    #[test]
    fn test_caps() {
        let caps = DevCaps::BITS_24 | DevCaps::AX_ANALOG;
        assert!(caps.contains(DevCaps::AX_ANALOG));
        assert!(!caps.contains(DevCaps::FX3));
        assert_eq!(caps.bits(), 0b10100);
    }
}
