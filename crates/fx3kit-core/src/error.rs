//! Error taxonomy for device bring-up.

use thiserror::Error;

use crate::options::ConfigKey;

#[derive(Error, Debug)]
pub enum BringupError {
    #[error("Firmware '{name}' not found in any firmware directory")]
    ResourceNotFound { name: String },

    #[error("Firmware '{name}' is too large: {size} bytes, maximum {max}")]
    ResourceTooLarge { name: String, size: u64, max: usize },

    #[error("Corrupt firmware image: {0}")]
    CorruptImage(String),

    #[error("Firmware image is truncated: {unconsumed} of {len} bytes left unparsed")]
    TruncatedImage { unconsumed: usize, len: usize },

    #[error("Chunk address 0x{base:08X} + 0x{offset:X} exceeds 32 bits")]
    AddressOverflow { base: u32, offset: u64 },

    #[error("Control transfer failed: {0}")]
    TransferFailed(String),

    #[error("Device configuration failed: {0}")]
    ConfigurationFailed(String),

    #[error("Device failed to renumerate within {waited_ms}ms: {last_error}")]
    RenumerationTimeout { waited_ms: u64, last_error: String },

    #[error("Unsupported config key: {0}")]
    UnsupportedConfigKey(ConfigKey),

    #[error("Device address not yet known, renumeration pending")]
    AddressUnknown,

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: ConfigKey, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
