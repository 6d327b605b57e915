//! Firmware image handling.
//!
//! Provides resource lookup plus validation and segmentation of FX2/FX3
//! firmware images.

pub mod loader;
pub mod parser;

pub use loader::{FirmwareDirs, FirmwareLoader, MemoryLoader};
pub use parser::{FirmwareSegment, ImageFormat, ImageSummary, SegmentIter, inspect, segments};
