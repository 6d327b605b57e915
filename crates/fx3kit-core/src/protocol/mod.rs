//! Protocol module - FX2/FX3 boot loader definitions.

pub mod address;
pub mod constants;

pub use address::ChunkAddress;
pub use constants::*;
