//! Firmware image loading.

pub mod hex;

// Re-export common types
pub use hex::{HexFile, Section};
