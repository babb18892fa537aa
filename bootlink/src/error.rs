//! Error types for bootlink.

use std::io;

use thiserror::Error;

use crate::protocol::command::FlashStatus;
use crate::protocol::frame::FrameError;

/// Result type for bootlink operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for bootlink operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// A frame failed to encode or decode.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// The firmware image could not be parsed.
    #[error("invalid image: {0}")]
    InvalidImage(String),

    /// No matching response arrived within the deadline.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The device rejected a bootloader-entry request.
    #[error("can't enter bootloader: rejected with code {code}")]
    EnterRejected {
        /// Raw status byte from the response.
        code: u8,
    },

    /// Bootloader entry gave up after the configured attempt budget.
    #[error("can't enter bootloader after {attempts} attempts")]
    EnterFailed {
        /// Number of attempts made.
        attempts: u32,
    },

    /// The device rejected a bootloader-exit request.
    #[error("can't exit bootloader: rejected with code {code}")]
    ExitRejected {
        /// Raw status byte from the response.
        code: u8,
    },

    /// The flash controller reported a failure while erasing.
    #[error("can't erase sector {sector}: {status}")]
    EraseFailed {
        /// Index of the sector that failed to erase.
        sector: u32,
        /// Decoded flash-controller status.
        status: FlashStatus,
    },

    /// The flash controller reported a failure while programming.
    #[error("can't write data at {address:#010x}: {status}")]
    WriteFailed {
        /// Address of the offending write chunk.
        address: u32,
        /// Decoded flash-controller status.
        status: FlashStatus,
    },

    /// Host- and device-computed image checksums differ.
    #[error("image CRC check failed: expected {expected:#010x}, got {actual:#010x}")]
    IntegrityMismatch {
        /// Checksum computed by the host over the in-memory image.
        expected: u32,
        /// Checksum reported by the device.
        actual: u32,
    },

    /// The device answered with a malformed or unexpected response.
    #[error("protocol error: {0}")]
    Protocol(String),
}
