//! # bootlink
//!
//! Host-side firmware update engine for message-framed serial bootloaders.
//!
//! The device end of the link speaks a small command protocol: every message
//! travels as a COBS/R byte-stuffed, CRC-16-protected frame ending in a zero
//! terminator, and the bootloader answers each command with a uniform
//! response frame. This crate provides:
//!
//! - the frame codec and the checksum engines shared with the device
//!   firmware
//! - the bootloader command set (enter, erase, write, verify, exit)
//! - a response correlator over a serial [`Port`](port::Port)
//! - the update orchestrator: sector erase, pipelined programming with a
//!   bounded acknowledgment window, end-to-end CRC-32 verification and a
//!   deferred vector-table write
//! - an Intel HEX image loader
//!
//! ## Example
//!
//! ```rust,no_run
//! use bootlink::{HexFile, NativePort, NullSink, SerialConfig, Updater};
//!
//! fn main() -> bootlink::Result<()> {
//!     let image = HexFile::from_file("firmware.hex")?;
//!     let port = NativePort::open(&SerialConfig::new("/dev/ttyUSB0", 115_200))?;
//!
//!     let mut updater = Updater::new(port);
//!     let outcome = updater.update(&image.sections[0], &mut NullSink)?;
//!     println!("update finished: {outcome:?}");
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `native` (default): serial port support via the `serialport` crate.
//!   Disable it to use the protocol engine against a custom
//!   [`Port`](port::Port) implementation only.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod image;
pub mod link;
pub mod port;
pub mod protocol;
pub mod updater;

// Re-exports for convenience
// Native-specific re-exports
#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator};
pub use {
    error::{Error, Result},
    image::{HexFile, Section},
    link::MessageLink,
    port::{Port, PortEnumerator, PortInfo, SerialConfig},
    protocol::command::{FlashStatus, Response},
    protocol::frame::{Frame, FrameError, MAX_PAYLOAD},
    updater::{NullSink, ProgressSink, UpdateConfig, UpdateOutcome, UpdatePhase, Updater},
};
