//! Bootloader command set.
//!
//! Every boot command is answered by a single uniform [`Response`] frame
//! carrying a status byte and an optional auxiliary payload. What the
//! status means depends on the command: enter/exit report an acceptance
//! flag, erase/write report a flash-controller status, verify carries the
//! device-computed CRC-32 in the auxiliary payload.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::error::Error;
use crate::protocol::frame::{Frame, MAX_PAYLOAD};

/// Message ids understood by the bootloader and its host tool.
pub mod msg_id {
    /// Shell input forwarded from the host to the application firmware.
    pub const SHELL_FROM_PC: u16 = 0x0010;
    /// Enter the bootloader; the payload carries [`super::ENTER_MAGIC`].
    pub const BOOT_ENTER: u16 = 0x00B0;
    /// Leave the bootloader and start the application.
    pub const BOOT_EXIT: u16 = 0x00B1;
    /// Erase one flash sector by index.
    pub const BOOT_ERASE_SECTOR: u16 = 0x00B2;
    /// Program a chunk of data at an absolute address.
    pub const BOOT_WRITE_DATA: u16 = 0x00B3;
    /// Compute a CRC-32 over a programmed range.
    pub const BOOT_VERIFY: u16 = 0x00B4;
    /// Uniform response to any boot command.
    pub const BOOT_RESPONSE: u16 = 0x00B5;
}

/// Magic value the device requires before unlocking bootloader mode.
pub const ENTER_MAGIC: u32 = 0xB00710AD;

/// Data bytes carried by a single write command; 4 bytes of [`MAX_PAYLOAD`]
/// are reserved for the address field.
pub const WRITE_CHUNK: usize = MAX_PAYLOAD - 4;

/// Status byte signalling acceptance of an enter/exit command.
pub const STATUS_ACCEPTED: u8 = 1;

// All builders stay within MAX_PAYLOAD, so Frame::new cannot fail.
#[allow(clippy::unwrap_used)]
fn frame(id: u16, payload: Vec<u8>) -> Frame {
    Frame::new(id, payload).unwrap()
}

/// Build an enter-bootloader command.
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
pub fn enter(magic: u32) -> Frame {
    let mut payload = Vec::with_capacity(4);
    payload.write_u32::<LittleEndian>(magic).unwrap();
    frame(msg_id::BOOT_ENTER, payload)
}

/// Build an exit-bootloader command.
pub fn exit() -> Frame {
    frame(msg_id::BOOT_EXIT, Vec::new())
}

/// Build a sector-erase command.
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
pub fn erase_sector(sector: u32) -> Frame {
    let mut payload = Vec::with_capacity(4);
    payload.write_u32::<LittleEndian>(sector).unwrap();
    frame(msg_id::BOOT_ERASE_SECTOR, payload)
}

/// Build a write-data command for up to [`WRITE_CHUNK`] bytes.
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
pub fn write_data(address: u32, data: &[u8]) -> Frame {
    assert!(data.len() <= WRITE_CHUNK, "write chunk exceeds {WRITE_CHUNK} bytes");
    let mut payload = Vec::with_capacity(4 + data.len());
    payload.write_u32::<LittleEndian>(address).unwrap();
    payload.extend_from_slice(data);
    frame(msg_id::BOOT_WRITE_DATA, payload)
}

/// Build a verify command over `length` bytes starting at `address`.
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
pub fn verify(address: u32, length: u32) -> Frame {
    let mut payload = Vec::with_capacity(8);
    payload.write_u32::<LittleEndian>(address).unwrap();
    payload.write_u32::<LittleEndian>(length).unwrap();
    frame(msg_id::BOOT_VERIFY, payload)
}

/// Build a shell message asking a running application to reset.
///
/// Ctrl-C cancels any pending shell input, then `reset` reboots the device
/// into its bootloader, where the enter command can reach it.
pub fn shell_reset() -> Frame {
    frame(msg_id::SHELL_FROM_PC, b"\x03\nreset\n".to_vec())
}

/// Decoded response to a boot command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Raw status byte.
    pub status: u8,
    /// Command-specific auxiliary payload.
    pub aux: Vec<u8>,
}

impl Response {
    /// Parse a [`msg_id::BOOT_RESPONSE`] frame.
    pub fn from_frame(frame: &Frame) -> Result<Self, Error> {
        if frame.id != msg_id::BOOT_RESPONSE {
            return Err(Error::Protocol(format!(
                "expected boot response, got message id {:#06x}",
                frame.id
            )));
        }
        let (&status, aux) = frame
            .payload
            .split_first()
            .ok_or_else(|| Error::Protocol("empty boot response".into()))?;
        Ok(Self {
            status,
            aux: aux.to_vec(),
        })
    }

    /// Whether an enter/exit request was accepted.
    pub fn accepted(&self) -> bool {
        self.status == STATUS_ACCEPTED
    }

    /// Flash-controller status reported for erase/write commands.
    pub fn flash_status(&self) -> FlashStatus {
        FlashStatus::from(self.status)
    }

    /// Device-computed CRC-32 carried by a verify response.
    pub fn crc32(&self) -> Option<u32> {
        (self.aux.len() >= 4).then(|| LittleEndian::read_u32(&self.aux[..4]))
    }
}

/// Flash-controller status codes reported for erase and write operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashStatus {
    /// Controller still busy.
    Busy,
    /// Read error.
    ReadError,
    /// Programming sequence error.
    ProgrammingSequenceError,
    /// Programming parallelism error.
    ProgrammingParallelismError,
    /// Programming alignment error.
    ProgrammingAlignmentError,
    /// Write protection error.
    WriteProtectionError,
    /// Programming error.
    ProgrammingError,
    /// Operation error.
    OperationError,
    /// Operation finished successfully.
    Complete,
    /// Code not known to this tool; displays as its raw value.
    Other(u8),
}

impl From<u8> for FlashStatus {
    fn from(code: u8) -> Self {
        match code {
            1 => Self::Busy,
            2 => Self::ReadError,
            3 => Self::ProgrammingSequenceError,
            4 => Self::ProgrammingParallelismError,
            5 => Self::ProgrammingAlignmentError,
            6 => Self::WriteProtectionError,
            7 => Self::ProgrammingError,
            8 => Self::OperationError,
            9 => Self::Complete,
            other => Self::Other(other),
        }
    }
}

impl fmt::Display for FlashStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy => write!(f, "FLASH_BUSY"),
            Self::ReadError => write!(f, "FLASH_ERROR_RD"),
            Self::ProgrammingSequenceError => write!(f, "FLASH_ERROR_PGS"),
            Self::ProgrammingParallelismError => write!(f, "FLASH_ERROR_PGP"),
            Self::ProgrammingAlignmentError => write!(f, "FLASH_ERROR_PGA"),
            Self::WriteProtectionError => write!(f, "FLASH_ERROR_WRP"),
            Self::ProgrammingError => write!(f, "FLASH_ERROR_PROGRAM"),
            Self::OperationError => write!(f, "FLASH_ERROR_OPERATION"),
            Self::Complete => write!(f, "FLASH_COMPLETE"),
            Self::Other(code) => write!(f, "{code}"),
        }
    }
}
