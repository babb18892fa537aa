//! Intel HEX firmware images.
//!
//! Each record is one text line:
//!
//! ```text
//! :llaaaatt<data...>cc
//!  |  |   |          |
//!  |  |   |          +-- checksum: two's complement of the byte sum
//!  |  |   +------------- record type
//!  |  +----------------- 16-bit load address
//!  +-------------------- data byte count
//! ```
//!
//! The loader understands record types 00 (data), 01 (end of file),
//! 02 (extended segment address) and 04 (extended linear address); the
//! start-address types 03 and 05 are accepted and ignored. Data records at
//! consecutive addresses merge into one [`Section`].

use std::fs;
use std::path::Path;

use log::debug;

use crate::error::{Error, Result};

/// One contiguous span of image data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    /// Absolute start address of the span.
    pub start: u32,
    /// Image bytes, in address order.
    pub data: Vec<u8>,
}

/// A parsed Intel HEX file.
#[derive(Debug, Clone, Default)]
pub struct HexFile {
    /// Contiguous data sections, in file order.
    pub sections: Vec<Section>,
}

impl HexFile {
    /// Load and parse a HEX file from disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| Error::InvalidImage(format!("{}: {e}", path.display())))?;
        let file = Self::parse(&text)?;
        debug!("loaded {}: {} section(s)", path.display(), file.sections.len());
        Ok(file)
    }

    /// Parse HEX records from text.
    pub fn parse(text: &str) -> Result<Self> {
        let mut sections: Vec<Section> = Vec::new();
        // upper address bits supplied by type 02/04 records
        let mut upper: u32 = 0;
        let mut eof = false;

        for (index, line) in text.lines().enumerate() {
            let lineno = index + 1;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if eof {
                return Err(Error::InvalidImage(format!(
                    "line {lineno}: data after end-of-file record"
                )));
            }

            let record = Record::parse(line, lineno)?;
            match record.kind {
                0x00 => {
                    let address = upper.wrapping_add(u32::from(record.address));
                    append(&mut sections, address, &record.data);
                }
                0x01 => eof = true,
                0x02 => upper = u32::from(address_field(&record, lineno)?) << 4,
                0x04 => upper = u32::from(address_field(&record, lineno)?) << 16,
                // start-address records carry no flashable data
                0x03 | 0x05 => {}
                other => {
                    return Err(Error::InvalidImage(format!(
                        "line {lineno}: unknown record type {other:#04x}"
                    )));
                }
            }
        }

        if !eof {
            return Err(Error::InvalidImage("missing end-of-file record".into()));
        }
        Ok(Self { sections })
    }
}

struct Record {
    kind: u8,
    address: u16,
    data: Vec<u8>,
}

impl Record {
    fn parse(line: &str, lineno: usize) -> Result<Self> {
        let body = line.strip_prefix(':').ok_or_else(|| {
            Error::InvalidImage(format!("line {lineno}: record must start with ':'"))
        })?;
        if body.len() % 2 != 0 {
            return Err(Error::InvalidImage(format!(
                "line {lineno}: odd number of hex digits"
            )));
        }

        let bytes = (0..body.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&body[i..i + 2], 16))
            .collect::<std::result::Result<Vec<u8>, _>>()
            .map_err(|_| Error::InvalidImage(format!("line {lineno}: invalid hex digit")))?;

        if bytes.len() < 5 {
            return Err(Error::InvalidImage(format!(
                "line {lineno}: record too short"
            )));
        }
        let len = usize::from(bytes[0]);
        if bytes.len() != len + 5 {
            return Err(Error::InvalidImage(format!(
                "line {lineno}: length field says {len} data bytes, record carries {}",
                bytes.len() - 5
            )));
        }

        let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
        if sum != 0 {
            return Err(Error::InvalidImage(format!(
                "line {lineno}: bad record checksum"
            )));
        }

        Ok(Self {
            kind: bytes[3],
            address: u16::from(bytes[1]) << 8 | u16::from(bytes[2]),
            data: bytes[4..4 + len].to_vec(),
        })
    }
}

fn address_field(record: &Record, lineno: usize) -> Result<u16> {
    if record.data.len() != 2 {
        return Err(Error::InvalidImage(format!(
            "line {lineno}: address record must carry 2 bytes"
        )));
    }
    Ok(u16::from(record.data[0]) << 8 | u16::from(record.data[1]))
}

#[allow(clippy::cast_possible_truncation)] // firmware sections stay far below 4 GiB
fn append(sections: &mut Vec<Section>, address: u32, data: &[u8]) {
    if data.is_empty() {
        return;
    }
    if let Some(last) = sections.last_mut() {
        if last.start.wrapping_add(last.data.len() as u32) == address {
            last.data.extend_from_slice(data);
            return;
        }
    }
    sections.push(Section {
        start: address,
        data: data.to_vec(),
    });
}
