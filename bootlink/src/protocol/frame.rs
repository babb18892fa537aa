//! Message framing shared with the device firmware.
//!
//! A frame travels as `COBS/R(crc ++ id ++ payload)` followed by a single
//! zero terminator:
//!
//! ```text
//! +-------+-------+-----------------+           +---------------+------+
//! | CRC16 |  ID   |     payload     | --COBS/R->| stuffed body  | 0x00 |
//! +-------+-------+-----------------+           +---------------+------+
//! | 2 LE  | 2 LE  |  0..=244 bytes  |
//! +-------+-------+-----------------+
//! ```
//!
//! The CRC-16 covers the id and payload only. The stuffing removes every
//! zero byte from the body, so the stream is self-synchronizing: a receiver
//! that joins mid-stream regains frame alignment by scanning to the next
//! terminator.
//!
//! The codec is pure and stateless; it performs no I/O.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use thiserror::Error;

use crate::protocol::crc::crc16;

/// Maximum payload length carried by a single frame.
pub const MAX_PAYLOAD: usize = 244;

/// End-of-frame marker. Never appears inside a stuffed body.
pub const TERMINATOR: u8 = 0x00;

/// Unstuffed header length: CRC (2) + id (2).
const HEADER_LEN: usize = 4;

/// Errors produced by the frame codec.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Payload exceeds [`MAX_PAYLOAD`].
    #[error("payload length {0} exceeds maximum of {MAX_PAYLOAD}")]
    PayloadTooLong(usize),

    /// Recomputed checksum does not match the one carried by the frame.
    #[error("frame checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    Checksum {
        /// Checksum recomputed over the recovered id and payload.
        expected: u16,
        /// Checksum carried by the frame.
        actual: u16,
    },

    /// Too few bytes to hold a checksum and an id.
    #[error("frame too short: {0} bytes after unstuffing")]
    Truncated(usize),

    /// A zero byte appeared inside a stuffed body.
    #[error("unexpected terminator byte inside frame body")]
    ZeroInBody,
}

/// One complete protocol message as exchanged over the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Message id selecting the command or report type.
    pub id: u16,
    /// Command-specific payload.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a frame, rejecting oversize payloads.
    pub fn new(id: u16, payload: impl Into<Vec<u8>>) -> Result<Self, FrameError> {
        let payload = payload.into();
        if payload.len() > MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLong(payload.len()));
        }
        Ok(Self { id, payload })
    }

    /// Encode into a self-delimiting byte stream ending in [`TERMINATOR`].
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn encode(&self) -> Vec<u8> {
        let mut protected = Vec::with_capacity(2 + self.payload.len());
        protected.write_u16::<LittleEndian>(self.id).unwrap();
        protected.extend_from_slice(&self.payload);

        let mut body = Vec::with_capacity(2 + protected.len());
        body.write_u16::<LittleEndian>(crc16(&protected)).unwrap();
        body.extend_from_slice(&protected);

        let mut stream = cobsr_encode(&body);
        stream.push(TERMINATOR);
        stream
    }

    /// Decode a stream produced by [`Frame::encode`].
    ///
    /// The stream is accepted with or without its trailing terminator, so a
    /// full encoded frame and a terminator-split body decode identically.
    pub fn decode(stream: &[u8]) -> Result<Self, FrameError> {
        let stuffed = match stream.split_last() {
            Some((&TERMINATOR, rest)) => rest,
            _ => stream,
        };
        let body = cobsr_decode(stuffed)?;
        if body.len() < HEADER_LEN {
            return Err(FrameError::Truncated(body.len()));
        }
        if body.len() > HEADER_LEN + MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLong(body.len() - HEADER_LEN));
        }

        let actual = LittleEndian::read_u16(&body[0..2]);
        let expected = crc16(&body[2..]);
        if expected != actual {
            return Err(FrameError::Checksum { expected, actual });
        }

        Ok(Self {
            id: LittleEndian::read_u16(&body[2..4]),
            payload: body[HEADER_LEN..].to_vec(),
        })
    }
}

/// COBS/R-stuff `src`. The output contains no zero bytes.
fn cobsr_encode(src: &[u8]) -> Vec<u8> {
    let mut dst = Vec::with_capacity(src.len() + src.len() / 254 + 2);
    let mut code_idx = 0;
    dst.push(0);
    let mut code: u8 = 1;
    let mut last: u8 = 0;

    for &byte in src {
        if byte == 0 {
            dst[code_idx] = code;
            code_idx = dst.len();
            dst.push(0);
            code = 1;
        } else {
            dst.push(byte);
            last = byte;
            code += 1;
            if code == 0xFF {
                dst[code_idx] = code;
                code_idx = dst.len();
                dst.push(0);
                code = 1;
            }
        }
    }

    // COBS/R reduction: a final data byte at least as large as the pending
    // group code can stand in for the code itself, saving one byte.
    if code > 1 && last >= code {
        dst.pop();
        dst[code_idx] = last;
    } else {
        dst[code_idx] = code;
    }
    dst
}

/// Reverse [`cobsr_encode`]. Zero bytes cannot occur in a stuffed body and
/// are rejected.
fn cobsr_decode(src: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut dst = Vec::with_capacity(src.len());
    let mut i = 0;
    while i < src.len() {
        let code = src[i];
        if code == 0 {
            return Err(FrameError::ZeroInBody);
        }
        i += 1;

        let group = usize::from(code) - 1;
        let remaining = src.len() - i;
        if group > remaining {
            // COBS/R reduction: the code byte is itself the final data byte.
            for &byte in &src[i..] {
                if byte == 0 {
                    return Err(FrameError::ZeroInBody);
                }
                dst.push(byte);
            }
            dst.push(code);
            return Ok(dst);
        }

        for &byte in &src[i..i + group] {
            if byte == 0 {
                return Err(FrameError::ZeroInBody);
            }
            dst.push(byte);
        }
        i += group;

        if i < src.len() && code != 0xFF {
            dst.push(0);
        }
    }
    Ok(dst)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(id: u16, payload: &[u8]) {
        let frame = Frame::new(id, payload.to_vec()).unwrap();
        let encoded = frame.encode();
        assert_eq!(Frame::decode(&encoded).unwrap(), frame, "payload {payload:02x?}");
    }

    #[test]
    fn roundtrip_simple() {
        roundtrip(0x00B0, &[0x01, 0x02, 0x03]);
    }

    #[test]
    fn roundtrip_empty_payload() {
        roundtrip(0x00B1, &[]);
    }

    #[test]
    fn roundtrip_all_byte_values() {
        let payload: Vec<u8> = (0..=243).collect();
        roundtrip(0x0021, &payload);
    }

    #[test]
    fn roundtrip_terminator_heavy_payload() {
        roundtrip(0x00B3, &[TERMINATOR; 64]);
    }

    #[test]
    fn roundtrip_max_payload() {
        roundtrip(0x00B3, &[0xAB; MAX_PAYLOAD]);
    }

    #[test]
    fn roundtrip_with_reduction_tail() {
        // last payload byte is large enough to trigger the COBS/R reduction
        roundtrip(0x00B5, b"ABCDEFG");
    }

    #[test]
    fn oversize_payload_rejected() {
        assert_eq!(
            Frame::new(0x00B3, vec![0u8; MAX_PAYLOAD + 1]),
            Err(FrameError::PayloadTooLong(MAX_PAYLOAD + 1))
        );
    }

    #[test]
    fn terminator_appears_only_at_the_end() {
        let payloads: [&[u8]; 4] = [
            &[],
            &[0x00, 0x00, 0x00, 0x00],
            &[0xFF; 100],
            &[0x00, 0x41, 0x00, 0x42],
        ];
        for payload in payloads {
            let encoded = Frame::new(0x00B3, payload.to_vec()).unwrap().encode();
            let (last, head) = encoded.split_last().unwrap();
            assert_eq!(*last, TERMINATOR);
            assert!(
                head.iter().all(|&b| b != TERMINATOR),
                "stray terminator for payload {payload:02x?}"
            );
        }
    }

    #[test]
    fn decode_without_trailing_terminator() {
        let frame = Frame::new(0x00B4, vec![0x10, 0x20]).unwrap();
        let encoded = frame.encode();
        assert_eq!(Frame::decode(&encoded[..encoded.len() - 1]).unwrap(), frame);
    }

    #[test]
    fn single_bit_flips_are_rejected() {
        // last payload byte 0x01 keeps the final group in plain COBS form
        let frame = Frame::new(0x1234, vec![0x42, 0x6F, 0x6F, 0x74, 0x01]).unwrap();
        let encoded = frame.encode();
        for bit in 0..encoded.len() * 8 {
            let mut mutated = encoded.clone();
            mutated[bit / 8] ^= 1 << (bit % 8);
            assert!(
                Frame::decode(&mutated).is_err(),
                "flip of bit {bit} went undetected"
            );
        }
    }

    #[test]
    fn corrupted_payload_reports_checksum_mismatch() {
        let frame = Frame::new(0x00B3, vec![0x11, 0x22, 0x33, 0x01]).unwrap();
        let mut encoded = frame.encode();
        let n = encoded.len();
        // the final payload byte sits just before the terminator
        encoded[n - 2] ^= 0x02;
        assert!(matches!(
            Frame::decode(&encoded),
            Err(FrameError::Checksum { .. })
        ));
    }

    #[test]
    fn interior_zero_rejected() {
        assert_eq!(
            Frame::decode(&[0x02, 0x00, 0x00]),
            Err(FrameError::ZeroInBody)
        );
    }

    #[test]
    fn short_frames_rejected() {
        assert_eq!(Frame::decode(&[0x01, 0x00]), Err(FrameError::Truncated(0)));
        assert_eq!(
            Frame::decode(&[0x03, 0x10, 0x20, 0x00]),
            Err(FrameError::Truncated(2))
        );
    }

    #[test]
    fn cobsr_vectors() {
        assert_eq!(cobsr_encode(&[]), vec![0x01]);
        assert_eq!(cobsr_encode(&[0x00]), vec![0x01, 0x01]);
        assert_eq!(cobsr_encode(&[0x01]), vec![0x02, 0x01]);
        // reduction: 0x41 >= group code 0x02
        assert_eq!(cobsr_encode(&[0x41]), vec![0x41]);
        assert_eq!(cobsr_encode(&[0x05, 0x41]), vec![0x41, 0x05]);
        assert_eq!(cobsr_encode(&[0x05, 0x00]), vec![0x02, 0x05, 0x01]);

        for src in [
            vec![],
            vec![0x00],
            vec![0x41],
            vec![0x05, 0x41],
            vec![0x00, 0x00, 0x01, 0x02],
            (1..=255u8).cycle().take(300).collect::<Vec<u8>>(),
            vec![0xFF; 254],
            vec![0xFE; 255],
        ] {
            let decoded = cobsr_decode(&cobsr_encode(&src)).unwrap();
            assert_eq!(decoded, src, "COBS/R roundtrip failed for {src:02x?}");
        }
    }
}
