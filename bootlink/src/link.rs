//! Frame transport and response correlation.
//!
//! [`MessageLink`] owns the serial port for the duration of a session. The
//! send side encodes whole frames; the receive side accumulates raw bytes,
//! splits them on the frame terminator and queues the decoded frames. The
//! control thread drains that queue explicitly; no callback ever runs
//! concurrently with protocol logic, so session state needs no locking.
//!
//! Frames are assumed delivered in send order without duplication; that is
//! a property of the underlying transport, not of this layer.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::thread;
use std::time::{Duration, Instant};

use log::{trace, warn};

use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::command::{Response, msg_id};
use crate::protocol::frame::{Frame, TERMINATOR};

/// Idle wait between receive-queue drains while a response is pending.
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Non-response frames retained beyond this limit evict the oldest.
const DEFERRED_LIMIT: usize = 256;

/// Framed message channel over a [`Port`], with response correlation.
pub struct MessageLink<P: Port> {
    port: P,
    rx: Vec<u8>,
    inbound: VecDeque<Frame>,
    deferred: VecDeque<Frame>,
    crc_errors: u64,
}

impl<P: Port> MessageLink<P> {
    /// Wrap a port.
    ///
    /// The port's read timeout should be short (tens of milliseconds);
    /// [`crate::updater::Updater`] configures it at the start of a session.
    pub fn new(port: P) -> Self {
        Self {
            port,
            rx: Vec::new(),
            inbound: VecDeque::new(),
            deferred: VecDeque::new(),
            crc_errors: 0,
        }
    }

    /// Access the underlying port.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Consume the link and return the port.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Encode and transmit one frame.
    ///
    /// A leading terminator precedes the frame so a receiver holding a stale
    /// partial frame resynchronizes before this one starts.
    pub fn send(&mut self, frame: &Frame) -> Result<()> {
        let encoded = frame.encode();
        trace!("sending message {:#06x}: {} bytes", frame.id, encoded.len());

        let mut stream = Vec::with_capacity(1 + encoded.len());
        stream.push(TERMINATOR);
        stream.extend_from_slice(&encoded);

        self.port.write_all(&stream)?;
        self.port.flush()?;
        Ok(())
    }

    /// Read whatever the transport has buffered and decode complete frames.
    fn pump(&mut self) -> Result<()> {
        let mut buf = [0u8; 512];
        loop {
            match self.port.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    self.rx.extend_from_slice(&buf[..n]);
                    if n < buf.len() {
                        break;
                    }
                }
                Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                    break;
                }
                Err(e) => return Err(Error::Io(e)),
            }
        }

        while let Some(end) = self.rx.iter().position(|&b| b == TERMINATOR) {
            let stream: Vec<u8> = self.rx.drain(..=end).collect();
            if stream.len() == 1 {
                // bare terminator: the peer resynchronizing
                continue;
            }
            match Frame::decode(&stream) {
                Ok(frame) => {
                    trace!("received message {:#06x}: {} bytes", frame.id, stream.len());
                    self.inbound.push_back(frame);
                }
                Err(err) => {
                    // corrupt frames count as never arrived; the pending
                    // command runs into its timeout instead
                    self.crc_errors += 1;
                    warn!("dropping corrupt frame ({} bytes): {err}", stream.len());
                }
            }
        }
        Ok(())
    }

    /// Pop the next decoded inbound frame, if any.
    pub fn poll(&mut self) -> Result<Option<Frame>> {
        self.pump()?;
        Ok(self.inbound.pop_front())
    }

    /// Wait for the next boot response, deferring unrelated traffic.
    ///
    /// Returns [`Error::Timeout`] if no response arrives within `timeout`;
    /// the caller decides whether the step is retried, this layer never
    /// does.
    pub fn await_response(&mut self, timeout: Duration) -> Result<Response> {
        let deadline = Instant::now() + timeout;
        loop {
            self.pump()?;
            while let Some(frame) = self.inbound.pop_front() {
                if frame.id == msg_id::BOOT_RESPONSE {
                    return Response::from_frame(&frame);
                }
                trace!("deferring message {:#06x} while awaiting response", frame.id);
                self.deferred.push_back(frame);
                if self.deferred.len() > DEFERRED_LIMIT {
                    self.deferred.pop_front();
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "no boot response within {} ms",
                    timeout.as_millis()
                )));
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Pop the oldest frame set aside while waiting for responses.
    pub fn pop_deferred(&mut self) -> Option<Frame> {
        self.deferred.pop_front()
    }

    /// Frames dropped so far because their checksum did not match.
    pub fn crc_error_count(&self) -> u64 {
        self.crc_errors
    }

    /// Drop all buffered input on both sides of the link.
    pub fn clear(&mut self) -> Result<()> {
        self.port.clear_buffers()?;
        self.rx.clear();
        self.inbound.clear();
        Ok(())
    }
}
