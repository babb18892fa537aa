//! Firmware update orchestration.
//!
//! [`Updater`] drives the device bootloader through the full update
//! sequence: entry with retry, sector erase, pipelined programming,
//! CRC-32 verification, vector-table finalization and exit.
//!
//! The first [`VECTOR_RESERVED`] bytes of the image are programmed last,
//! only after the rest of the image verifies. If the update is interrupted
//! at any earlier step, the existing bootloader entry in the vector table
//! stays valid and the device still boots into its bootloader instead of a
//! half-programmed application.
//!
//! A single control thread drives the whole sequence; the only suspension
//! points are the response waits inside the link.

use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::error::{Error, Result};
use crate::image::Section;
use crate::link::{MessageLink, POLL_INTERVAL};
use crate::port::Port;
use crate::protocol::command::{self, ENTER_MAGIC, FlashStatus, WRITE_CHUNK};
use crate::protocol::crc::crc32;

/// Bytes at the start of the image deferred until after verification.
pub const VECTOR_RESERVED: usize = 8;

/// Maximum number of unacknowledged write commands in flight.
pub const WRITE_WINDOW: usize = 10;

// progress percentages for the update stages
const PCT_ENTER: u8 = 5;
const PCT_ERASE_BASE: u8 = 10;
const PCT_ERASE_SPAN: u8 = 10;
const PCT_WRITE_BASE: u8 = 20;
const PCT_WRITE_SPAN: u8 = 65;
const PCT_VERIFY: u8 = 85;
const PCT_VECTOR: u8 = 90;
const PCT_EXIT: u8 = 95;
const PCT_DONE: u8 = 100;

/// Phase of the boot protocol state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdatePhase {
    /// No session running.
    #[default]
    Idle,
    /// Retrying the enter-bootloader command.
    EnteringBootloader,
    /// Erasing the target sector range.
    Erasing,
    /// Streaming write commands for the image body.
    Writing,
    /// Comparing host and device image checksums.
    Verifying,
    /// Programming the deferred vector-table bytes.
    WritingVectorTable,
    /// Restarting the application firmware.
    Exiting,
    /// The last update completed successfully.
    Done,
    /// The last update aborted with an error.
    Failed,
}

/// How an update run ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// All steps completed and the application was restarted.
    Done,
    /// The caller requested cancellation at a step boundary.
    Cancelled,
}

/// Receives progress updates and answers cancellation polls.
pub trait ProgressSink {
    /// Report overall completion (0..=100) and a status line.
    fn report(&mut self, percent: u8, status: &str);

    /// Whether the caller wants the update stopped. Polled between
    /// protocol steps, never mid-frame.
    fn cancelled(&self) -> bool {
        false
    }
}

/// Sink that discards progress and never cancels.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn report(&mut self, _percent: u8, _status: &str) {}
}

/// Update parameters.
#[derive(Debug, Clone)]
pub struct UpdateConfig {
    /// Magic value unlocking bootloader mode.
    pub enter_magic: u32,
    /// First flash sector of the application area.
    pub first_sector: u32,
    /// Number of sectors erased before programming.
    pub sector_count: u32,
    /// Entry attempts before giving up (the device may still be rebooting).
    pub max_enter_attempts: u32,
    /// Deadline for ordinary command responses.
    pub response_timeout: Duration,
    /// Deadline for sector-erase responses (erases are slow).
    pub erase_timeout: Duration,
    /// Ask a running application shell to reset before entering.
    pub send_reset_request: bool,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            enter_magic: ENTER_MAGIC,
            first_sector: 4,
            sector_count: 8,
            max_enter_attempts: 100,
            response_timeout: Duration::from_millis(500),
            erase_timeout: Duration::from_secs(2),
            send_reset_request: true,
        }
    }
}

impl UpdateConfig {
    /// Set the erased sector range.
    #[must_use]
    pub fn with_sectors(mut self, first: u32, count: u32) -> Self {
        self.first_sector = first;
        self.sector_count = count;
        self
    }

    /// Set the bootloader-entry attempt budget.
    #[must_use]
    pub fn with_max_enter_attempts(mut self, attempts: u32) -> Self {
        self.max_enter_attempts = attempts;
        self
    }

    /// Set the ordinary response deadline.
    #[must_use]
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Set the sector-erase response deadline.
    #[must_use]
    pub fn with_erase_timeout(mut self, timeout: Duration) -> Self {
        self.erase_timeout = timeout;
        self
    }

    /// Enable or disable the pre-entry shell reset request.
    #[must_use]
    pub fn with_reset_request(mut self, send: bool) -> Self {
        self.send_reset_request = send;
        self
    }
}

/// Outcome of a pipelined write pass.
enum WriteStatus {
    Complete,
    Cancelled,
}

// Run one protocol step, then honor a pending cancellation before
// advancing. Cancellation between steps is an early stop, not a fault.
macro_rules! step {
    ($sink:ident, $call:expr) => {
        $call?;
        if $sink.cancelled() {
            return Ok(UpdateOutcome::Cancelled);
        }
    };
}

/// Host-side driver for one bootloader session.
///
/// Owns the message link (and the port beneath it) for the session's
/// lifetime, so no other traffic can interleave with an update.
pub struct Updater<P: Port> {
    link: MessageLink<P>,
    config: UpdateConfig,
    phase: UpdatePhase,
}

impl<P: Port> Updater<P> {
    /// Create an updater with default parameters.
    pub fn new(port: P) -> Self {
        Self::with_config(port, UpdateConfig::default())
    }

    /// Create an updater with explicit parameters.
    pub fn with_config(port: P, config: UpdateConfig) -> Self {
        Self {
            link: MessageLink::new(port),
            config,
            phase: UpdatePhase::Idle,
        }
    }

    /// Current state machine phase.
    pub fn phase(&self) -> UpdatePhase {
        self.phase
    }

    /// Access the underlying link, e.g. to drain deferred telemetry.
    pub fn link_mut(&mut self) -> &mut MessageLink<P> {
        &mut self.link
    }

    /// Consume the updater and return the port.
    pub fn into_port(self) -> P {
        self.link.into_port()
    }

    /// Run a full update of `section` against the connected device.
    ///
    /// Returns `Ok(UpdateOutcome::Cancelled)` when the sink requests a stop
    /// at a step boundary; that is an early termination, not a fault. Every
    /// error leaves the machine in [`UpdatePhase::Failed`]; the only
    /// supported recovery is re-running the whole update.
    pub fn update(
        &mut self,
        section: &Section,
        sink: &mut dyn ProgressSink,
    ) -> Result<UpdateOutcome> {
        let result = self.run(section, sink);
        self.phase = match &result {
            Ok(UpdateOutcome::Done) => UpdatePhase::Done,
            Ok(UpdateOutcome::Cancelled) => UpdatePhase::Idle,
            Err(_) => UpdatePhase::Failed,
        };
        result
    }

    #[allow(clippy::cast_possible_truncation)] // image sizes stay far below 4 GiB
    fn run(&mut self, section: &Section, sink: &mut dyn ProgressSink) -> Result<UpdateOutcome> {
        if section.data.len() <= VECTOR_RESERVED {
            return Err(Error::InvalidImage(format!(
                "image is {} bytes; need more than the {VECTOR_RESERVED}-byte vector table",
                section.data.len()
            )));
        }
        let start = section.start;
        let data = &section.data;
        let body = &data[VECTOR_RESERVED..];
        let body_start = start + VECTOR_RESERVED as u32;

        self.link.port_mut().set_timeout(POLL_INTERVAL)?;

        info!("updating {} bytes at {start:#010x}", data.len());
        debug!("start {start:#010x}");
        debug!("end   {:#010x}", start + data.len() as u32);

        let t0 = Instant::now();

        self.phase = UpdatePhase::EnteringBootloader;
        step!(sink, self.enter_bootloader(sink));
        let t_enter = Instant::now();

        self.phase = UpdatePhase::Erasing;
        let first = self.config.first_sector;
        let count = self.config.sector_count;
        for (i, sector) in (first..first + count).enumerate() {
            let pct = PCT_ERASE_BASE + (u32::from(PCT_ERASE_SPAN) * i as u32 / count) as u8;
            sink.report(pct, &format!("Erasing sector {sector}"));
            step!(sink, self.erase_sector(sector));
        }
        let t_erase = Instant::now();

        // program everything except the deferred vector-table bytes
        self.phase = UpdatePhase::Writing;
        match self.write_range(body_start, body, sink)? {
            WriteStatus::Cancelled => return Ok(UpdateOutcome::Cancelled),
            WriteStatus::Complete => {}
        }
        let t_write = Instant::now();

        self.phase = UpdatePhase::Verifying;
        sink.report(PCT_VERIFY, "Verifying");
        step!(sink, self.verify_range(body_start, body));
        let t_verify = Instant::now();

        self.phase = UpdatePhase::WritingVectorTable;
        sink.report(PCT_VECTOR, "Writing vector table");
        step!(sink, self.write_single(start, &data[..VECTOR_RESERVED]));

        self.phase = UpdatePhase::Exiting;
        sink.report(PCT_EXIT, "Starting application");
        self.exit_bootloader()?;

        sink.report(PCT_DONE, "Done");

        debug!("  enter:  {} ms", t_enter.duration_since(t0).as_millis());
        debug!("  erase:  {} ms", t_erase.duration_since(t_enter).as_millis());
        debug!("  write:  {} ms", t_write.duration_since(t_erase).as_millis());
        debug!("  verify: {} ms", t_verify.duration_since(t_write).as_millis());
        debug!("  total:  {} ms", t0.elapsed().as_millis());

        Ok(UpdateOutcome::Done)
    }

    /// Entry retry loop. The device may still be rebooting, so timeouts and
    /// rejections both retry until the attempt budget runs out; transport
    /// errors abort immediately.
    fn enter_bootloader(&mut self, sink: &mut dyn ProgressSink) -> Result<()> {
        let attempts = self.config.max_enter_attempts;
        for attempt in 1..=attempts {
            sink.report(PCT_ENTER, &format!("Entering bootloader (attempt {attempt})"));
            match self.try_enter() {
                Ok(()) => {
                    info!("entered bootloader on attempt {attempt}");
                    return Ok(());
                }
                Err(err @ (Error::Timeout(_) | Error::EnterRejected { .. })) => {
                    warn!("entry attempt {attempt}/{attempts} failed: {err}");
                }
                Err(err) => return Err(err),
            }
            if sink.cancelled() {
                // the caller's step boundary turns this into Cancelled
                return Ok(());
            }
        }
        Err(Error::EnterFailed { attempts })
    }

    fn try_enter(&mut self) -> Result<()> {
        if self.config.send_reset_request {
            // ask a running application shell to reboot into the bootloader
            self.link.send(&command::shell_reset())?;
        }
        self.link.send(&command::enter(self.config.enter_magic))?;
        let response = self.link.await_response(self.config.response_timeout)?;
        if !response.accepted() {
            return Err(Error::EnterRejected {
                code: response.status,
            });
        }
        Ok(())
    }

    fn erase_sector(&mut self, sector: u32) -> Result<()> {
        self.link.send(&command::erase_sector(sector))?;
        let response = self.link.await_response(self.config.erase_timeout)?;
        let status = response.flash_status();
        if status != FlashStatus::Complete {
            return Err(Error::EraseFailed { sector, status });
        }
        Ok(())
    }

    /// Stream `data` to the device in [`WRITE_CHUNK`]-sized write commands,
    /// keeping up to [`WRITE_WINDOW`] of them unacknowledged to overlap
    /// transmission with the device's flash-programming latency.
    ///
    /// On cancellation no further chunks are issued; acknowledgments for
    /// chunks already in flight are still drained and validated.
    #[allow(clippy::cast_possible_truncation)] // chunk offsets fit in u32
    fn write_range(
        &mut self,
        address: u32,
        data: &[u8],
        sink: &mut dyn ProgressSink,
    ) -> Result<WriteStatus> {
        let total = data.len();
        let chunks = total.div_ceil(WRITE_CHUNK);
        let window = chunks.min(WRITE_WINDOW);

        let mut sent = 0usize;
        let mut acked = 0usize;
        let mut cancelled = false;

        while acked < sent || (!cancelled && sent < chunks) {
            // send ahead while the window has room and nothing stopped us
            if !cancelled && sent < chunks && sent - acked < window {
                let offset = sent * WRITE_CHUNK;
                let end = (offset + WRITE_CHUNK).min(total);
                let chunk_addr = address + offset as u32;
                self.link
                    .send(&command::write_data(chunk_addr, &data[offset..end]))?;
                sent += 1;
                sink.report(write_pct(end, total), &format!("Writing {chunk_addr:#010x}"));
                if sink.cancelled() {
                    cancelled = true;
                }
                continue;
            }

            // window full, data exhausted or cancelled: take the oldest ack
            let response = self.link.await_response(self.config.response_timeout)?;
            let status = response.flash_status();
            if status != FlashStatus::Complete {
                return Err(Error::WriteFailed {
                    address: address + (acked * WRITE_CHUNK) as u32,
                    status,
                });
            }
            acked += 1;
        }

        Ok(if cancelled {
            WriteStatus::Cancelled
        } else {
            WriteStatus::Complete
        })
    }

    /// One write command with an immediate acknowledgment, used for the
    /// deferred vector-table bytes.
    fn write_single(&mut self, address: u32, data: &[u8]) -> Result<()> {
        self.link.send(&command::write_data(address, data))?;
        let response = self.link.await_response(self.config.response_timeout)?;
        let status = response.flash_status();
        if status != FlashStatus::Complete {
            return Err(Error::WriteFailed { address, status });
        }
        Ok(())
    }

    /// Ask the device for its CRC over the written range and compare it
    /// against the host's.
    #[allow(clippy::cast_possible_truncation)] // image sizes stay far below 4 GiB
    fn verify_range(&mut self, address: u32, data: &[u8]) -> Result<()> {
        let length = data.len() as u32;
        self.link.send(&command::verify(address, length))?;
        let response = self.link.await_response(self.config.response_timeout)?;
        let actual = response
            .crc32()
            .ok_or_else(|| Error::Protocol("verify response carries no checksum".into()))?;
        let expected = crc32(data);
        if actual != expected {
            return Err(Error::IntegrityMismatch { expected, actual });
        }
        debug!("image CRC {expected:#010x} confirmed for {length} bytes at {address:#010x}");
        Ok(())
    }

    fn exit_bootloader(&mut self) -> Result<()> {
        self.link.send(&command::exit())?;
        let response = self.link.await_response(self.config.response_timeout)?;
        if !response.accepted() {
            return Err(Error::ExitRejected {
                code: response.status,
            });
        }
        Ok(())
    }
}

#[allow(clippy::cast_possible_truncation)] // result bounded by PCT_WRITE_SPAN
fn write_pct(written: usize, total: usize) -> u8 {
    PCT_WRITE_BASE + (usize::from(PCT_WRITE_SPAN) * written / total.max(1)) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_match_the_device_protocol() {
        let config = UpdateConfig::default();
        assert_eq!(config.enter_magic, 0xB00710AD);
        assert_eq!(config.first_sector, 4);
        assert_eq!(config.sector_count, 8);
        assert_eq!(config.max_enter_attempts, 100);
        assert_eq!(config.response_timeout, Duration::from_millis(500));
        assert_eq!(config.erase_timeout, Duration::from_secs(2));
        assert!(config.send_reset_request);
    }

    #[test]
    fn config_builders() {
        let config = UpdateConfig::default()
            .with_sectors(0, 4)
            .with_max_enter_attempts(3)
            .with_reset_request(false);
        assert_eq!(config.first_sector, 0);
        assert_eq!(config.sector_count, 4);
        assert_eq!(config.max_enter_attempts, 3);
        assert!(!config.send_reset_request);
    }

    #[test]
    fn write_progress_spans_its_stage() {
        assert_eq!(write_pct(0, 4088), PCT_WRITE_BASE);
        assert_eq!(write_pct(4088, 4088), PCT_WRITE_BASE + PCT_WRITE_SPAN);
        let mid = write_pct(2044, 4088);
        assert!(mid > PCT_WRITE_BASE && mid < PCT_WRITE_BASE + PCT_WRITE_SPAN);
    }
}
