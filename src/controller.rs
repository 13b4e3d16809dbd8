use std::thread;
use std::time::Duration;

use log::{debug, trace, warn};

use crate::error::Error;
use crate::line::Line;
use crate::timing::Timing;

/// Clock pulses issued during bus recovery before giving up on a stuck
/// data line.
const RECOVERY_PULSES: u32 = 9;

/// The clock-generating end of the bus.
///
/// All transfers are framed: START, address byte with the direction bit,
/// data bytes each followed by an acknowledgement clock, STOP. The clock
/// period is split into four quarter-phases of the configured bit period;
/// data moves while the clock is held low and is sampled in the middle of
/// the high phase.
pub struct Controller<L: Line> {
    sda: L,
    scl: L,
    timing: Timing,
    write_read_gap: Duration,
}

impl<L: Line> Controller<L> {
    pub fn new(sda: L, scl: L, timing: Timing, write_read_gap: Duration) -> Self {
        Controller {
            sda,
            scl,
            timing,
            write_read_gap,
        }
    }

    /// Writes `bytes` to `target`. The first nack maps to
    /// [`Error::NoResponse`] (address) or [`Error::Nack`] (data, with the
    /// byte position); either way a STOP is emitted first.
    pub fn write(&mut self, target: u8, bytes: &[u8]) -> Result<(), Error> {
        let result = self.write_frame(target, bytes);
        if result.is_err() {
            self.release_both();
        }
        result
    }

    /// Fills `buffer` from `target`, acking every byte but the last.
    pub fn read(&mut self, target: u8, buffer: &mut [u8]) -> Result<(), Error> {
        let result = self.read_frame(target, buffer);
        if result.is_err() {
            self.release_both();
        }
        result
    }

    /// Selects `register` with a one-byte write, waits the configured
    /// write-to-read gap, then reads `buffer.len()` bytes. The responder
    /// keeps its pointer across the two frames, so no repeated START is
    /// needed.
    pub fn write_then_read(
        &mut self,
        target: u8,
        register: u8,
        buffer: &mut [u8],
    ) -> Result<(), Error> {
        self.write(target, &[register])?;
        thread::sleep(self.write_read_gap);
        self.read(target, buffer)
    }

    /// Reads a single register.
    pub fn read_register(&mut self, target: u8, register: u8) -> Result<u8, Error> {
        let mut buffer = [0u8; 1];
        self.write_then_read(target, register, &mut buffer)?;
        Ok(buffer[0])
    }

    /// Writes a single register.
    pub fn write_register(&mut self, target: u8, register: u8, value: u8) -> Result<(), Error> {
        self.write(target, &[register, value])
    }

    /// Frees a bus left mid-transaction by a confused responder: with data
    /// released, pulse the clock until the responder lets go of the data
    /// line (at most nine pulses), then emit a STOP.
    pub fn bus_recovery(&mut self) -> Result<(), Error> {
        debug!(
            "bus recovery (sda={}, scl={})",
            level_name(self.sda.is_high()?),
            level_name(self.scl.is_high()?)
        );
        self.sda.release()?;
        self.scl.release()?;
        self.timing.quarter_sleep();

        for pulse in 0..RECOVERY_PULSES {
            self.scl.drive_low()?;
            self.timing.quarter_sleep();
            self.scl.release()?;
            self.timing.quarter_sleep();
            if self.sda.is_high()? {
                debug!("data line released after {} recovery pulses", pulse + 1);
                break;
            }
        }
        if !self.sda.is_high()? {
            warn!("data line still low after bus recovery");
        }

        self.stop()?;
        thread::sleep(self.timing.quarter() * 2);
        Ok(())
    }

    fn write_frame(&mut self, target: u8, bytes: &[u8]) -> Result<(), Error> {
        self.start()?;
        if !self.write_byte(target << 1)? {
            self.stop()?;
            return Err(Error::NoResponse);
        }
        for (index, byte) in bytes.iter().enumerate() {
            if !self.write_byte(*byte)? {
                self.stop()?;
                return Err(Error::Nack { index });
            }
        }
        self.stop()?;
        trace!("wrote {} bytes to 0x{:02x}", bytes.len(), target);
        Ok(())
    }

    fn read_frame(&mut self, target: u8, buffer: &mut [u8]) -> Result<(), Error> {
        self.start()?;
        if !self.write_byte((target << 1) | 1)? {
            self.stop()?;
            return Err(Error::NoResponse);
        }
        let last = buffer.len().saturating_sub(1);
        for (index, slot) in buffer.iter_mut().enumerate() {
            *slot = self.read_byte(index < last)?;
        }
        self.stop()?;
        trace!("read {} bytes from 0x{:02x}", buffer.len(), target);
        Ok(())
    }

    /// START: data falls while the clock is high. Works as a repeated START
    /// too, since both lines are first walked back to released.
    fn start(&mut self) -> Result<(), Error> {
        self.sda.release()?;
        self.scl.release()?;
        self.timing.quarter_sleep();
        self.sda.drive_low()?;
        self.timing.quarter_sleep();
        self.scl.drive_low()?;
        self.timing.quarter_sleep();
        Ok(())
    }

    /// STOP: data rises while the clock is high.
    fn stop(&mut self) -> Result<(), Error> {
        self.sda.drive_low()?;
        self.timing.quarter_sleep();
        self.scl.release()?;
        self.timing.quarter_sleep();
        self.sda.release()?;
        self.timing.quarter_sleep();
        Ok(())
    }

    /// Clocks one data bit out. The clock is low on entry and on exit.
    fn emit_bit(&mut self, bit: bool) -> Result<(), Error> {
        if bit {
            self.sda.release()?;
        } else {
            self.sda.drive_low()?;
        }
        self.timing.quarter_sleep();
        self.scl.release()?;
        self.timing.quarter_sleep();
        self.timing.quarter_sleep();
        self.scl.drive_low()?;
        self.timing.quarter_sleep();
        Ok(())
    }

    /// Clocks one bit in, sampling in the middle of the high phase.
    fn sample_bit(&mut self) -> Result<bool, Error> {
        self.sda.release()?;
        self.timing.quarter_sleep();
        self.scl.release()?;
        self.timing.quarter_sleep();
        let bit = self.sda.is_high()?;
        self.timing.quarter_sleep();
        self.scl.drive_low()?;
        self.timing.quarter_sleep();
        Ok(bit)
    }

    /// Sends a byte MSB-first and samples the acknowledgement slot.
    /// Returns true when the byte was acked.
    fn write_byte(&mut self, byte: u8) -> Result<bool, Error> {
        for i in (0..8).rev() {
            self.emit_bit(byte & (1 << i) != 0)?;
        }
        let acked = !self.sample_bit()?;
        trace!("tx 0x{:02x} {}", byte, if acked { "ack" } else { "nack" });
        Ok(acked)
    }

    /// Receives a byte MSB-first, then drives the acknowledgement slot low
    /// (`ack`) or leaves it released (nack).
    fn read_byte(&mut self, ack: bool) -> Result<u8, Error> {
        let mut byte = 0u8;
        for _ in 0..8 {
            byte = (byte << 1) | u8::from(self.sample_bit()?);
        }
        self.emit_bit(!ack)?;
        // Hand the data line back to the responder straight away; it places
        // the next bit as soon as it sees the acknowledgement clock fall.
        self.sda.release()?;
        trace!("rx 0x{:02x} {}", byte, if ack { "ack" } else { "nack" });
        Ok(byte)
    }

    /// Best-effort walk back to an idle bus after a failed transfer.
    fn release_both(&mut self) {
        if self.sda.release().is_err() || self.scl.release().is_err() {
            warn!("could not release bus lines after failed transfer");
        }
    }
}

fn level_name(high: bool) -> &'static str {
    if high {
        "high"
    } else {
        "low"
    }
}
