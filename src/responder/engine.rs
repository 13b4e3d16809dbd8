use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Instant;

use log::{debug, info, trace, warn};

use super::{Direction, Frame, RegisterDevice};
use crate::error::Error;
use crate::line::Line;
use crate::timing::Timing;

/// Outcome of listening for a byte where the controller may also end or
/// restart the transaction.
enum Received {
    Byte(u8),
    Stop,
    Restart,
}

/// The clocked responder engine.
///
/// The responder never drives the clock; every primitive here is paced by
/// bounded waits on the observed clock level. A timeout anywhere is a soft
/// error: the data line is released, the transaction is abandoned and the
/// engine returns to `Idle`. Above the consecutive-failure threshold the
/// engine additionally sits out an extended idle pause so a confused
/// controller can finish flailing.
pub struct Responder<L: Line, D: RegisterDevice> {
    sda: L,
    scl: L,
    timing: Timing,
    address: u8,
    max_failures: u32,
    device: D,
    pointer: u8,
    pointer_loaded: bool,
    direction: Direction,
    failures: u32,
}

impl<L: Line, D: RegisterDevice> Responder<L, D> {
    pub fn new(sda: L, scl: L, timing: Timing, address: u8, max_failures: u32, device: D) -> Self {
        Responder {
            sda,
            scl,
            timing,
            address,
            max_failures,
            device,
            pointer: 0,
            pointer_loaded: false,
            direction: Direction::Write,
            failures: 0,
        }
    }

    /// Runs the engine until `running` clears. Transaction-level faults are
    /// absorbed here; only line setup/teardown failures escape.
    pub fn run(&mut self, running: &AtomicBool) -> Result<(), Error> {
        self.sda.release()?;
        self.scl.release()?;
        info!("responder listening at address 0x{:02x}", self.address);

        let mut frame = Frame::Idle;
        while running.load(Ordering::Relaxed) {
            match self.step(frame, running) {
                Ok(next) => {
                    if next == Frame::Idle && frame != Frame::Idle {
                        trace!("transaction finished in {:?}", frame);
                        self.failures = 0;
                    }
                    frame = next;
                }
                Err(e) => {
                    warn!("bus fault in {:?}: {}", frame, e);
                    let _ = self.sda.release();
                    self.failures += 1;
                    if self.failures >= self.max_failures {
                        debug!(
                            "{} consecutive faults, pausing {:?}",
                            self.failures,
                            self.timing.fault_pause()
                        );
                        thread::sleep(self.timing.fault_pause());
                        self.failures = 0;
                    }
                    frame = Frame::Idle;
                }
            }
        }

        self.sda.release()?;
        self.scl.release()?;
        Ok(())
    }

    fn step(&mut self, frame: Frame, running: &AtomicBool) -> Result<Frame, Error> {
        Ok(match frame {
            Frame::Idle => {
                if self.poll_for_start(running)? {
                    self.pointer_loaded = false;
                    Frame::Addr
                } else {
                    Frame::Idle
                }
            }
            Frame::Addr => {
                let byte = self.recv_bits()?;
                if byte >> 1 == self.address {
                    self.direction = Direction::from_address_byte(byte);
                    debug!("address match, {} transfer", self.direction);
                    Frame::AddrAck
                } else {
                    trace!("address 0x{:02x} is not ours", byte >> 1);
                    Frame::Idle
                }
            }
            Frame::AddrAck => {
                self.send_ack()?;
                match self.direction {
                    Direction::Write if self.pointer_loaded => Frame::DataIn,
                    Direction::Write => Frame::Reg,
                    Direction::Read => Frame::DataOut,
                }
            }
            Frame::Reg => match self.recv_byte_or_control()? {
                Received::Byte(byte) => {
                    self.pointer = byte;
                    self.pointer_loaded = true;
                    trace!("pointer set to 0x{:02x}", byte);
                    Frame::RegAck
                }
                Received::Stop => Frame::Idle,
                Received::Restart => Frame::Addr,
            },
            Frame::RegAck => {
                self.send_ack()?;
                Frame::DataIn
            }
            Frame::DataIn => match self.recv_byte_or_control()? {
                Received::Byte(byte) => {
                    self.device.write_register(self.pointer, byte);
                    trace!("wrote 0x{:02x} to register 0x{:02x}", byte, self.pointer);
                    self.pointer = self.pointer.wrapping_add(1);
                    Frame::DataInAck
                }
                Received::Stop => Frame::Idle,
                Received::Restart => Frame::Addr,
            },
            Frame::DataInAck => {
                self.send_ack()?;
                Frame::DataIn
            }
            Frame::DataOut => {
                let value = self.device.read_register(self.pointer);
                self.send_bits(value)?;
                trace!("sent register 0x{:02x} = 0x{:02x}", self.pointer, value);
                self.pointer = self.pointer.wrapping_add(1);
                Frame::DataOutAck
            }
            Frame::DataOutAck => {
                self.wait_clock(true)?;
                let acked = !self.sda.is_high()?;
                self.wait_clock(false)?;
                if acked {
                    Frame::DataOut
                } else {
                    // A nack is the controller's normal end-of-read signal.
                    Frame::Idle
                }
            }
        })
    }

    /// Idle poll: confirm an idle bus, then watch for the data line falling
    /// while the clock is high. Ticks the device on every pass. Returns
    /// false when `running` cleared instead.
    fn poll_for_start(&mut self, running: &AtomicBool) -> Result<bool, Error> {
        let mut idle_seen = false;
        let mut last_sda = true;
        while running.load(Ordering::Relaxed) {
            self.device.tick();
            let sda = self.sda.is_high()?;
            let scl = self.scl.is_high()?;
            if sda && scl {
                idle_seen = true;
            }
            if idle_seen && scl && last_sda && !sda {
                trace!("start condition");
                return Ok(true);
            }
            last_sda = sda;
            thread::sleep(self.timing.poll());
        }
        Ok(false)
    }

    /// Bounded wait for the observed clock level.
    fn wait_clock(&self, high: bool) -> Result<(), Error> {
        let deadline = self.timing.wait_deadline();
        loop {
            if self.scl.is_high()? == high {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(if high { "clock high" } else { "clock low" }));
            }
            thread::sleep(self.timing.poll());
        }
    }

    /// Samples eight bits on successive clock-high phases. Used for the
    /// address byte, where STOP cannot legally appear.
    fn recv_bits(&mut self) -> Result<u8, Error> {
        let mut byte = 0u8;
        for _ in 0..8 {
            self.wait_clock(false)?;
            self.wait_clock(true)?;
            byte = (byte << 1) | u8::from(self.sda.is_high()?);
        }
        Ok(byte)
    }

    /// Samples a byte, classifying a data-line transition during the first
    /// clock-high phase as STOP (rising) or repeated START (falling).
    fn recv_byte_or_control(&mut self) -> Result<Received, Error> {
        self.wait_clock(false)?;
        self.wait_clock(true)?;
        let first = self.sda.is_high()?;

        // While the clock stays high only the controller may move the data
        // line, and only to signal STOP or a repeated START.
        let deadline = self.timing.wait_deadline();
        loop {
            if !self.scl.is_high()? {
                break;
            }
            let sda = self.sda.is_high()?;
            if sda != first {
                return Ok(if sda {
                    trace!("stop condition");
                    Received::Stop
                } else {
                    trace!("repeated start");
                    Received::Restart
                });
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout("clock low"));
            }
            thread::sleep(self.timing.poll());
        }

        let mut byte = u8::from(first);
        for _ in 0..7 {
            self.wait_clock(false)?;
            self.wait_clock(true)?;
            byte = (byte << 1) | u8::from(self.sda.is_high()?);
        }
        Ok(Received::Byte(byte))
    }

    /// Drives the acknowledgement slot: assert low across the ninth clock,
    /// release once it falls again.
    fn send_ack(&mut self) -> Result<(), Error> {
        self.wait_clock(false)?;
        self.sda.drive_low()?;
        self.wait_clock(true)?;
        self.wait_clock(false)?;
        self.sda.release()?;
        Ok(())
    }

    /// Shifts a byte out against the controller's clock: each bit is placed
    /// while the clock is low and held across the high phase.
    fn send_bits(&mut self, byte: u8) -> Result<(), Error> {
        for i in (0..8).rev() {
            self.wait_clock(false)?;
            if byte & (1 << i) != 0 {
                self.sda.release()?;
            } else {
                self.sda.drive_low()?;
            }
            self.wait_clock(true)?;
        }
        self.wait_clock(false)?;
        self.sda.release()?;
        Ok(())
    }
}
