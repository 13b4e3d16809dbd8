//! Edge-sampled responder engine.
//!
//! Instead of blocking on clock levels, this variant samples both lines
//! continuously and reacts to edges, the way an interrupt-driven responder
//! would. The engine itself is a pure state machine over successive
//! `(sda, scl)` observations; [`EdgeResponder`] adapts it to physical lines.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use log::{debug, info, trace};

use super::{Direction, Frame, RegisterDevice};
use crate::error::Error;
use crate::line::Line;
use crate::timing::Timing;

/// Frame state machine stepped by line samples.
///
/// Bits shift in on rising clock edges; acknowledge and data-out levels
/// move on falling edges, so the data line is stable whenever the
/// controller samples it. START and STOP are data transitions observed
/// while the clock sits high. The engine reports the drive it wants on the
/// data line through [`sda_driven_low`](EdgeEngine::sda_driven_low); it
/// never touches hardware itself.
pub struct EdgeEngine {
    address: u8,
    state: Frame,
    prev_sda: bool,
    prev_scl: bool,
    idle_seen: bool,
    shift: u8,
    bits: u8,
    direction: Direction,
    pointer: u8,
    pointer_loaded: bool,
    out_byte: u8,
    ack_driven: bool,
    drive_low: bool,
}

impl EdgeEngine {
    pub fn new(address: u8) -> Self {
        EdgeEngine {
            address,
            state: Frame::Idle,
            prev_sda: true,
            prev_scl: true,
            idle_seen: false,
            shift: 0,
            bits: 0,
            direction: Direction::Write,
            pointer: 0,
            pointer_loaded: false,
            out_byte: 0,
            ack_driven: false,
            drive_low: false,
        }
    }

    /// Whether the engine currently wants the data line held low.
    pub fn sda_driven_low(&self) -> bool {
        self.drive_low
    }

    /// Feeds one observation of both lines.
    pub fn step<D: RegisterDevice>(&mut self, sda: bool, scl: bool, device: &mut D) {
        let stable_high = scl && self.prev_scl;
        let started = stable_high && self.prev_sda && !sda;
        let stopped = stable_high && !self.prev_sda && sda;
        let rising = scl && !self.prev_scl;
        let falling = !scl && self.prev_scl;

        if self.state == Frame::Idle && sda && scl {
            self.idle_seen = true;
        }

        if started {
            // A START out of Idle needs a prior idle observation so that
            // attaching to a bus mid-transaction cannot fake one. A
            // repeated START reruns the address without clearing the
            // pointer-loaded flag.
            if self.state == Frame::Idle {
                if self.idle_seen {
                    trace!("start condition");
                    self.pointer_loaded = false;
                    self.enter_addr();
                }
            } else {
                trace!("repeated start");
                self.enter_addr();
            }
        } else if stopped {
            trace!("stop condition");
            self.state = Frame::Idle;
            self.drive_low = false;
            self.ack_driven = false;
        } else if rising {
            self.on_rising(sda, device);
        } else if falling {
            self.on_falling(device);
        }

        self.prev_sda = sda;
        self.prev_scl = scl;
    }

    fn enter_addr(&mut self) {
        self.state = Frame::Addr;
        self.shift = 0;
        self.bits = 0;
        self.ack_driven = false;
        self.drive_low = false;
    }

    fn on_rising<D: RegisterDevice>(&mut self, sda: bool, device: &mut D) {
        match self.state {
            Frame::Addr => {
                self.shift = (self.shift << 1) | u8::from(sda);
                self.bits += 1;
                if self.bits == 8 {
                    if self.shift >> 1 == self.address {
                        self.direction = Direction::from_address_byte(self.shift);
                        debug!("address match, {} transfer", self.direction);
                        self.state = Frame::AddrAck;
                        self.ack_driven = false;
                    } else {
                        trace!("address 0x{:02x} is not ours", self.shift >> 1);
                        self.state = Frame::Idle;
                    }
                }
            }
            Frame::Reg => {
                self.shift = (self.shift << 1) | u8::from(sda);
                self.bits += 1;
                if self.bits == 8 {
                    self.pointer = self.shift;
                    self.pointer_loaded = true;
                    trace!("pointer set to 0x{:02x}", self.pointer);
                    self.state = Frame::RegAck;
                    self.ack_driven = false;
                }
            }
            Frame::DataIn => {
                self.shift = (self.shift << 1) | u8::from(sda);
                self.bits += 1;
                if self.bits == 8 {
                    device.write_register(self.pointer, self.shift);
                    trace!("wrote 0x{:02x} to register 0x{:02x}", self.shift, self.pointer);
                    self.pointer = self.pointer.wrapping_add(1);
                    self.state = Frame::DataInAck;
                    self.ack_driven = false;
                }
            }
            Frame::DataOutAck => {
                if !sda {
                    self.state = Frame::DataOut;
                    self.bits = 0;
                } else {
                    // End-of-read nack; the line is already released.
                    self.state = Frame::Idle;
                    self.drive_low = false;
                }
            }
            _ => {}
        }
    }

    fn on_falling<D: RegisterDevice>(&mut self, device: &mut D) {
        match self.state {
            Frame::AddrAck => {
                if !self.ack_driven {
                    self.drive_low = true;
                    self.ack_driven = true;
                } else {
                    self.ack_driven = false;
                    match self.direction {
                        Direction::Write => {
                            self.drive_low = false;
                            self.shift = 0;
                            self.bits = 0;
                            self.state = if self.pointer_loaded {
                                Frame::DataIn
                            } else {
                                Frame::Reg
                            };
                        }
                        Direction::Read => {
                            self.bits = 0;
                            self.state = Frame::DataOut;
                            self.place_out_bit(device);
                        }
                    }
                }
            }
            Frame::RegAck | Frame::DataInAck => {
                if !self.ack_driven {
                    self.drive_low = true;
                    self.ack_driven = true;
                } else {
                    self.ack_driven = false;
                    self.drive_low = false;
                    self.shift = 0;
                    self.bits = 0;
                    self.state = Frame::DataIn;
                }
            }
            Frame::DataOut => self.place_out_bit(device),
            _ => {}
        }
    }

    /// Moves the data-out drive for the next clock cycle: fetch on the
    /// first bit of a byte, release after the last for the controller's
    /// acknowledgement slot.
    fn place_out_bit<D: RegisterDevice>(&mut self, device: &mut D) {
        if self.bits == 0 {
            self.out_byte = device.read_register(self.pointer);
            trace!("sending register 0x{:02x} = 0x{:02x}", self.pointer, self.out_byte);
            self.pointer = self.pointer.wrapping_add(1);
        }
        if self.bits < 8 {
            self.drive_low = self.out_byte & (0x80 >> self.bits) == 0;
            self.bits += 1;
        } else {
            self.drive_low = false;
            self.state = Frame::DataOutAck;
        }
    }
}

/// Poll-loop adapter running an [`EdgeEngine`] against physical lines.
pub struct EdgeResponder<L: Line, D: RegisterDevice> {
    sda: L,
    scl: L,
    timing: Timing,
    engine: EdgeEngine,
    device: D,
}

impl<L: Line, D: RegisterDevice> EdgeResponder<L, D> {
    pub fn new(sda: L, scl: L, timing: Timing, address: u8, device: D) -> Self {
        EdgeResponder {
            sda,
            scl,
            timing,
            engine: EdgeEngine::new(address),
            device,
        }
    }

    /// Samples the lines at the poll interval until `running` clears,
    /// mirroring the engine's requested drive onto the data line.
    pub fn run(&mut self, running: &AtomicBool) -> Result<(), Error> {
        self.sda.release()?;
        self.scl.release()?;
        info!("edge responder listening at address 0x{:02x}", self.engine.address);

        let mut driving = false;
        while running.load(Ordering::Relaxed) {
            self.device.tick();
            let sda = self.sda.is_high()?;
            let scl = self.scl.is_high()?;
            self.engine.step(sda, scl, &mut self.device);
            if self.engine.sda_driven_low() != driving {
                driving = self.engine.sda_driven_low();
                if driving {
                    self.sda.drive_low()?;
                } else {
                    self.sda.release()?;
                }
            }
            thread::sleep(self.timing.poll());
        }

        self.sda.release()?;
        self.scl.release()?;
        Ok(())
    }
}
