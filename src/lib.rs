//! Software (bit-banged) I2C over two GPIO lines, plus an emulation of the
//! VL53L0X time-of-flight ranger behind a 256-byte register file.
//!
//! The crate has two halves. The bus half implements both ends of the link:
//! [`controller::Controller`] generates START/STOP and the clock and runs
//! framed write/read transfers, while [`responder::Responder`] follows the
//! controller's clock through bounded waits and feeds a register-model
//! device. The device half, [`device::TofDevice`], maps register accesses to
//! the ranger's behaviour: a start strobe, a simulated conversion delay and a
//! self-clearing data-ready status.
//!
//! Everything is single-threaded per peer; the two GPIO lines are the only
//! channel between the processes. Lines are strictly open-drain: a peer may
//! pull a line low or release it to the external pull-up, never drive it
//! high.

pub mod config;
pub mod controller;
pub mod device;
pub mod error;
pub mod line;
pub mod responder;
pub mod timing;

pub use error::Error;
