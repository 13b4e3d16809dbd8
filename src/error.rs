use std::{error, fmt};

use rppal::gpio;

/// Errors surfaced by the bus layers.
///
/// `Gpio` covers chip and line acquisition as well as the release/re-request
/// cycle of a direction change; it is fatal for the transaction in flight.
/// The remaining variants are transaction outcomes the caller may retry
/// after bus recovery.
#[derive(Debug)]
pub enum Error {
    /// The underlying GPIO facility failed.
    Gpio(gpio::Error),
    /// The target did not acknowledge its address byte.
    NoResponse,
    /// The target did not acknowledge the data byte at `index`.
    Nack { index: usize },
    /// A bounded wait on a clock or data edge expired.
    Timeout(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Gpio(e) => write!(f, "gpio: {}", e),
            Error::NoResponse => f.write_str("no acknowledgement for address byte"),
            Error::Nack { index } => write!(f, "no acknowledgement for data byte {}", index),
            Error::Timeout(what) => write!(f, "timed out waiting for {}", what),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Gpio(e) => Some(e),
            _ => None,
        }
    }
}

impl From<gpio::Error> for Error {
    fn from(e: gpio::Error) -> Self {
        Error::Gpio(e)
    }
}
