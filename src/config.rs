use std::time::Duration;

use crate::timing::Timing;

pub const DEFAULT_ADDRESS: u8 = 0x29;
pub const DEFAULT_BIT_PERIOD_US: u64 = 2000;
pub const DEFAULT_FREQUENCY_HZ: u32 = 5;
pub const DEFAULT_MAX_MEASUREMENTS: u32 = 500;
pub const DEFAULT_MAX_FAILURES: u32 = 2;

/// Static description of one end of the bus: which lines to use, how fast to
/// clock them and which responder address the link talks to. Built once at
/// startup and read-only afterwards.
#[derive(Debug, Clone, Copy)]
pub struct BusConfig {
    /// BCM number of the data (SDA) line.
    pub data_line: u8,
    /// BCM number of the clock (SCL) line.
    pub clock_line: u8,
    /// 7-bit responder address.
    pub address: u8,
    /// Quarter-phase duration in microseconds.
    pub bit_period_us: u64,
}

impl BusConfig {
    pub fn timing(&self) -> Timing {
        Timing::from_bit_period_us(self.bit_period_us)
    }
}

/// Controller-side workflow knobs.
#[derive(Debug, Clone, Copy)]
pub struct ControllerConfig {
    /// Measurement cycles per second.
    pub frequency_hz: u32,
    /// Total cycles before the controller exits on its own.
    pub max_measurements: u32,
    /// Gap between a register-pointer write and the following read.
    pub write_read_gap: Duration,
    /// Consecutive failed cycles before bus recovery runs.
    pub max_failures: u32,
}

impl ControllerConfig {
    /// One measurement period.
    pub fn period(&self) -> Duration {
        Duration::from_micros(1_000_000 / u64::from(self.frequency_hz.max(1)))
    }

    /// Default write-to-read gap: one twentieth of the measurement period.
    pub fn default_gap(frequency_hz: u32) -> Duration {
        Duration::from_micros(1_000_000 / u64::from(frequency_hz.max(1)) / 20)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_gap_is_a_twentieth_of_the_period() {
        assert_eq!(
            ControllerConfig::default_gap(DEFAULT_FREQUENCY_HZ),
            Duration::from_millis(10)
        );
    }
}
