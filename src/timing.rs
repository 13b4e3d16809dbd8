use std::thread;
use std::time::{Duration, Instant};

/// Bounded waits give up after this many bit periods.
const WAIT_CAP_PERIODS: u32 = 64;

/// Idle pause inserted by the responder after too many consecutive faults,
/// in bit periods.
const FAULT_PAUSE_PERIODS: u32 = 10;

/// How many times per bit period the responder samples a line while waiting
/// for an edge.
const POLLS_PER_PERIOD: u32 = 10;

/// Derived timing for one bus.
///
/// The configured bit period is the duration of a single quarter-phase of
/// the clock; four of them make one full clock cycle. Everything else here
/// is scaled from it.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    quarter: Duration,
    poll: Duration,
    wait_cap: Duration,
}

impl Timing {
    pub fn from_bit_period_us(bit_period_us: u64) -> Self {
        let quarter = Duration::from_micros(bit_period_us);
        let poll = Duration::from_micros((bit_period_us / u64::from(POLLS_PER_PERIOD)).max(1));
        Timing {
            quarter,
            poll,
            wait_cap: quarter * WAIT_CAP_PERIODS,
        }
    }

    /// One quarter-phase of the clock.
    pub fn quarter(&self) -> Duration {
        self.quarter
    }

    /// Sleep for one quarter-phase.
    pub fn quarter_sleep(&self) {
        thread::sleep(self.quarter);
    }

    /// Polling interval for responder-side level waits.
    pub fn poll(&self) -> Duration {
        self.poll
    }

    /// Deadline for a bounded level wait starting now.
    pub fn wait_deadline(&self) -> Instant {
        Instant::now() + self.wait_cap
    }

    /// Idle pause after the consecutive-failure threshold trips.
    pub fn fault_pause(&self) -> Duration {
        self.quarter * FAULT_PAUSE_PERIODS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scales_from_bit_period() {
        let t = Timing::from_bit_period_us(2000);
        assert_eq!(t.quarter(), Duration::from_micros(2000));
        assert_eq!(t.poll(), Duration::from_micros(200));
        assert_eq!(t.fault_pause(), Duration::from_millis(20));
    }

    #[test]
    fn poll_never_rounds_to_zero() {
        let t = Timing::from_bit_period_us(5);
        assert_eq!(t.poll(), Duration::from_micros(1));
    }
}
