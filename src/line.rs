use rppal::gpio::{Gpio, InputPin, OutputPin};

use crate::error::Error;

/// An open-drain bus line.
///
/// A line is either *released* (input with pull-up, floats high) or
/// *driven low*. There is no driven-high state; "set high" always means
/// release. Reading a driven line reports low without touching the
/// hardware, since we are the party holding it there.
pub trait Line {
    fn release(&mut self) -> Result<(), Error>;
    fn drive_low(&mut self) -> Result<(), Error>;
    fn is_high(&self) -> Result<bool, Error>;
}

enum State {
    Released(InputPin),
    DrivenLow(OutputPin),
}

/// A GPIO-backed bus line.
///
/// Each direction change releases the previous line request before issuing
/// the new one; keeping that cycle inside the transition is what makes it
/// impossible to hold two conflicting requests on the same pin.
pub struct GpioLine {
    gpio: Gpio,
    number: u8,
    state: Option<State>,
}

impl GpioLine {
    /// Requests `number` as a released (pulled-up input) line.
    pub fn new(gpio: &Gpio, number: u8) -> Result<Self, Error> {
        let mut pin = gpio.get(number)?.into_input_pullup();
        // The next request sets the mode explicitly; restoring a stale mode
        // on drop would glitch the bus between transitions.
        pin.set_reset_on_drop(false);
        Ok(GpioLine {
            gpio: gpio.clone(),
            number,
            state: Some(State::Released(pin)),
        })
    }

    pub fn number(&self) -> u8 {
        self.number
    }
}

impl Line for GpioLine {
    fn release(&mut self) -> Result<(), Error> {
        if matches!(self.state, Some(State::Released(_))) {
            return Ok(());
        }
        // Free the output request before asking for the line again.
        self.state = None;
        let mut pin = self.gpio.get(self.number)?.into_input_pullup();
        pin.set_reset_on_drop(false);
        self.state = Some(State::Released(pin));
        Ok(())
    }

    fn drive_low(&mut self) -> Result<(), Error> {
        if matches!(self.state, Some(State::DrivenLow(_))) {
            return Ok(());
        }
        self.state = None;
        let mut pin = self.gpio.get(self.number)?.into_output_low();
        pin.set_reset_on_drop(false);
        self.state = Some(State::DrivenLow(pin));
        Ok(())
    }

    fn is_high(&self) -> Result<bool, Error> {
        match &self.state {
            Some(State::Released(pin)) => Ok(pin.is_high()),
            Some(State::DrivenLow(_)) => Ok(false),
            // A failed re-request left the line unclaimed; it floats to the
            // pull-up.
            None => Ok(true),
        }
    }
}
