use embedded_hal::digital::OutputPin;

use crate::fmt::Dbg;

/// Power and termination control toward the next module in the chain.
pub trait ChainControl {
    /// Supply power to the downstream module.
    fn power_next(&mut self);
    /// Cut power to the downstream module.
    fn shutdown_next(&mut self);
    /// Engage the local bus termination.
    fn terminate(&mut self);
    fn remove_termination(&mut self);
}

/// [`ChainControl`] over two output pins.
///
/// The power pin switches the downstream supply, the termination pin the
/// local terminating resistor. Both are active high.
pub struct GpioChain<P, R> {
    power: P,
    termination: R,
}

impl<P: OutputPin, R: OutputPin> GpioChain<P, R> {
    pub fn new(power: P, termination: R) -> Self {
        Self { power, termination }
    }
}

impl<P: OutputPin, R: OutputPin> ChainControl for GpioChain<P, R> {
    fn power_next(&mut self) {
        if let Err(e) = self.power.set_high() {
            error!("Failed to power next module: {:?}", Dbg(&e));
        }
    }

    fn shutdown_next(&mut self) {
        if let Err(e) = self.power.set_low() {
            error!("Failed to shut down next module: {:?}", Dbg(&e));
        }
    }

    fn terminate(&mut self) {
        if let Err(e) = self.termination.set_high() {
            error!("Failed to engage bus termination: {:?}", Dbg(&e));
        }
    }

    fn remove_termination(&mut self) {
        if let Err(e) = self.termination.set_low() {
            error!("Failed to remove bus termination: {:?}", Dbg(&e));
        }
    }
}
