use doser_icd::FlowRate;
use embedded_hal::pwm::SetDutyCycle;

/// Which duty level drives the pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Polarity {
    ActiveHigh,
    /// Full duty stops the pump. The reference module's driver is wired
    /// this way.
    #[default]
    ActiveLow,
}

/// One pump channel behind a PWM output.
///
/// Flow maps linearly onto the duty range, `max_flow_rate` being full drive.
pub struct Pump<D> {
    pwm: D,
    max_flow_rate: FlowRate,
    polarity: Polarity,
}

impl<D: SetDutyCycle> Pump<D> {
    pub fn new(pwm: D, max_flow_rate: FlowRate, polarity: Polarity) -> Self {
        Self { pwm, max_flow_rate, polarity }
    }

    pub fn max_flow_rate(&self) -> FlowRate {
        self.max_flow_rate
    }

    /// Drive the pump at `flow_rate`, clamped to the max.
    pub fn run(&mut self, flow_rate: FlowRate) -> Result<(), D::Error> {
        if flow_rate == 0 || self.max_flow_rate == 0 {
            return self.stop();
        }
        let flow_rate = flow_rate.min(self.max_flow_rate);
        match self.polarity {
            Polarity::ActiveHigh => {
                self.pwm.set_duty_cycle_fraction(flow_rate, self.max_flow_rate)
            }
            Polarity::ActiveLow => self.pwm.set_duty_cycle_fraction(
                self.max_flow_rate - flow_rate,
                self.max_flow_rate,
            ),
        }
    }

    pub fn stop(&mut self) -> Result<(), D::Error> {
        match self.polarity {
            Polarity::ActiveHigh => self.pwm.set_duty_cycle_fully_off(),
            Polarity::ActiveLow => self.pwm.set_duty_cycle_fully_on(),
        }
    }
}
