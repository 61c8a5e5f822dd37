use embedded_hal::digital::OutputPin;

/// Codes shown on the module's indicator LEDs when it halts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum FaultCode {
    /// The controller never answered a registration request.
    Registration = 0x03,
    /// A frame could not be transmitted.
    Command = 0x05,
    /// The bus peripheral refused its configuration.
    BusConfig = 0x0F,
}

impl FaultCode {
    pub const fn code(self) -> u8 {
        self as u8
    }
}

/// Something able to display a 4-bit code, usually a row of LEDs.
pub trait FaultIndicator {
    /// Show the low four bits of `code`.
    fn show(&mut self, code: u8);
    fn clear(&mut self) {
        self.show(0);
    }
}

impl<P: OutputPin> FaultIndicator for [P; 4] {
    fn show(&mut self, code: u8) {
        for (bit, led) in self.iter_mut().enumerate() {
            // Nothing left to report a broken indicator to.
            let _ = led.set_state(((code >> bit) & 1 == 1).into());
        }
    }
}
