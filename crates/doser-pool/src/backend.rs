use alloc::vec::Vec;

use doser_icd::{Address, FlowRate};

/// Abstracts channel discovery and switching for one bus transport.
///
/// The pool never talks to hardware directly. It asks the backend for the
/// list of channels once per epoch and forwards every on/off transition.
#[allow(async_fn_in_trait)]
pub trait DoserBackend {
    /// Error type for enumeration and switching failures.
    type Error: core::fmt::Debug;

    /// Discover every channel, returning the max flow rate per address.
    ///
    /// Index `i` of the returned list is address `i`. Every channel is
    /// stopped afterwards.
    async fn connect(&self) -> Result<Vec<FlowRate>, Self::Error>;

    /// Command a channel to run at `flow_rate`.
    ///
    /// Called from drop paths, so it must not block. `Err` means the command
    /// never left; the channel keeps whatever it was doing.
    fn turn_on(
        &self,
        address: Address,
        flow_rate: FlowRate,
    ) -> Result<(), Self::Error>;

    /// Stop a channel.
    fn turn_off(&self, address: Address) -> Result<(), Self::Error> {
        self.turn_on(address, 0)
    }
}
