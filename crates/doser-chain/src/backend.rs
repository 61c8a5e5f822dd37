use alloc::vec::Vec;
use core::cell::RefCell;

use doser_icd::{Address, FlowRate, Payload, SetFlowRateCommand};
use doser_pool::DoserBackend;
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;

use crate::config::ControllerConfig;
use crate::controller::{enumerate, ChainLayout, EnumerationError};
use crate::transport::Transport;

/// Drives a chain of modules on the controller's bus.
pub struct BusBackend<M: RawMutex, T: Transport> {
    transport: T,
    config: ControllerConfig,
    layout: Mutex<M, RefCell<ChainLayout>>,
}

impl<M: RawMutex, T: Transport> BusBackend<M, T> {
    pub fn new(transport: T, config: ControllerConfig) -> Self {
        Self {
            transport,
            config,
            layout: Mutex::new(RefCell::new(ChainLayout::default())),
        }
    }

    /// Layout found by the last successful enumeration.
    pub fn layout(&self) -> ChainLayout {
        self.layout.lock(|layout| layout.borrow().clone())
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

impl<M: RawMutex, T: Transport> DoserBackend for BusBackend<M, T> {
    /// A switch command that could not be queued reports
    /// [`EnumerationError::Transport`].
    type Error = EnumerationError<T::Error>;

    async fn connect(&self) -> Result<Vec<FlowRate>, Self::Error> {
        let found = enumerate(&self.transport, &self.config).await?;
        let capabilities = found.capabilities();
        self.layout.lock(|layout| *layout.borrow_mut() = found);
        Ok(capabilities)
    }

    fn turn_on(
        &self,
        address: Address,
        flow_rate: FlowRate,
    ) -> Result<(), Self::Error> {
        let command = SetFlowRateCommand { address, flow_rate }.to_frame();
        self.transport
            .try_send(&command)
            .map_err(EnumerationError::Transport)
    }
}
