use doser_icd::{
    Address, LastNodeCommand, Message, NewModuleCommand,
    NewModuleResponse, Payload, SetFlowRateCommand,
};
use embassy_time::{with_timeout, Timer};
use embedded_hal::pwm::SetDutyCycle;

use crate::config::ModuleConfig;
use crate::fault::{FaultCode, FaultIndicator};
use crate::fmt::Dbg;
use crate::pump::Pump;
use crate::topology::ChainControl;
use crate::transport::Transport;

/// Lifecycle of a module between two resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ModuleState {
    Boot,
    Registering,
    ProbingDownstream,
    Forwarding,
    Terminal,
    Operating,
    Faulted(FaultCode),
}

/// Position of a module in the chain, known after probing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChainRole {
    /// A downstream module answered; power and bus stay open.
    Forwarding,
    /// Last module of the chain; terminates the bus.
    Terminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ModuleError<E> {
    /// The bus peripheral rejected the reception filter.
    BusConfig(E),
    /// Every registration attempt went unanswered.
    RegistrationExhausted,
    /// A frame the chain depends on could not be sent.
    Transmit(E),
}

impl<E> ModuleError<E> {
    pub fn fault_code(&self) -> FaultCode {
        match self {
            ModuleError::BusConfig(_) => FaultCode::BusConfig,
            ModuleError::RegistrationExhausted => FaultCode::Registration,
            ModuleError::Transmit(_) => FaultCode::Command,
        }
    }
}

/// Firmware side of one pump module.
///
/// `pumps[i]` serves global address `base + i` once the controller has
/// assigned `base`.
pub struct ModuleNode<'p, T, C, D, F> {
    transport: T,
    chain: C,
    pumps: &'p mut [Pump<D>],
    indicator: F,
    config: ModuleConfig,
    state: ModuleState,
    base_address: Option<Address>,
}

impl<'p, T, C, D, F> ModuleNode<'p, T, C, D, F>
where
    T: Transport,
    C: ChainControl,
    D: SetDutyCycle,
    F: FaultIndicator,
{
    pub fn new(
        transport: T,
        chain: C,
        pumps: &'p mut [Pump<D>],
        indicator: F,
        config: ModuleConfig,
    ) -> Self {
        Self {
            transport,
            chain,
            pumps,
            indicator,
            config,
            state: ModuleState::Boot,
            base_address: None,
        }
    }

    pub fn state(&self) -> ModuleState {
        self.state
    }

    /// Address of the first channel, once registered.
    pub fn base_address(&self) -> Option<Address> {
        self.base_address
    }

    pub fn num_dosers(&self) -> u8 {
        u8::try_from(self.pumps.len()).unwrap_or(u8::MAX)
    }

    /// Boot, register and probe for a downstream neighbor.
    pub async fn start(&mut self) -> Result<ChainRole, ModuleError<T::Error>> {
        self.boot()?;
        let base_address = self.register().await?;
        self.base_address = Some(base_address);
        info!(
            "Registered {} dosers at base address {}",
            self.num_dosers(),
            base_address
        );

        let role = self.probe_downstream().await?;
        self.state = ModuleState::Operating;
        Ok(role)
    }

    /// Serve flow-rate commands until the controller restarts the chain.
    ///
    /// Returns with the downstream module unpowered and every pump stopped,
    /// ready for a device reset.
    pub async fn operate(&mut self) {
        loop {
            let frame = match self.transport.receive().await {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Bus receive failed: {:?}", Dbg(&e));
                    Timer::after(self.config.poll_interval).await;
                    continue;
                }
            };

            match Message::try_from(&frame) {
                Ok(Message::SetFlowRate(command)) => self.set_flow_rate(command),
                Ok(Message::Restart(_)) => {
                    info!("Restart requested");
                    self.shutdown();
                    return;
                }
                Ok(message) => {
                    trace!("Ignoring message {:?}", message.id());
                }
                Err(e) => {
                    debug!("Ignoring frame: {:?}", e);
                }
            }
        }
    }

    /// Whole life between two resets. `Ok` means a restart was requested.
    pub async fn run(&mut self) -> Result<(), ModuleError<T::Error>> {
        self.start().await?;
        self.operate().await;
        Ok(())
    }

    /// Hand over to `reset` once the controller restarts the chain.
    ///
    /// A failure ends in the fault blink and never returns. On hardware
    /// `reset` is the device reset and does not return either.
    pub async fn serve<R>(mut self, reset: impl FnOnce() -> R) -> R {
        match self.run().await {
            Ok(()) => reset(),
            Err(e) => {
                error!("Module failed: {:?}", Dbg(&e));
                self.fault(e.fault_code()).await
            }
        }
    }

    /// Halt with every output safe and blink `code` forever.
    pub async fn fault(&mut self, code: FaultCode) -> ! {
        self.state = ModuleState::Faulted(code);
        self.stop_pumps();
        self.chain.shutdown_next();
        loop {
            self.indicator.show(code.code());
            Timer::after(self.config.blink_period).await;
            self.indicator.clear();
            Timer::after(self.config.blink_period).await;
        }
    }

    fn boot(&mut self) -> Result<(), ModuleError<T::Error>> {
        self.state = ModuleState::Boot;
        self.base_address = None;
        self.stop_pumps();
        self.indicator.clear();
        self.chain.shutdown_next();
        self.chain.terminate();
        self.transport.accept_all().map_err(ModuleError::BusConfig)?;

        let stale = self.transport.pending();
        if stale > 0 {
            debug!("Dropping {} frames from before the reset", stale);
            self.transport.clear();
        }
        Ok(())
    }

    async fn register(&mut self) -> Result<Address, ModuleError<T::Error>> {
        self.state = ModuleState::Registering;
        let request = NewModuleCommand {
            num_dosers: self.num_dosers(),
            max_flow_rate: self.config.max_flow_rate,
        }
        .to_frame();

        for attempt in 0..self.config.retry_max {
            match self.transport.send(&request).await {
                Ok(()) => {
                    let response = with_timeout(
                        self.config.response_timeout,
                        self.await_response(),
                    );
                    if let Ok(base_address) = response.await {
                        return Ok(base_address);
                    }
                    trace!("Registration attempt {} unanswered", attempt);
                }
                Err(e) => {
                    warn!(
                        "Registration attempt {} not sent: {:?}",
                        attempt,
                        Dbg(&e)
                    );
                }
            }
            if self.config.retry_delay.as_ticks() > 0 {
                Timer::after(self.config.retry_delay).await;
            }
        }

        Err(ModuleError::RegistrationExhausted)
    }

    async fn await_response(&self) -> Address {
        loop {
            match self.transport.receive().await {
                Ok(frame) if frame.id == NewModuleResponse::ID => {
                    match NewModuleResponse::from_frame(&frame) {
                        Ok(response) => return response.base_address,
                        Err(e) => warn!("Malformed registration response: {:?}", e),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Bus receive failed: {:?}", Dbg(&e));
                    Timer::after(self.config.poll_interval).await;
                }
            }
        }
    }

    async fn probe_downstream(
        &mut self,
    ) -> Result<ChainRole, ModuleError<T::Error>> {
        self.state = ModuleState::ProbingDownstream;
        self.transport.clear();
        self.chain.remove_termination();
        self.chain.power_next();

        let announced =
            with_timeout(self.config.probe_timeout, self.await_downstream())
                .await
                .is_ok();
        if announced {
            debug!("Downstream module found");
            self.state = ModuleState::Forwarding;
            return Ok(ChainRole::Forwarding);
        }

        info!("No downstream module, terminating the chain");
        self.state = ModuleState::Terminal;
        self.chain.shutdown_next();
        self.chain.terminate();
        self.transport
            .send(&LastNodeCommand.to_frame())
            .await
            .map_err(ModuleError::Transmit)?;
        Ok(ChainRole::Terminal)
    }

    async fn await_downstream(&self) {
        loop {
            match self.transport.receive().await {
                Ok(frame) if frame.id == NewModuleCommand::ID => return,
                Ok(_) => {}
                Err(e) => {
                    warn!("Bus receive failed: {:?}", Dbg(&e));
                    Timer::after(self.config.poll_interval).await;
                }
            }
        }
    }

    fn set_flow_rate(&mut self, command: SetFlowRateCommand) {
        let Some(base_address) = self.base_address else {
            return;
        };
        let Some(index) = command.address.checked_sub(base_address) else {
            return;
        };
        let Some(pump) = self.pumps.get_mut(index as usize) else {
            return;
        };

        debug!(
            "Doser {} set to {} ml/min",
            command.address, command.flow_rate
        );
        if let Err(e) = pump.run(command.flow_rate) {
            error!("Pump {} did not take duty: {:?}", index, Dbg(&e));
        }
    }

    fn shutdown(&mut self) {
        self.chain.shutdown_next();
        self.chain.terminate();
        self.stop_pumps();
        self.base_address = None;
        self.state = ModuleState::Boot;
    }

    fn stop_pumps(&mut self) {
        for pump in self.pumps.iter_mut() {
            if let Err(e) = pump.stop() {
                error!("Failed to stop pump: {:?}", Dbg(&e));
            }
        }
    }
}
