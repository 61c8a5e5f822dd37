use alloc::vec::Vec;

use doser_icd::{
    Address, FlowRate, Message, ModuleRecord, NewModuleResponse, Payload,
    RestartCommand,
};
use embassy_time::with_timeout;

use crate::config::ControllerConfig;
use crate::fmt::Dbg;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EnumerationError<E> {
    Transport(E),
    /// The bus went quiet before the last module reported.
    Timeout,
    /// The chain terminated without a single channel.
    NoDosers,
}

/// Modules in physical order, as registered in one enumeration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainLayout {
    modules: Vec<ModuleRecord>,
}

impl ChainLayout {
    pub fn modules(&self) -> &[ModuleRecord] {
        &self.modules
    }

    /// Max flow rate per global address.
    pub fn capabilities(&self) -> Vec<FlowRate> {
        self.modules
            .iter()
            .flat_map(|module| {
                core::iter::repeat(module.max_flow_rate)
                    .take(usize::from(module.num_dosers))
            })
            .collect()
    }

    /// Total channel count.
    pub fn len(&self) -> usize {
        self.modules
            .iter()
            .map(|module| usize::from(module.num_dosers))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Base address the next registering module receives.
    pub fn next_address(&self) -> Address {
        self.modules
            .last()
            .map_or(0, |module| module.addresses().end)
    }

    /// Module owning `address`.
    pub fn module_of(&self, address: Address) -> Option<&ModuleRecord> {
        self.modules
            .iter()
            .find(|module| module.addresses().contains(&address))
    }
}

/// Restart the chain and assign contiguous addresses to every module.
///
/// Modules announce themselves one after another, nearest first, each
/// receiving the current channel count as its base address. Ends when the
/// last module reports.
pub async fn enumerate<T: Transport>(
    transport: &T,
    config: &ControllerConfig,
) -> Result<ChainLayout, EnumerationError<T::Error>> {
    transport
        .send(&RestartCommand.to_frame())
        .await
        .map_err(EnumerationError::Transport)?;
    let stale = transport.pending();
    transport.clear();
    info!("Chain restarted, waiting for modules");
    if stale > 0 {
        debug!("Dropped {} frames from the previous chain", stale);
    }

    let mut layout = ChainLayout::default();
    loop {
        let received = match config.idle_timeout {
            Some(timeout) => with_timeout(timeout, transport.receive())
                .await
                .map_err(|_| EnumerationError::Timeout)?,
            None => transport.receive().await,
        };
        let frame = received.map_err(EnumerationError::Transport)?;

        match Message::try_from(&frame) {
            Ok(Message::NewModule(request)) => {
                let base_address = layout.next_address();
                let response = NewModuleResponse { base_address }.to_frame();
                if let Err(e) = transport.send(&response).await {
                    // The module keeps asking; it gets the same base again.
                    warn!("Registration response not sent: {:?}", Dbg(&e));
                    continue;
                }
                debug!(
                    "Module {} registered {} dosers at {}",
                    layout.modules.len(),
                    request.num_dosers,
                    base_address
                );
                layout.modules.push(ModuleRecord {
                    base_address,
                    num_dosers: request.num_dosers,
                    max_flow_rate: request.max_flow_rate,
                });
            }
            Ok(Message::LastNode(_)) => break,
            Ok(message) => {
                trace!("Ignoring message {:?} during enumeration", message.id());
            }
            Err(e) => {
                warn!("Ignoring frame during enumeration: {:?}", e);
            }
        }
    }

    info!(
        "Chain has {} modules with {} dosers",
        layout.modules.len(),
        layout.len()
    );
    if layout.is_empty() {
        return Err(EnumerationError::NoDosers);
    }
    Ok(layout)
}
