//! In-memory doser chain for host runs and tests.
//!
//! One controller port plus a row of daisy-chained modules on a shared
//! broadcast bus. A module only runs while the module before it keeps its
//! power pin high; losing power aborts it like a brown-out would.
use alloc::vec::Vec;
use core::cell::RefCell;
use core::convert::Infallible;

use doser_icd::{Address, FlowRate, Frame};
use embassy_futures::select::select;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Timer};
use embedded_hal::digital::{ErrorType as PinErrorType, OutputPin};
use embedded_hal::pwm::{ErrorType as PwmErrorType, SetDutyCycle};
use serde::{Deserialize, Serialize};

use crate::config::ModuleConfig;
use crate::fault::{FaultCode, FaultIndicator};
use crate::module::{ChainRole, ModuleNode};
use crate::pump::{Polarity, Pump};
use crate::topology::GpioChain;
use crate::transport::Transport;

#[cfg(test)]
mod tests;

/// Frames a participant can buffer before the bus drops them.
pub const INBOX_DEPTH: usize = 32;

const POWER_POLL: Duration = Duration::from_millis(1);

type Inbox = Channel<CriticalSectionRawMutex, Frame, INBOX_DEPTH>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SimError {
    /// The sending module has no power.
    Unpowered,
    /// The module's transmitter refuses this kind of frame.
    Refused,
    /// The module's reception filter cannot be set up.
    Filter,
}

/// Hardware of one simulated module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimModuleSpec {
    pub num_dosers: u8,
    pub max_flow_rate: FlowRate,
}

#[derive(Debug, Clone, Default)]
struct ModuleSlot {
    power_next: bool,
    terminated: bool,
    duty: Vec<u16>,
    role: Option<ChainRole>,
    base_address: Option<Address>,
    fault: Option<FaultCode>,
    boots: u32,
    refused_id: Option<u32>,
    refusals: u32,
    filter_broken: bool,
}

type SimNode<'s, 'p> = ModuleNode<
    'p,
    SimPort<'s>,
    GpioChain<SimPin<'s>, SimPin<'s>>,
    SimPwm<'s>,
    SimLeds<'s>,
>;

pub struct SimChain {
    specs: Vec<SimModuleSpec>,
    /// Index 0 is the controller, module `i` listens on `i + 1`.
    inboxes: Vec<Inbox>,
    slots: Mutex<CriticalSectionRawMutex, RefCell<Vec<ModuleSlot>>>,
    boot_delay: Duration,
}

impl SimChain {
    pub fn new(specs: &[SimModuleSpec]) -> Self {
        let slots = specs
            .iter()
            .map(|spec| ModuleSlot {
                duty: alloc::vec![0; usize::from(spec.num_dosers)],
                ..Default::default()
            })
            .collect();
        Self {
            specs: specs.to_vec(),
            inboxes: (0..=specs.len()).map(|_| Channel::new()).collect(),
            slots: Mutex::new(RefCell::new(slots)),
            boot_delay: Duration::from_millis(2),
        }
    }

    /// Time a module needs from power-up to its first frame.
    pub fn with_boot_delay(mut self, boot_delay: Duration) -> Self {
        self.boot_delay = boot_delay;
        self
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Bus port of the controller.
    pub fn controller(&self) -> SimPort<'_> {
        SimPort { chain: self, node: 0 }
    }

    /// The first module is fed by the controller, every other one by the
    /// power pin of its predecessor.
    pub fn powered(&self, index: usize) -> bool {
        self.slots.lock(|slots| {
            let slots = slots.borrow();
            index < slots.len()
                && slots[..index].iter().all(|slot| slot.power_next)
        })
    }

    /// Whether a module drives the power pin of its successor.
    pub fn powers_next(&self, index: usize) -> bool {
        self.slot(index, |slot| slot.power_next).unwrap_or(false)
    }

    pub fn terminated(&self, index: usize) -> bool {
        self.slot(index, |slot| slot.terminated).unwrap_or(false)
    }

    pub fn role(&self, index: usize) -> Option<ChainRole> {
        self.slot(index, |slot| slot.role).flatten()
    }

    pub fn base_address(&self, index: usize) -> Option<Address> {
        self.slot(index, |slot| slot.base_address).flatten()
    }

    /// Last fault code a module blinked, if any.
    pub fn fault(&self, index: usize) -> Option<FaultCode> {
        self.slot(index, |slot| slot.fault).flatten()
    }

    /// How many times a module came out of reset.
    pub fn boots(&self, index: usize) -> u32 {
        self.slot(index, |slot| slot.boots).unwrap_or(0)
    }

    /// Make a module's transmitter refuse every frame with `id`.
    pub fn refuse_frames(&self, index: usize, id: u32) {
        self.update(index, |slot| slot.refused_id = Some(id));
    }

    /// Frames a module tried to send and had refused.
    pub fn refusals(&self, index: usize) -> u32 {
        self.slot(index, |slot| slot.refusals).unwrap_or(0)
    }

    /// Make setting up a module's reception filter fail.
    pub fn break_filter(&self, index: usize) {
        self.update(index, |slot| slot.filter_broken = true);
    }

    /// Flow a pump currently delivers, recovered from its duty cycle.
    pub fn flow_rate(&self, index: usize, channel: usize) -> FlowRate {
        let max_flow_rate = self.specs.get(index).map_or(0, |s| s.max_flow_rate);
        let duty = self
            .slot(index, |slot| slot.duty.get(channel).copied())
            .flatten()
            .unwrap_or(0);
        let flow = (u32::from(duty) * u32::from(max_flow_rate) + 0x7FFF) / 0xFFFF;
        flow as FlowRate
    }

    /// Run every module forever.
    pub async fn run_modules(&self, config: ModuleConfig) {
        futures::future::join_all(
            (0..self.len()).map(|index| self.run_module(index, config)),
        )
        .await;
    }

    /// Run one module forever, rebooting it after every restart or power
    /// loss.
    pub async fn run_module(&self, index: usize, config: ModuleConfig) {
        loop {
            while !self.powered(index) {
                Timer::after(POWER_POLL).await;
            }
            Timer::after(self.boot_delay).await;
            if !self.powered(index) {
                continue;
            }

            self.reset(index);
            select(self.module_life(index, config), self.power_lost(index))
                .await;
            self.update(index, |slot| slot.power_next = false);
        }
    }

    async fn module_life(&self, index: usize, config: ModuleConfig) {
        let mut pumps = self.pumps(index);
        let mut node = self.node(index, config, &mut pumps);
        match node.start().await {
            Ok(role) => {
                let base_address = node.base_address();
                self.update(index, |slot| {
                    slot.role = Some(role);
                    slot.base_address = base_address;
                });
                node.operate().await;
            }
            Err(e) => node.fault(e.fault_code()).await,
        }
    }

    fn pumps(&self, index: usize) -> Vec<Pump<SimPwm<'_>>> {
        let Some(spec) = self.specs.get(index) else {
            return Vec::new();
        };
        (0..usize::from(spec.num_dosers))
            .map(|channel| {
                let pwm = SimPwm { chain: self, index, channel };
                Pump::new(pwm, spec.max_flow_rate, Polarity::ActiveHigh)
            })
            .collect()
    }

    fn node<'s, 'p>(
        &'s self,
        index: usize,
        config: ModuleConfig,
        pumps: &'p mut [Pump<SimPwm<'s>>],
    ) -> SimNode<'s, 'p> {
        let max_flow_rate = self
            .specs
            .get(index)
            .map_or(config.max_flow_rate, |spec| spec.max_flow_rate);
        let topology = GpioChain::new(
            SimPin { chain: self, index, line: Line::PowerNext },
            SimPin { chain: self, index, line: Line::Termination },
        );
        ModuleNode::new(
            SimPort { chain: self, node: index + 1 },
            topology,
            pumps,
            SimLeds { chain: self, index },
            ModuleConfig { max_flow_rate, ..config },
        )
    }

    async fn power_lost(&self, index: usize) {
        while self.powered(index) {
            Timer::after(POWER_POLL).await;
        }
    }

    fn reset(&self, index: usize) {
        if let Some(inbox) = self.inboxes.get(index + 1) {
            inbox.clear();
        }
        self.update(index, |slot| {
            slot.power_next = false;
            slot.terminated = false;
            slot.duty.iter_mut().for_each(|duty| *duty = 0);
            slot.role = None;
            slot.base_address = None;
            slot.fault = None;
            slot.boots += 1;
        });
    }

    fn broadcast(&self, from: usize, frame: &Frame) -> Result<(), SimError> {
        if from > 0 && !self.powered(from - 1) {
            return Err(SimError::Unpowered);
        }
        if from > 0 {
            let refused = self.slots.lock(|slots| {
                let mut slots = slots.borrow_mut();
                match slots.get_mut(from - 1) {
                    Some(slot) if slot.refused_id == Some(frame.id) => {
                        slot.refusals += 1;
                        true
                    }
                    _ => false,
                }
            });
            if refused {
                return Err(SimError::Refused);
            }
        }
        for (node, inbox) in self.inboxes.iter().enumerate() {
            if node == from || (node > 0 && !self.powered(node - 1)) {
                continue;
            }
            if inbox.try_send(frame.clone()).is_err() {
                warn!("Bus overrun at node {}, frame {} dropped", node, frame.id);
            }
        }
        Ok(())
    }

    fn slot<R>(
        &self,
        index: usize,
        f: impl FnOnce(&ModuleSlot) -> R,
    ) -> Option<R> {
        self.slots.lock(|slots| slots.borrow().get(index).map(f))
    }

    fn update(&self, index: usize, f: impl FnOnce(&mut ModuleSlot)) {
        self.slots.lock(|slots| {
            if let Some(slot) = slots.borrow_mut().get_mut(index) {
                f(slot);
            }
        });
    }
}

/// One participant's connection to the simulated bus.
#[derive(Clone, Copy)]
pub struct SimPort<'a> {
    chain: &'a SimChain,
    node: usize,
}

impl Transport for SimPort<'_> {
    type Error = SimError;

    fn accept_all(&self) -> Result<(), SimError> {
        let broken = self.node > 0
            && self
                .chain
                .slot(self.node - 1, |slot| slot.filter_broken)
                .unwrap_or(false);
        if broken {
            Err(SimError::Filter)
        } else {
            Ok(())
        }
    }

    async fn send(&self, frame: &Frame) -> Result<(), SimError> {
        self.chain.broadcast(self.node, frame)
    }

    fn try_send(&self, frame: &Frame) -> Result<(), SimError> {
        self.chain.broadcast(self.node, frame)
    }

    async fn receive(&self) -> Result<Frame, SimError> {
        Ok(self.chain.inboxes[self.node].receive().await)
    }

    fn pending(&self) -> usize {
        self.chain.inboxes[self.node].len()
    }

    fn clear(&self) {
        self.chain.inboxes[self.node].clear();
    }
}

#[derive(Clone, Copy)]
enum Line {
    PowerNext,
    Termination,
}

struct SimPin<'a> {
    chain: &'a SimChain,
    index: usize,
    line: Line,
}

impl SimPin<'_> {
    fn set(&mut self, high: bool) {
        let line = self.line;
        self.chain.update(self.index, |slot| match line {
            Line::PowerNext => slot.power_next = high,
            Line::Termination => slot.terminated = high,
        });
    }
}

impl PinErrorType for SimPin<'_> {
    type Error = Infallible;
}

impl OutputPin for SimPin<'_> {
    fn set_low(&mut self) -> Result<(), Infallible> {
        self.set(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        self.set(true);
        Ok(())
    }
}

struct SimPwm<'a> {
    chain: &'a SimChain,
    index: usize,
    channel: usize,
}

impl PwmErrorType for SimPwm<'_> {
    type Error = Infallible;
}

impl SetDutyCycle for SimPwm<'_> {
    fn max_duty_cycle(&self) -> u16 {
        0xFFFF
    }

    fn set_duty_cycle(&mut self, duty: u16) -> Result<(), Infallible> {
        let channel = self.channel;
        self.chain.update(self.index, |slot| {
            if let Some(slot_duty) = slot.duty.get_mut(channel) {
                *slot_duty = duty;
            }
        });
        Ok(())
    }
}

struct SimLeds<'a> {
    chain: &'a SimChain,
    index: usize,
}

impl FaultIndicator for SimLeds<'_> {
    fn show(&mut self, code: u8) {
        let fault = match code {
            0x03 => Some(FaultCode::Registration),
            0x05 => Some(FaultCode::Command),
            0x0F => Some(FaultCode::BusConfig),
            _ => None,
        };
        if let Some(fault) = fault {
            self.chain.update(self.index, |slot| slot.fault = Some(fault));
        }
    }
}
