#![cfg_attr(not(test), no_std)]
//! Both ends of the doser chain bus.
//!
//! A [`ModuleNode`] runs on every pump module: it registers itself with the
//! controller, powers the next module and serves flow-rate commands. The
//! controller side is [`enumerate`], wrapped by [`BusBackend`] so a
//! [`doser_pool::DoserPool`] can drive the whole chain.
extern crate alloc;

mod fmt;

mod backend;
mod config;
mod controller;
mod fault;
mod module;
mod pump;
mod topology;
mod transport;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use backend::BusBackend;
pub use config::{ControllerConfig, ModuleConfig};
pub use controller::{enumerate, ChainLayout, EnumerationError};
pub use fault::{FaultCode, FaultIndicator};
pub use module::{ChainRole, ModuleError, ModuleNode, ModuleState};
pub use pump::{Polarity, Pump};
pub use topology::{ChainControl, GpioChain};
pub use transport::Transport;
