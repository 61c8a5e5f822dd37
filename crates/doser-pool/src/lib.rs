#![no_std]
//! Concurrency-limited lease manager for pump channels.
//!
//! Channels discovered by a [`DoserBackend`] are lent out one owner at a
//! time. Holding a [`Lease`] is free; switching its channel on takes a slot
//! of the shared power budget, which is handed back when the channel goes
//! off or the lease is dropped.
extern crate alloc;

mod fmt;

mod backend;
mod config;
mod error;
mod lease;
mod pool;

pub use backend::DoserBackend;
pub use config::PoolConfig;
pub use doser_icd::{Address, DoserStatus, FlowRate};
pub use error::PoolError;
pub use lease::Lease;
pub use pool::DoserPool;
