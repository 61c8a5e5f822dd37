use std::cell::RefCell;
use std::collections::BTreeMap;

use derive_more::{Display, Error};
use doser_icd::{Address, FlowRate};
use doser_pool::{DoserBackend, DoserPool, Lease};
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Error)]
pub enum ServiceError {
    #[display("doser {_0} is out of range or already lent")]
    Unavailable(#[error(not(source))] Address),
    #[display("all {_0} power slots are taken")]
    Busy(#[error(not(source))] usize),
    #[display("doser {_0} did not take the new flow rate")]
    Refused(#[error(not(source))] Address),
}

/// Keeps the leases of remotely started channels.
///
/// A started channel stays leased and running until `stop` or `reset`
/// drops its lease. Starting never waits for a power slot.
pub struct DoserService<'p, M: RawMutex, B: DoserBackend> {
    pool: &'p DoserPool<M, B>,
    running: Mutex<M, RefCell<BTreeMap<Address, Lease<'p, M, B>>>>,
}

impl<'p, M: RawMutex, B: DoserBackend> DoserService<'p, M, B> {
    pub fn new(pool: &'p DoserPool<M, B>) -> Self {
        Self { pool, running: Mutex::new(RefCell::new(BTreeMap::new())) }
    }

    /// Run `address` at `flow_rate`, or change the rate if already running.
    ///
    /// A zero rate stops the channel.
    pub fn start(
        &self,
        address: Address,
        flow_rate: FlowRate,
    ) -> Result<(), ServiceError> {
        if flow_rate == 0 {
            self.stop(address);
            return Ok(());
        }

        // Switching reaches the bus; only map updates happen under the lock.
        let running = self
            .running
            .lock(|running| running.borrow_mut().remove(&address));
        if let Some(mut lease) = running {
            let changed = lease.try_on(flow_rate);
            self.keep(address, lease);
            return if changed {
                Ok(())
            } else {
                Err(ServiceError::Refused(address))
            };
        }

        let mut lease = self
            .pool
            .lend(address)
            .ok_or(ServiceError::Unavailable(address))?;
        if !lease.try_on(flow_rate) {
            return Err(ServiceError::Busy(self.pool.parallel_max()));
        }
        tracing::info!(address, flow_rate, "doser started");
        self.keep(address, lease);
        Ok(())
    }

    /// Stop `address` and return it to the pool. `false` if it was not
    /// started here.
    pub fn stop(&self, address: Address) -> bool {
        let lease = self
            .running
            .lock(|running| running.borrow_mut().remove(&address));
        match lease {
            Some(lease) => {
                lease.release();
                tracing::info!(address, "doser stopped");
                true
            }
            None => false,
        }
    }

    /// Stop every started channel. Returns how many were stopped.
    pub fn reset(&self) -> usize {
        let stopped = self
            .running
            .lock(|running| core::mem::take(&mut *running.borrow_mut()));
        let count = stopped.len();
        drop(stopped);
        tracing::info!(count, "all dosers stopped");
        count
    }

    /// Addresses currently started, ascending.
    pub fn running(&self) -> Vec<Address> {
        self.running.lock(|running| running.borrow().keys().copied().collect())
    }

    fn keep(&self, address: Address, lease: Lease<'p, M, B>) {
        let replaced = self
            .running
            .lock(|running| running.borrow_mut().insert(address, lease));
        drop(replaced);
    }
}
