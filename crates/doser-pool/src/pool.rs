use alloc::vec::Vec;
use core::cell::RefCell;

use doser_icd::{Address, DoserStatus, FlowRate};
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::semaphore::{GreedySemaphore, Semaphore};
use embassy_time::{with_timeout, Duration};

use crate::backend::DoserBackend;
use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::fmt::Dbg;
use crate::lease::Lease;

/// How often a waiting caller retries stopping channels whose stop command
/// was refused.
const STOP_RETRY: Duration = Duration::from_millis(10);

/// Bookkeeping for one pump channel.
#[derive(Debug, Clone, Copy)]
struct Channel {
    max_flow_rate: FlowRate,
    flow_rate: FlowRate,
    on: bool,
    leased: bool,
}

/// Available set plus per-channel flow state, guarded by one lock.
struct Ledger {
    channels: Vec<Channel>,
    leased: usize,
    active: usize,
}

/// Shared pool of pump channels.
///
/// The ledger lock is only held for bookkeeping updates. The power budget is
/// a separate semaphore so a caller waiting for a slot never stalls lending
/// or returning of other channels.
///
/// A channel only gives its slot back once the backend took the stop
/// command. A lease dropped while its stop is refused leaves the channel
/// stranded: on, unleased and still holding its slot. The pool retries the
/// stop before handing out another slot.
pub struct DoserPool<M: RawMutex, B: DoserBackend> {
    backend: B,
    ledger: Mutex<M, RefCell<Ledger>>,
    budget: GreedySemaphore<M>,
    parallel_max: usize,
}

impl<M: RawMutex, B: DoserBackend> DoserPool<M, B> {
    /// Create an empty pool. Call [`connect`](Self::connect) before lending.
    pub const fn new(backend: B, config: PoolConfig) -> Self {
        Self {
            backend,
            ledger: Mutex::new(RefCell::new(Ledger {
                channels: Vec::new(),
                leased: 0,
                active: 0,
            })),
            budget: GreedySemaphore::new(config.parallel_max),
            parallel_max: config.parallel_max,
        }
    }

    /// Enumerate the channels through the backend and mark all available.
    ///
    /// Returns the number of channels. Refuses to run while any lease from
    /// the previous epoch is still outstanding.
    pub async fn connect(&self) -> Result<usize, PoolError<B::Error>> {
        let leased = self.leased();
        if leased > 0 {
            return Err(PoolError::InUse(leased));
        }

        let flow_rates = match self.backend.connect().await {
            Ok(flow_rates) => flow_rates,
            Err(e) => {
                warn!("Doser enumeration failed: {:?}", Dbg(&e));
                return Err(PoolError::Backend(e));
            }
        };
        if flow_rates.is_empty() {
            warn!("Doser enumeration found no channels");
            return Err(PoolError::NoDosers);
        }

        let (count, stranded) = self.ledger.lock(|ledger| {
            let mut ledger = ledger.borrow_mut();
            if ledger.leased > 0 {
                return Err(PoolError::InUse(ledger.leased));
            }
            ledger.channels = flow_rates
                .iter()
                .map(|&max_flow_rate| Channel {
                    max_flow_rate,
                    flow_rate: 0,
                    on: false,
                    leased: false,
                })
                .collect();
            let stranded = core::mem::take(&mut ledger.active);
            Ok((ledger.channels.len(), stranded))
        })?;

        // Enumeration leaves every channel stopped.
        if stranded > 0 {
            debug!("Reclaiming {} slots of stopped dosers", stranded);
            self.budget.release(stranded);
        }
        info!("Connected {} dosers", count);
        Ok(count)
    }

    /// Take exclusive ownership of one channel.
    ///
    /// Returns `None` if the address is out of range or already on loan.
    /// Never waits.
    pub fn lend<A: TryInto<Address>>(
        &self,
        address: A,
    ) -> Option<Lease<'_, M, B>> {
        let address = address.try_into().ok()?;
        let granted = self.ledger.lock(|ledger| {
            let mut ledger = ledger.borrow_mut();
            let ledger = &mut *ledger;
            match ledger.channels.get_mut(address as usize) {
                Some(channel) if !channel.leased => {
                    channel.leased = true;
                    ledger.leased += 1;
                    Some(channel.on)
                }
                _ => None,
            }
        });

        let on = granted?;
        debug!("Lent doser {}", address);
        Some(Lease::new(self, address, on))
    }

    /// Addresses not currently on loan, ascending.
    pub fn available(&self) -> Vec<Address> {
        self.ledger.lock(|ledger| {
            ledger
                .borrow()
                .channels
                .iter()
                .zip(0..)
                .filter(|(channel, _)| !channel.leased)
                .map(|(_, address)| address)
                .collect()
        })
    }

    /// Max flow rate per address.
    pub fn flow_rates(&self) -> Vec<FlowRate> {
        self.ledger.lock(|ledger| {
            ledger
                .borrow()
                .channels
                .iter()
                .map(|channel| channel.max_flow_rate)
                .collect()
        })
    }

    /// Snapshot of every channel.
    pub fn status(&self) -> Vec<DoserStatus> {
        self.ledger.lock(|ledger| {
            ledger
                .borrow()
                .channels
                .iter()
                .zip(0..)
                .map(|(channel, address)| DoserStatus {
                    address,
                    max_flow_rate: channel.max_flow_rate,
                    flow_rate: channel.flow_rate,
                    on: channel.on,
                    leased: channel.leased,
                })
                .collect()
        })
    }

    /// Number of channels discovered in this epoch.
    pub fn len(&self) -> usize {
        self.ledger.lock(|ledger| ledger.borrow().channels.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of channels currently switched on.
    pub fn active(&self) -> usize {
        self.ledger.lock(|ledger| ledger.borrow().active)
    }

    /// Number of outstanding leases.
    pub fn leased(&self) -> usize {
        self.ledger.lock(|ledger| ledger.borrow().leased)
    }

    pub fn parallel_max(&self) -> usize {
        self.parallel_max
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Wait until a budget slot is free and keep it.
    pub(crate) async fn acquire_slot(&self) {
        loop {
            if self.try_acquire_slot() {
                return;
            }
            trace!("Waiting for a free doser slot");
            let slot = if self.has_stranded() {
                match with_timeout(STOP_RETRY, self.budget.acquire(1)).await {
                    Ok(slot) => slot,
                    Err(_) => continue,
                }
            } else {
                self.budget.acquire(1).await
            };
            match slot {
                Ok(slot) => {
                    slot.disarm();
                    return;
                }
                Err(never) => match never {},
            }
        }
    }

    /// Take a budget slot if one is free right now.
    pub(crate) fn try_acquire_slot(&self) -> bool {
        self.stop_stranded();
        match self.budget.try_acquire(1) {
            Some(slot) => {
                slot.disarm();
                true
            }
            None => false,
        }
    }

    /// Command a channel that already holds a budget slot.
    ///
    /// `flow_rate` is clamped to the channel's max when the max is known. If
    /// the backend refuses, a newly switched channel hands its slot back.
    pub(crate) fn switch_on(
        &self,
        address: Address,
        flow_rate: FlowRate,
        newly_on: bool,
    ) -> Result<(), B::Error> {
        let max_flow_rate = self.ledger.lock(|ledger| {
            ledger
                .borrow()
                .channels
                .get(address as usize)
                .map_or(0, |channel| channel.max_flow_rate)
        });
        let flow_rate = if max_flow_rate > 0 && flow_rate > max_flow_rate {
            warn!(
                "Doser {} limited to {} ml/min (requested {})",
                address, max_flow_rate, flow_rate
            );
            max_flow_rate
        } else {
            flow_rate
        };

        if let Err(e) = self.backend.turn_on(address, flow_rate) {
            warn!(
                "Doser {} refused {} ml/min: {:?}",
                address,
                flow_rate,
                Dbg(&e)
            );
            if newly_on {
                self.budget.release(1);
            }
            return Err(e);
        }
        self.ledger.lock(|ledger| {
            let mut ledger = ledger.borrow_mut();
            let ledger = &mut *ledger;
            if let Some(channel) = ledger.channels.get_mut(address as usize) {
                channel.flow_rate = flow_rate;
                channel.on = true;
                if newly_on {
                    ledger.active += 1;
                }
            }
        });
        Ok(())
    }

    /// Stop a channel and hand its budget slot back.
    ///
    /// On `Err` the channel is still running and keeps its slot.
    pub(crate) fn switch_off(
        &self,
        address: Address,
    ) -> Result<(), B::Error> {
        if let Err(e) = self.backend.turn_off(address) {
            warn!("Doser {} refused to stop: {:?}", address, Dbg(&e));
            return Err(e);
        }
        self.ledger.lock(|ledger| {
            let mut ledger = ledger.borrow_mut();
            let ledger = &mut *ledger;
            if let Some(channel) = ledger.channels.get_mut(address as usize) {
                channel.flow_rate = 0;
                channel.on = false;
                ledger.active = ledger.active.saturating_sub(1);
            }
        });
        self.budget.release(1);
        Ok(())
    }

    fn has_stranded(&self) -> bool {
        self.ledger.lock(|ledger| {
            ledger
                .borrow()
                .channels
                .iter()
                .any(|channel| channel.on && !channel.leased)
        })
    }

    /// Retry the stop of every channel left running without a lease.
    ///
    /// Each one is lent to the pool itself and dropped again, which sends
    /// the stop and returns the slot once the backend takes it.
    fn stop_stranded(&self) {
        let stranded: Vec<Address> = self.ledger.lock(|ledger| {
            ledger
                .borrow()
                .channels
                .iter()
                .zip(0..)
                .filter(|(channel, _)| channel.on && !channel.leased)
                .map(|(_, address)| address)
                .collect()
        });
        for address in stranded {
            debug!("Retrying stop of doser {}", address);
            drop(self.lend(address));
        }
    }

    /// Put a channel back into the available set.
    pub(crate) fn give_back(&self, address: Address) {
        self.ledger.lock(|ledger| {
            let mut ledger = ledger.borrow_mut();
            let ledger = &mut *ledger;
            if let Some(channel) = ledger.channels.get_mut(address as usize) {
                channel.leased = false;
                ledger.leased = ledger.leased.saturating_sub(1);
            }
        });
        debug!("Doser {} returned", address);
    }
}
