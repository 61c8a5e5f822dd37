use doser_icd::{Address, FlowRate};
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_time::{Duration, Timer};

use crate::backend::DoserBackend;
use crate::error::PoolError;
use crate::pool::DoserPool;

/// RAII handle granting exclusive control of one pump channel.
///
/// Dropping a lease switches its channel off if it was on, then returns the
/// address to the pool. Leases cannot be cloned; moving one moves the duty
/// of returning it. A lease on a channel whose earlier stop was refused
/// starts out on, so [`off`](Self::off) retries the stop.
pub struct Lease<'a, M: RawMutex, B: DoserBackend> {
    pool: &'a DoserPool<M, B>,
    address: Address,
    on: bool,
}

impl<'a, M: RawMutex, B: DoserBackend> Lease<'a, M, B> {
    /// Create a new lease. Only called by `DoserPool`.
    pub(crate) fn new(
        pool: &'a DoserPool<M, B>,
        address: Address,
        on: bool,
    ) -> Self {
        Self { pool, address, on }
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn is_on(&self) -> bool {
        self.on
    }

    /// Max flow rate of the leased channel.
    pub fn max_flow_rate(&self) -> FlowRate {
        self.pool
            .flow_rates()
            .get(self.address as usize)
            .copied()
            .unwrap_or(0)
    }

    /// Run the channel at `flow_rate`.
    ///
    /// An off channel first waits, without limit, for a budget slot. An on
    /// channel only changes its flow rate. A rate of 0 is the same as
    /// [`off`](Self::off). A refused command leaves the channel as it was.
    pub async fn on(
        &mut self,
        flow_rate: FlowRate,
    ) -> Result<(), PoolError<B::Error>> {
        if flow_rate == 0 {
            return self.off();
        }

        let newly_on = !self.on;
        if newly_on {
            self.pool.acquire_slot().await;
        }
        self.switch_on(flow_rate, newly_on)
    }

    /// Like [`on`](Self::on) but gives up instead of waiting for a slot.
    ///
    /// Returns `false` without any state change if the channel is off and
    /// the budget is exhausted, or if the backend refused the command.
    pub fn try_on(&mut self, flow_rate: FlowRate) -> bool {
        if flow_rate == 0 {
            return self.off().is_ok();
        }

        let newly_on = !self.on;
        if newly_on && !self.pool.try_acquire_slot() {
            return false;
        }
        self.switch_on(flow_rate, newly_on).is_ok()
    }

    /// Stop the channel and free its budget slot. No-op while off.
    ///
    /// If the backend refuses the stop the channel stays on, keeps its slot
    /// and the call can be repeated.
    pub fn off(&mut self) -> Result<(), PoolError<B::Error>> {
        if self.on {
            self.pool
                .switch_off(self.address)
                .map_err(PoolError::Refused)?;
            self.on = false;
        }
        Ok(())
    }

    /// Deliver `amount_ml` at `flow_rate` ml/min, then switch off.
    pub async fn dose(
        &mut self,
        amount_ml: f32,
        flow_rate: FlowRate,
    ) -> Result<(), PoolError<B::Error>> {
        if flow_rate == 0 || amount_ml <= 0.0 {
            return Ok(());
        }
        let micros = amount_ml / f32::from(flow_rate) * 60_000_000.0;

        self.on(flow_rate).await?;
        Timer::after(Duration::from_micros(micros as u64)).await;
        self.off()
    }

    fn switch_on(
        &mut self,
        flow_rate: FlowRate,
        newly_on: bool,
    ) -> Result<(), PoolError<B::Error>> {
        self.pool
            .switch_on(self.address, flow_rate, newly_on)
            .map_err(PoolError::Refused)?;
        self.on = true;
        Ok(())
    }

    /// Return the channel to the pool now.
    pub fn release(self) {
        drop(self)
    }
}

impl<M: RawMutex, B: DoserBackend> Drop for Lease<'_, M, B> {
    fn drop(&mut self) {
        if self.off().is_err() {
            warn!("Doser {} returned while still running", self.address);
        }
        self.pool.give_back(self.address);
    }
}

impl<M: RawMutex, B: DoserBackend> core::fmt::Debug for Lease<'_, M, B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Lease")
            .field("address", &self.address)
            .field("on", &self.on)
            .finish()
    }
}
