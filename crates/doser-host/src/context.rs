use std::future::Future;

use doser_chain::sim::{SimChain, SimPort};
use doser_chain::BusBackend;
use doser_pool::DoserPool;
use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

use crate::config::HostConfig;
use crate::service::DoserService;

pub type ChainBackend<'a> = BusBackend<CriticalSectionRawMutex, SimPort<'a>>;
pub type ChainPool<'a> = DoserPool<CriticalSectionRawMutex, ChainBackend<'a>>;

/// State shared by every command handler.
pub struct AppContext<'a> {
    pub config: HostConfig,
    pub chain: &'a SimChain,
    pub pool: &'a ChainPool<'a>,
    pub dosers: DoserService<'a, CriticalSectionRawMutex, ChainBackend<'a>>,
}

impl<'a> AppContext<'a> {
    pub fn build_chain(config: &HostConfig) -> SimChain {
        SimChain::new(&config.chain).with_boot_delay(config.module.boot_delay())
    }

    pub fn build_pool(config: &HostConfig, chain: &'a SimChain) -> ChainPool<'a> {
        DoserPool::new(
            BusBackend::new(
                chain.controller(),
                config.controller.controller_config(),
            ),
            config.pool,
        )
    }

    pub fn new(
        config: HostConfig,
        chain: &'a SimChain,
        pool: &'a ChainPool<'a>,
    ) -> Self {
        Self { config, chain, pool, dosers: DoserService::new(pool) }
    }

    /// Run `task` while the simulated modules are alive.
    pub async fn drive<F: Future>(&self, task: F) -> F::Output {
        let modules = self.chain.run_modules(self.config.module.module_config());
        match select(task, modules).await {
            Either::First(output) => output,
            Either::Second(()) => core::future::pending().await,
        }
    }
}
