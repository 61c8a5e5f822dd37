use std::path::Path;

use anyhow::Context;
use doser_chain::sim::SimModuleSpec;
use doser_chain::{ControllerConfig, ModuleConfig};
use doser_pool::PoolConfig;
use embassy_time::Duration;
use serde::{Deserialize, Serialize};

/// Everything `doserctl` needs, as read from a JSON file.
///
/// Every field may be omitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Simulated modules, nearest to the controller first.
    pub chain: Vec<SimModuleSpec>,
    pub module: ModuleTiming,
    pub controller: ControllerSettings,
    pub pool: PoolConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            chain: vec![
                SimModuleSpec { num_dosers: 2, max_flow_rate: 60 },
                SimModuleSpec { num_dosers: 1, max_flow_rate: 60 },
                SimModuleSpec { num_dosers: 3, max_flow_rate: 60 },
            ],
            module: ModuleTiming::default(),
            controller: ControllerSettings::default(),
            pool: PoolConfig::default(),
        }
    }
}

impl HostConfig {
    /// Read `path`, or fall back to defaults when no path is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))
    }
}

/// Module timing in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleTiming {
    pub retry_max: u32,
    pub response_timeout_ms: u64,
    pub retry_delay_ms: u64,
    pub probe_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub blink_period_ms: u64,
    /// Power-up time of a simulated module.
    pub boot_delay_ms: u64,
}

impl Default for ModuleTiming {
    fn default() -> Self {
        let config = ModuleConfig::default();
        Self {
            retry_max: config.retry_max,
            response_timeout_ms: config.response_timeout.as_millis(),
            retry_delay_ms: config.retry_delay.as_millis(),
            probe_timeout_ms: config.probe_timeout.as_millis(),
            poll_interval_ms: config.poll_interval.as_millis(),
            blink_period_ms: config.blink_period.as_millis(),
            boot_delay_ms: 2,
        }
    }
}

impl ModuleTiming {
    pub fn module_config(&self) -> ModuleConfig {
        ModuleConfig {
            retry_max: self.retry_max,
            response_timeout: Duration::from_millis(self.response_timeout_ms),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            blink_period: Duration::from_millis(self.blink_period_ms),
            ..ModuleConfig::default()
        }
    }

    pub fn boot_delay(&self) -> Duration {
        Duration::from_millis(self.boot_delay_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    /// `null` waits for the last module forever.
    pub idle_timeout_ms: Option<u64>,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self { idle_timeout_ms: Some(5_000) }
    }
}

impl ControllerSettings {
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            idle_timeout: self.idle_timeout_ms.map(Duration::from_millis),
        }
    }
}
