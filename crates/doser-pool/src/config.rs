use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[serde(default)]
pub struct PoolConfig {
    /// Channels allowed to run at the same time.
    pub parallel_max: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { parallel_max: 1 }
    }
}
