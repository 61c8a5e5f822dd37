use serde::{Deserialize, Serialize};

use crate::{Address, FlowRate};

/// One module as registered during chain enumeration.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ModuleRecord {
    pub base_address: Address,
    pub num_dosers: u8,
    pub max_flow_rate: FlowRate,
}

impl ModuleRecord {
    /// Addresses owned by this module.
    pub fn addresses(&self) -> core::ops::Range<Address> {
        self.base_address..self.base_address + Address::from(self.num_dosers)
    }
}

/// Snapshot of one pump channel as seen by the controller.
#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DoserStatus {
    pub address: Address,
    pub max_flow_rate: FlowRate,
    /// Commanded flow rate, 0 while off.
    pub flow_rate: FlowRate,
    pub on: bool,
    pub leased: bool,
}
