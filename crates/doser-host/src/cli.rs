use std::path::PathBuf;

use clap::{Parser, Subcommand};
use doser_chain::sim::SimModuleSpec;

use crate::config::HostConfig;

#[derive(Parser, Debug)]
#[command(author, version, about = "Drive a simulated doser chain", long_about = None)]
pub struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Channel count of every module, nearest first, e.g. `2,1,3`
    #[arg(long, value_delimiter = ',', global = true)]
    pub chain: Option<Vec<u8>>,

    /// Max flow rate of every module, ml/min
    #[arg(long, global = true)]
    pub max_flow_rate: Option<u16>,

    /// Channels allowed to run at the same time
    #[arg(long, global = true)]
    pub parallel_max: Option<usize>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Commands {
    /// Enumerate the chain and list its modules
    Discover,
    /// Show every channel
    Status,
    /// Deliver a volume from one channel
    Dose {
        #[arg(short, long)]
        address: u32,

        #[arg(long)]
        amount_ml: f32,

        /// ml/min
        #[arg(short, long)]
        flow_rate: u16,
    },
    /// Start channels, hold them, then stop them all
    Run {
        #[arg(short, long, required = true)]
        address: Vec<u32>,

        /// ml/min
        #[arg(short, long)]
        flow_rate: u16,

        #[arg(long, default_value_t = 1000)]
        hold_ms: u64,
    },
}

impl Cli {
    /// Let command line flags win over the configuration file.
    pub fn apply(&self, config: &mut HostConfig) {
        if let Some(counts) = &self.chain {
            let max_flow_rate = self.max_flow_rate.unwrap_or(60);
            config.chain = counts
                .iter()
                .map(|&num_dosers| SimModuleSpec { num_dosers, max_flow_rate })
                .collect();
        } else if let Some(max_flow_rate) = self.max_flow_rate {
            for module in &mut config.chain {
                module.max_flow_rate = max_flow_rate;
            }
        }
        if let Some(parallel_max) = self.parallel_max {
            config.pool.parallel_max = parallel_max;
        }
    }
}
