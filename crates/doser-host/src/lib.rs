//! Controller-side tools for the doser chain: configuration, the shared
//! application context and the command handlers behind `doserctl`.
pub mod cli;
pub mod commands;
pub mod config;
pub mod context;
pub mod service;

pub use config::HostConfig;
pub use context::{AppContext, ChainPool};
pub use doser_icd as icd;
pub use service::{DoserService, ServiceError};
