//! Nested ESXi fleet provisioning against vCenter and a kickstart installer.

pub mod addressing;
pub mod backend;
pub mod config;
pub mod devices;
pub mod error;
pub mod fleet;
pub mod installer;
pub mod naming;
pub mod poll;
pub mod types;
pub mod worker;

pub use config::FleetConfig;
pub use error::{ErrorKind, ProvisionError, Result};
pub use fleet::{FleetController, FleetReport, RunOptions};
