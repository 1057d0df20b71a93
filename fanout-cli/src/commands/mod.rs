//! CLI command implementations.
//!
//! Every scenario runs against a fresh in-memory network and returns a
//! serializable report; `main` prints it as JSON.

pub mod forks;
pub mod offline;
pub mod show_config;
pub mod streams;

use fanout_client::MemoryNetwork;
use fanout_workers::{AssertionResult, HarnessConfig, ManagerOptions};

/// Manager options for a run on `network`.
pub fn manager_options(network: &MemoryNetwork, config: &HarnessConfig) -> ManagerOptions {
    ManagerOptions::new(network.registry()).with_config(config.clone())
}

/// True if every check passed.
pub fn all_passed(checks: &[AssertionResult]) -> bool {
    checks.iter().all(|check| check.passed)
}
