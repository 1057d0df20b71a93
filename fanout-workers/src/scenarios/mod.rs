//! End-to-end harness scenarios.
//!
//! Every scenario provisions real [`WorkerManager`]s over a fresh
//! [`MemoryNetwork`], so they run in-process without external services.
//!
//! - `streams` - reception and order for every stream kind
//! - `network` - per-worker fault profiles and chaos schedules
//! - `forks` - epoch churn, fork probes and convergence
//! - `offline` - terminate, miss traffic, reconnect and recover

mod forks;
mod network;
mod offline;
mod streams;

use std::sync::Arc;
use std::time::Duration;

use fanout_client::MemoryNetwork;

use crate::keys::KeyCache;
use crate::manager::{get_workers, ManagerOptions, WorkerManager, WorkerSelector};
use crate::verify::VerifyOptions;

/// Manager options over `network` with throwaway keys.
fn options(network: &MemoryNetwork) -> ManagerOptions {
    ManagerOptions::new(network.registry()).with_keys(Arc::new(KeyCache::generated()))
}

/// Provision `selector` on a fresh network.
async fn setup(
    selector: impl Into<WorkerSelector>,
    test_name: &str,
) -> (MemoryNetwork, WorkerManager) {
    let network = MemoryNetwork::new();
    let manager = get_workers(selector, test_name, options(&network))
        .await
        .unwrap();
    (network, manager)
}

/// Short verification window so fault scenarios finish quickly.
fn quick(timeout_ms: u64) -> VerifyOptions {
    VerifyOptions::default()
        .with_timeout(Duration::from_millis(timeout_ms))
        .with_tag("scenario")
}
