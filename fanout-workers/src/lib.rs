//! # fanout-workers
//!
//! Distributed test harness for a group messaging protocol.
//!
//! This crate drives fleets of simulated protocol clients and measures how
//! the protocol behaves under adverse conditions:
//! - Provisioning named workers with their own keys, installations and databases
//! - Per-worker network faults (latency, packet loss, disconnects, bandwidth)
//! - Stream delivery: reception and order across receivers
//! - Group epochs: membership churn, fork detection and repair
//!
//! ## Example
//!
//! ```ignore
//! use fanout_workers::{get_workers, verify_message_stream, ManagerOptions, VerifyOptions};
//!
//! let manager = get_workers(3, "smoke", ManagerOptions::new(registry)).await?;
//! let group = manager.create_group_between_all(None, &[]).await?;
//! let result = verify_message_stream(
//!     &group,
//!     &manager.get_all_but_creator(),
//!     10,
//!     &VerifyOptions::default(),
//! )
//! .await;
//! assert!(result.all_received);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod assertions;
pub mod config;
pub mod error;
pub mod forks;
pub mod keys;
pub mod manager;
pub mod netem;
pub mod streams;
pub mod verify;
pub mod worker;

#[cfg(test)]
mod scenarios;

pub use assertions::AssertionResult;
pub use config::{
    ConfigError, ForksConfig, HarnessConfig, NetworkConfig, StreamsConfig, WorkersConfig,
};
pub use error::{ForkError, Result, WorkerError};
pub use forks::{
    verify_epoch_change, EpochCheckOptions, EpochChecker, EpochReport, RoundOutcome, RoundReport,
};
pub use keys::{KeyCache, WorkerKeys};
pub use manager::{get_workers, ForkFlag, ForkScan, ManagerOptions, WorkerManager, WorkerSelector};
pub use netem::{ChaosHandle, NetworkSimulator};
pub use verify::{
    verify_consent_stream, verify_conversation_stream, verify_group_consent_stream,
    verify_membership_stream, verify_message_stream, verify_metadata_stream, VerificationResult,
    VerifyOptions,
};
pub use worker::{
    ObservedStreamEvent, ResponseMode, SyncMode, Worker, WorkerSettings, WorkerSummary, GM_REPLY,
};
