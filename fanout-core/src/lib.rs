//! # fanout-core
//!
//! Pure logic for the fanout harness (no I/O, instant tests).
//!
//! Everything here takes input and produces output without touching the
//! network, clocks or disk:
//! - [`stats`]: reception and order scoring for stream verification
//! - [`snapshot`]: cross-participant group snapshot comparison and epoch tracking
//! - [`fork`]: the churn / verify / repair state machine
//! - [`descriptor`]: `name-installation-version` worker descriptors
//! - [`names`]: the default worker name pool
//!
//! The actual I/O is performed by `fanout-workers`, which interprets the
//! actions produced by these state machines.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod descriptor;
pub mod fork;
pub mod names;
pub mod snapshot;
pub mod stats;

pub use descriptor::{DescriptorError, WorkerDescriptor, DEFAULT_INSTALLATION};
pub use fork::{ForkAction, ForkCheckState, ForkEvent, RepairPolicy};
pub use names::{default_names, DEFAULT_NAMES};
pub use snapshot::{
    compare_snapshots, Comparison, DivergenceReason, EpochRegression, EpochTracker,
    GroupEpochSnapshot,
};
pub use stats::{
    is_order_preserving, score, DeliveryStats, ObservedEvent, ReceiverObservation, ReceiverStats,
    SentEvent,
};
