//! # fanout-client
//!
//! The protocol client adapter the harness drives workers through.
//!
//! ## Features
//!
//! - **Adapter traits**: [`ProtocolClient`] and [`Conversation`] hide the SDK
//! - **Version registry**: [`VersionRegistry`] maps SDK versions to factories
//! - **Fault injection**: [`NetworkLink`] applies a worker's network conditions
//!   to every call and every delivered event
//! - **In-memory backend**: [`MemoryNetwork`] for tests and local runs
//!
//! ## Example
//!
//! ```ignore
//! use fanout_client::{ClientOptions, Identity, MemoryNetwork, NetworkLink};
//!
//! let network = MemoryNetwork::new();
//! let registry = network.registry();
//! let factory = &registry.latest().unwrap().factory;
//! let client = factory.create(&identity, &options, NetworkLink::new("alice")).await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod link;
pub mod memory;
pub mod registry;

pub use client::{
    decode_key, ClientError, ClientOptions, Conversation, EventStream, GroupOptions, Identity,
    PermissionPolicy, ProtocolClient,
};
pub use link::{LinkError, LinkStats, NetworkLink};
pub use memory::{
    MemoryClient, MemoryConversation, MemoryFactory, MemoryNetwork, GROUP_NAME_FIELD, SDK_VERSIONS,
};
pub use registry::{ClientFactory, RegisteredVersion, VersionRegistry};
