//!
//! Conveyor - Durable workflow execution engine
//!
//! Facade crate re-exporting the engine and its in-memory backends.
//! Most users depend on the member crates directly; this crate exists
//! for convenience and hosts the workspace integration tests.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub use conveyor_channel::{ChannelConfig, InMemoryMessageChannel};
pub use conveyor_core::*;
pub use conveyor_state_inmemory::{InMemoryRunStateStore, InMemoryWorkflowRegistry, StoreConfig};
