//!
//! Conveyor State (in-memory) - Run state store and workflow registry
//!
//! In-process implementations of the [`conveyor_core::RunStateStore`]
//! and [`conveyor_core::WorkflowRegistry`] traits, with TTL-based
//! retention and advisory run locks.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Workflow registry implementation
pub mod registry;

/// Run state store implementation
pub mod store;

pub use registry::InMemoryWorkflowRegistry;
pub use store::{InMemoryRunStateStore, StoreConfig};
