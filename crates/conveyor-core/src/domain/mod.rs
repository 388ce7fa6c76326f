/// Run execution domain models
pub mod execution;

/// Message envelopes and request/reply payloads
pub mod message;

/// Persistence and messaging port traits
pub mod repository;

/// Workflow definition domain models
pub mod workflow;
