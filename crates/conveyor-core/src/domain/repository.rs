//! Port traits for the Conveyor engine
//!
//! This module defines the traits the engine depends on for persistence
//! and messaging. External crates implement these traits to provide
//! different backends; the in-memory implementations live in the
//! `conveyor-channel` and `conveyor-state-inmemory` crates.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::oneshot;

use super::execution::{ExecutionContext, ExecutionData, RunId};
use super::message::{ExecutionReply, Message, MessageId};
use super::workflow::{WorkflowDefinition, WorkflowId};
use crate::{ConveyorError, DataPacket};

/// Handler invoked when a message exhausts its delivery attempts
pub type PoisonHandler = Box<dyn Fn(Message) + Send + Sync>;

/// At-least-once message channel with request/reply correlation
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Enqueue a message for delivery
    async fn enqueue(&self, message: Message) -> Result<(), ConveyorError>;

    /// Pull the next available message, `Ok(None)` when the queue is empty
    ///
    /// A dequeued message is invisible to other consumers until
    /// acknowledged, rejected, or its visibility window lapses, at which
    /// point it is redelivered.
    async fn dequeue(&self) -> Result<Option<Message>, ConveyorError>;

    /// Acknowledge a delivered message, removing it permanently
    async fn acknowledge(&self, message_id: &MessageId) -> Result<(), ConveyorError>;

    /// Return a delivered message to the queue, after `delay` if given
    ///
    /// A message rejected past its delivery limit is routed to the
    /// poison handler instead of requeued.
    async fn reject(
        &self,
        message_id: &MessageId,
        delay: Option<Duration>,
    ) -> Result<(), ConveyorError>;

    /// Enqueue a message and register interest in the run's reply
    ///
    /// At most one live reply registration per run; a second one for the
    /// same run fails with `TransportFailure`. Dropping the handle (or
    /// timing out) releases the registration.
    async fn enqueue_with_response(
        &self,
        message: Message,
        timeout: Duration,
    ) -> Result<ResponseHandle, ConveyorError>;

    /// Publish a run's successful result on its response subject
    ///
    /// No live registration is a no-op success; the poller may have
    /// gone away.
    async fn publish_result(&self, run_id: &RunId, output: DataPacket)
        -> Result<(), ConveyorError>;

    /// Publish a run's terminal error on its response subject
    ///
    /// Same no-op semantics as [`publish_result`](Self::publish_result).
    async fn publish_error(
        &self,
        run_id: &RunId,
        error: &ConveyorError,
    ) -> Result<(), ConveyorError>;

    /// Install the handler for messages that exhaust their delivery
    /// attempts, replacing any previous handler
    async fn on_poison(&self, handler: PoisonHandler) -> Result<(), ConveyorError>;
}

/// Durable state for runs: contexts, execution data, advisory locks, TTLs
#[async_trait]
pub trait RunStateStore: Send + Sync {
    /// Persist an execution context
    async fn save_context(&self, context: &ExecutionContext) -> Result<(), ConveyorError>;

    /// Load an execution context
    ///
    /// Returns `RunNotFound` for absent or TTL-expired runs.
    async fn find_context(&self, run_id: &RunId) -> Result<ExecutionContext, ConveyorError>;

    /// Persist a run's execution data
    async fn save_data(&self, run_id: &RunId, data: &ExecutionData) -> Result<(), ConveyorError>;

    /// Load a run's execution data
    ///
    /// Returns `RunNotFound` for absent or TTL-expired runs.
    async fn find_data(&self, run_id: &RunId) -> Result<ExecutionData, ConveyorError>;

    /// Delete a run's context and data
    async fn remove_state(&self, run_id: &RunId) -> Result<(), ConveyorError>;

    /// Whether a live (non-expired) context exists for the run
    async fn contains_context(&self, run_id: &RunId) -> Result<bool, ConveyorError>;

    /// Whether live execution data exists for the run
    async fn contains_data(&self, run_id: &RunId) -> Result<bool, ConveyorError>;

    /// Try to acquire the run's advisory lock, non-blocking
    ///
    /// Returns `false` when another holder owns it. The lock expires
    /// after `ttl` if not released, so a crashed holder cannot wedge a
    /// run forever. `holder` identifies the acquiring worker; the
    /// interface carries it so a distributed store can implement fenced
    /// ownership.
    async fn acquire_lock(
        &self,
        run_id: &RunId,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, ConveyorError>;

    /// Release the run's advisory lock
    ///
    /// Releasing a lock the holder no longer owns (expired and taken by
    /// someone else) is a no-op, not an error.
    async fn release_lock(&self, run_id: &RunId, holder: &str) -> Result<(), ConveyorError>;

    /// Set a retention TTL on a run's context and data
    ///
    /// After expiry both read back as `RunNotFound`.
    async fn set_ttl(&self, run_id: &RunId, ttl: Duration) -> Result<(), ConveyorError>;
}

/// Registry of workflow definitions
#[async_trait]
pub trait WorkflowRegistry: Send + Sync {
    /// Register a definition, replacing any existing one with the same ID
    ///
    /// The definition is validated before it is stored.
    async fn register(&self, definition: WorkflowDefinition) -> Result<(), ConveyorError>;

    /// Look up a definition, `None` when absent
    async fn find_by_id(&self, id: &WorkflowId) -> Result<Option<WorkflowDefinition>, ConveyorError>;

    /// Look up a definition, `WorkflowNotFound` when absent
    async fn get(&self, id: &WorkflowId) -> Result<WorkflowDefinition, ConveyorError> {
        self.find_by_id(id)
            .await?
            .ok_or_else(|| ConveyorError::WorkflowNotFound(id.0.clone()))
    }

    /// Whether a definition is registered under the ID
    async fn contains(&self, id: &WorkflowId) -> Result<bool, ConveyorError>;

    /// Remove a definition; `WorkflowNotFound` when absent
    async fn remove(&self, id: &WorkflowId) -> Result<(), ConveyorError>;

    /// List registered workflow IDs
    async fn list_ids(&self) -> Result<Vec<WorkflowId>, ConveyorError>;

    /// Number of registered definitions
    async fn count(&self) -> Result<usize, ConveyorError>;

    /// Remove all definitions
    async fn clear(&self) -> Result<(), ConveyorError>;
}

/// A pending terminal reply for a single run
///
/// Dropping the handle releases the reply registration so the run ID can
/// be awaited again.
pub struct ResponseHandle {
    receiver: Option<oneshot::Receiver<ExecutionReply>>,
    timeout: Duration,
    cleanup: Option<Box<dyn FnOnce() + Send>>,
}

impl ResponseHandle {
    /// Build a handle over a reply slot and a deregistration callback
    pub fn new(
        receiver: oneshot::Receiver<ExecutionReply>,
        timeout: Duration,
        cleanup: Box<dyn FnOnce() + Send>,
    ) -> Self {
        Self {
            receiver: Some(receiver),
            timeout,
            cleanup: Some(cleanup),
        }
    }

    /// Wait for the reply
    ///
    /// Yields `Ok(None)` when the timeout lapses first, releasing the
    /// registration. `TransportFailure` means the channel was torn down
    /// before a reply arrived.
    pub async fn wait(mut self) -> Result<Option<ExecutionReply>, ConveyorError> {
        let receiver = self
            .receiver
            .take()
            .ok_or_else(|| ConveyorError::TransportFailure("Reply already consumed".to_string()))?;

        match tokio::time::timeout(self.timeout, receiver).await {
            Ok(Ok(reply)) => Ok(Some(reply)),
            Ok(Err(_)) => Err(ConveyorError::TransportFailure(
                "Reply channel closed before a reply arrived".to_string(),
            )),
            Err(_) => Ok(None),
        }
    }
}

impl Drop for ResponseHandle {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

impl std::fmt::Debug for ResponseHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseHandle")
            .field("pending", &self.receiver.is_some())
            .field("timeout", &self.timeout)
            .finish()
    }
}
