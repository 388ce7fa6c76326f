use crate::domain::execution::{ExecutionData, RunId};
use crate::domain::workflow::WorkflowId;
use crate::{ConveyorError, DataPacket};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Value object: Message ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    /// Generate a fresh message ID
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Value object: Correlation ID, used to tie a reply back to its request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub String);

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Subject a run's terminal reply is published on
pub fn reply_subject(run_id: &RunId) -> String {
    format!("conveyor.results.{}", run_id)
}

/// An envelope travelling through the message channel
///
/// Delivery is at-least-once: a consumer may see the same message more
/// than once and must guard with the run lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: MessageId,

    /// Run this message belongs to
    pub run_id: RunId,

    /// Correlation ID; defaults to the run ID
    pub correlation_id: CorrelationId,

    /// Opaque payload
    pub payload: DataPacket,

    /// When the message was first enqueued
    pub timestamp: DateTime<Utc>,

    /// Subject the terminal reply for this run is published on
    pub response_subject: String,
}

impl Message {
    /// Create a new message for a run
    pub fn new(run_id: RunId, payload: DataPacket) -> Self {
        let response_subject = reply_subject(&run_id);
        Self {
            id: MessageId::generate(),
            correlation_id: CorrelationId(run_id.0.clone()),
            run_id,
            payload,
            timestamp: Utc::now(),
            response_subject,
        }
    }

    /// Create an execution request message
    pub fn execution_request(
        run_id: RunId,
        workflow_id: WorkflowId,
        input: ExecutionData,
    ) -> Result<Self, ConveyorError> {
        let request = ExecutionRequest { workflow_id, input };
        Ok(Self::new(run_id, request.to_packet()?))
    }
}

/// Request payload asking the engine to execute a workflow
///
/// The run ID travels on the envelope, not in the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// Workflow to execute
    pub workflow_id: WorkflowId,

    /// Caller-provided input, seeded into the run's execution data
    pub input: ExecutionData,
}

impl ExecutionRequest {
    /// Serialize into a message payload
    pub fn to_packet(&self) -> Result<DataPacket, ConveyorError> {
        DataPacket::from(self).map_err(Into::into)
    }

    /// Deserialize from a message payload
    pub fn from_packet(packet: &DataPacket) -> Result<Self, ConveyorError> {
        packet.to().map_err(Into::into)
    }
}

/// Terminal reply published on `conveyor.results.<runID>`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionReply {
    /// The run completed; carries the final execution data
    Result {
        /// Final execution data
        output: DataPacket,
    },

    /// The run failed or was cancelled
    Error {
        /// Human-readable error message
        message: String,

        /// Machine-readable classification
        class: String,
    },
}

impl ExecutionReply {
    /// Build the error variant from an engine error
    pub fn from_error(error: &ConveyorError) -> Self {
        ExecutionReply::Error {
            message: error.to_string(),
            class: error.classification().to_string(),
        }
    }
}
