use crate::domain::workflow::WorkflowId;
use crate::ConveyorError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

/// Value object: Run ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    /// Generate a fresh run ID
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    /// Submitted but not yet picked up by a worker
    Pending,

    /// A worker is driving the step loop
    Running,

    /// All steps completed
    Completed,

    /// A step failed terminally, or a deadline was exceeded
    Failed,

    /// Cancelled at a step boundary
    Cancelled,

    /// Parked at a step boundary awaiting resume
    Paused,
}

impl ExecutionStatus {
    /// Whether this status is terminal
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

/// Mutable execution context, one per run
///
/// Status transitions are monotonic toward a terminal state; the only
/// reversible edge is Running <-> Paused. Step indices never decrease
/// except through `retry_from_step`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Unique run identifier
    pub run_id: RunId,

    /// Workflow definition this run executes
    pub workflow_id: WorkflowId,

    /// Current status
    pub status: ExecutionStatus,

    /// Index of the next step to execute (== step_count when completed)
    pub current_step_index: usize,

    /// Index of the next child step within the current step
    pub current_child_step_index: usize,

    /// Total number of steps, recorded at submission
    pub step_count: usize,

    /// When the worker started the step loop
    pub start_time: Option<DateTime<Utc>>,

    /// When the run reached a terminal state
    pub end_time: Option<DateTime<Utc>>,

    /// Human-readable error for failed runs
    pub error_message: Option<String>,

    /// Machine-readable error classification for failed runs
    pub error_class: Option<String>,

    /// Name of the last step the worker attempted
    pub last_attempted_step: Option<String>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl ExecutionContext {
    /// Create a new pending context for a submitted run
    pub fn new(workflow_id: WorkflowId, step_count: usize) -> Self {
        let now = Utc::now();
        Self {
            run_id: RunId::generate(),
            workflow_id,
            status: ExecutionStatus::Pending,
            current_step_index: 0,
            current_child_step_index: 0,
            step_count,
            start_time: None,
            end_time: None,
            error_message: None,
            error_class: None,
            last_attempted_step: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[inline]
    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Transition Pending -> Running
    pub fn start(&mut self) -> Result<(), ConveyorError> {
        if self.status != ExecutionStatus::Pending {
            return Err(ConveyorError::ExecutionError(format!(
                "Cannot start run in state: {:?}",
                self.status
            )));
        }
        self.status = ExecutionStatus::Running;
        self.start_time = Some(Utc::now());
        self.touch();
        Ok(())
    }

    /// Advance past a completed step
    pub fn advance_step(&mut self, step_name: &str) -> Result<(), ConveyorError> {
        if self.status != ExecutionStatus::Running {
            return Err(ConveyorError::ExecutionError(format!(
                "Cannot advance run in state: {:?}",
                self.status
            )));
        }
        self.last_attempted_step = Some(step_name.to_string());
        self.current_step_index += 1;
        self.current_child_step_index = 0;
        self.touch();
        Ok(())
    }

    /// Record the child-step cursor within the current step
    pub fn set_child_cursor(&mut self, child_index: usize) {
        self.current_child_step_index = child_index;
        self.touch();
    }

    /// Rewind to a step for an explicit retry
    ///
    /// The one sanctioned way indices may decrease.
    pub fn retry_from_step(&mut self, step_index: usize) -> Result<(), ConveyorError> {
        if self.status != ExecutionStatus::Running {
            return Err(ConveyorError::ExecutionError(format!(
                "Cannot retry run in state: {:?}",
                self.status
            )));
        }
        if step_index > self.current_step_index {
            return Err(ConveyorError::ExecutionError(format!(
                "Retry target {} is beyond current step {}",
                step_index, self.current_step_index
            )));
        }
        self.current_step_index = step_index;
        self.current_child_step_index = 0;
        self.touch();
        Ok(())
    }

    /// Transition Running -> Completed
    pub fn complete(&mut self) -> Result<(), ConveyorError> {
        if self.status != ExecutionStatus::Running {
            return Err(ConveyorError::ExecutionError(format!(
                "Cannot complete run in state: {:?}",
                self.status
            )));
        }
        self.status = ExecutionStatus::Completed;
        self.end_time = Some(Utc::now());
        self.touch();
        Ok(())
    }

    /// Transition to Failed with the error's message and classification
    pub fn fail(&mut self, error: &ConveyorError) -> Result<(), ConveyorError> {
        if self.status.is_terminal() {
            return Err(ConveyorError::ExecutionError(format!(
                "Cannot fail run in state: {:?}",
                self.status
            )));
        }
        self.status = ExecutionStatus::Failed;
        self.error_message = Some(error.to_string());
        self.error_class = Some(error.classification().to_string());
        self.end_time = Some(Utc::now());
        self.touch();
        Ok(())
    }

    /// Transition to Cancelled
    pub fn cancel(&mut self) -> Result<(), ConveyorError> {
        if self.status.is_terminal() {
            return Err(ConveyorError::ExecutionError(format!(
                "Cannot cancel run in state: {:?}",
                self.status
            )));
        }
        self.status = ExecutionStatus::Cancelled;
        self.end_time = Some(Utc::now());
        self.touch();
        Ok(())
    }

    /// Transition Running -> Paused
    pub fn pause(&mut self) -> Result<(), ConveyorError> {
        if self.status != ExecutionStatus::Running {
            return Err(ConveyorError::ExecutionError(format!(
                "Cannot pause run in state: {:?}",
                self.status
            )));
        }
        self.status = ExecutionStatus::Paused;
        self.touch();
        Ok(())
    }

    /// Transition Paused -> Running
    pub fn resume(&mut self) -> Result<(), ConveyorError> {
        if self.status != ExecutionStatus::Paused {
            return Err(ConveyorError::ExecutionError(format!(
                "Cannot resume run in state: {:?}",
                self.status
            )));
        }
        self.status = ExecutionStatus::Running;
        self.touch();
        Ok(())
    }

    /// Whether the run has reached a terminal state
    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Fraction of steps completed, in [0, 1]
    pub fn progress(&self) -> f64 {
        if self.step_count == 0 {
            return if self.is_terminal() { 1.0 } else { 0.0 };
        }
        (self.current_step_index as f64 / self.step_count as f64).clamp(0.0, 1.0)
    }

    /// Build the caller-facing status view
    pub fn status_view(&self) -> ExecutionStatusView {
        ExecutionStatusView {
            run_id: self.run_id.clone(),
            status: self.status,
            progress: self.progress(),
            current_step: self.last_attempted_step.clone(),
            error_message: self.error_message.clone(),
            error_class: self.error_class.clone(),
            is_terminal: self.is_terminal(),
        }
    }
}

/// Caller-facing status snapshot; JSON/REST shaping is left to the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStatusView {
    /// Run identifier
    pub run_id: RunId,

    /// Current status
    pub status: ExecutionStatus,

    /// Fraction of steps completed, in [0, 1]
    pub progress: f64,

    /// Name of the most recently attempted step
    pub current_step: Option<String>,

    /// Human-readable error for failed runs
    pub error_message: Option<String>,

    /// Machine-readable error classification for failed runs
    pub error_class: Option<String>,

    /// Whether the status is terminal
    pub is_terminal: bool,
}

/// Open key-value map for caller input and child-step outputs
///
/// Child step `x` merges its response under `xResult` and marks `xCompleted`.
/// Last writer wins.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct ExecutionData(HashMap<String, Value>);

impl ExecutionData {
    /// Create an empty data map
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    /// Look up a value by key
    #[inline]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Insert a value, replacing any previous one
    #[inline]
    pub fn insert(&mut self, key: String, value: Value) -> Option<Value> {
        self.0.insert(key, value)
    }

    /// Whether a key is present
    #[inline]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Number of entries
    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the map is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Merge another map into this one, last writer wins
    pub fn merge(&mut self, other: ExecutionData) {
        for (key, value) in other.0 {
            self.0.insert(key, value);
        }
    }

    /// Record a child step's successful output under the conventional keys
    pub fn record_child_result(&mut self, child_step: &str, response: Value) {
        self.0.insert(format!("{}Result", child_step), response);
        self.0
            .insert(format!("{}Completed", child_step), Value::Bool(true));
    }

    /// Iterate over entries
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

impl FromIterator<(String, Value)> for ExecutionData {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Per-run audit record for one step execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    /// Step name
    pub step: String,

    /// When the step started
    pub start_time: DateTime<Utc>,

    /// When the step finished (success or failure)
    pub end_time: DateTime<Utc>,

    /// Child steps that completed
    pub completed_child_steps: usize,

    /// Child steps that failed
    pub failed_child_steps: usize,

    /// Data keys present before the step ran
    pub data_keys_before: Vec<String>,

    /// Data keys present after the step ran
    pub data_keys_after: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn running_context() -> ExecutionContext {
        let mut ctx = ExecutionContext::new(WorkflowId("wf".to_string()), 3);
        ctx.start().unwrap();
        ctx
    }

    #[test]
    fn test_new_context_is_pending() {
        let ctx = ExecutionContext::new(WorkflowId("wf".to_string()), 2);
        assert_eq!(ctx.status, ExecutionStatus::Pending);
        assert_eq!(ctx.current_step_index, 0);
        assert_eq!(ctx.step_count, 2);
        assert!(ctx.start_time.is_none());
        assert!(!ctx.run_id.0.is_empty());
    }

    #[test]
    fn test_start_only_from_pending() {
        let mut ctx = running_context();
        assert_eq!(ctx.status, ExecutionStatus::Running);
        assert!(ctx.start_time.is_some());
        assert!(ctx.start().is_err());
    }

    #[test]
    fn test_advance_step_is_monotonic() {
        let mut ctx = running_context();
        ctx.advance_step("extract").unwrap();
        assert_eq!(ctx.current_step_index, 1);
        assert_eq!(ctx.last_attempted_step.as_deref(), Some("extract"));

        ctx.advance_step("transform").unwrap();
        assert_eq!(ctx.current_step_index, 2);
    }

    #[test]
    fn test_retry_from_step_rewinds() {
        let mut ctx = running_context();
        ctx.advance_step("extract").unwrap();
        ctx.advance_step("transform").unwrap();
        ctx.set_child_cursor(1);

        ctx.retry_from_step(1).unwrap();
        assert_eq!(ctx.current_step_index, 1);
        assert_eq!(ctx.current_child_step_index, 0);

        // Cannot retry beyond the current position
        assert!(ctx.retry_from_step(2).is_err());
    }

    #[test]
    fn test_complete_requires_running() {
        let mut ctx = running_context();
        ctx.complete().unwrap();
        assert_eq!(ctx.status, ExecutionStatus::Completed);
        assert!(ctx.end_time.is_some());
        assert!(ctx.is_terminal());

        let mut pending = ExecutionContext::new(WorkflowId("wf".to_string()), 1);
        assert!(pending.complete().is_err());
    }

    #[test]
    fn test_fail_records_message_and_class() {
        let mut ctx = running_context();
        let error = ConveyorError::Timeout("step deadline exceeded".to_string());
        ctx.fail(&error).unwrap();

        assert_eq!(ctx.status, ExecutionStatus::Failed);
        assert_eq!(ctx.error_class.as_deref(), Some("timeout"));
        assert!(ctx
            .error_message
            .as_deref()
            .unwrap()
            .contains("step deadline exceeded"));
    }

    #[test]
    fn test_terminal_states_are_sticky() {
        let mut ctx = running_context();
        ctx.complete().unwrap();
        assert!(ctx.fail(&ConveyorError::Other("late".into())).is_err());
        assert!(ctx.cancel().is_err());
        assert!(ctx.pause().is_err());
    }

    #[test]
    fn test_pause_resume_round_trip() {
        let mut ctx = running_context();
        ctx.pause().unwrap();
        assert_eq!(ctx.status, ExecutionStatus::Paused);
        assert!(!ctx.is_terminal());

        ctx.resume().unwrap();
        assert_eq!(ctx.status, ExecutionStatus::Running);

        // Resume only applies to paused runs
        assert!(ctx.resume().is_err());
    }

    #[test]
    fn test_cancel_from_pending_and_paused() {
        let mut pending = ExecutionContext::new(WorkflowId("wf".to_string()), 1);
        pending.cancel().unwrap();
        assert_eq!(pending.status, ExecutionStatus::Cancelled);

        let mut paused = running_context();
        paused.pause().unwrap();
        paused.cancel().unwrap();
        assert_eq!(paused.status, ExecutionStatus::Cancelled);
    }

    #[test]
    fn test_progress() {
        let mut ctx = running_context();
        assert_eq!(ctx.progress(), 0.0);
        ctx.advance_step("a").unwrap();
        assert!((ctx.progress() - 1.0 / 3.0).abs() < f64::EPSILON);
        ctx.advance_step("b").unwrap();
        ctx.advance_step("c").unwrap();
        assert_eq!(ctx.progress(), 1.0);
        ctx.complete().unwrap();
        assert_eq!(ctx.current_step_index, ctx.step_count);
    }

    #[test]
    fn test_status_view() {
        let mut ctx = running_context();
        ctx.advance_step("extract").unwrap();
        let view = ctx.status_view();
        assert_eq!(view.run_id, ctx.run_id);
        assert_eq!(view.status, ExecutionStatus::Running);
        assert_eq!(view.current_step.as_deref(), Some("extract"));
        assert!(!view.is_terminal);
        assert!(view.error_message.is_none());
    }

    #[test]
    fn test_context_serialization_round_trip() {
        let ctx = running_context();
        let serialized = serde_json::to_string(&ctx).unwrap();
        let deserialized: ExecutionContext = serde_json::from_str(&serialized).unwrap();
        assert_eq!(deserialized.run_id, ctx.run_id);
        assert_eq!(deserialized.status, ctx.status);
        assert_eq!(deserialized.step_count, ctx.step_count);
    }

    #[test]
    fn test_execution_data_record_child_result() {
        let mut data = ExecutionData::new();
        data.record_child_result("fetchA", json!({"rows": 10}));

        assert_eq!(data.get("fetchAResult").unwrap()["rows"], 10);
        assert_eq!(data.get("fetchACompleted"), Some(&json!(true)));
    }

    #[test]
    fn test_execution_data_last_writer_wins() {
        let mut data = ExecutionData::new();
        data.insert("key".to_string(), json!(1));
        data.insert("key".to_string(), json!(2));
        assert_eq!(data.get("key"), Some(&json!(2)));

        let mut other = ExecutionData::new();
        other.insert("key".to_string(), json!(3));
        data.merge(other);
        assert_eq!(data.get("key"), Some(&json!(3)));
    }

    #[test]
    fn test_execution_data_serializes_transparently() {
        let mut data = ExecutionData::new();
        data.insert("source".to_string(), json!("s3://bucket"));
        let value = serde_json::to_value(&data).unwrap();
        assert_eq!(value, json!({"source": "s3://bucket"}));
    }
}
