use crate::domain::execution::ExecutionData;
use crate::{ConveyorError, DataPacket};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// Value object: Workflow definition ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId(pub String);

impl std::fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A parsed and validated workflow definition
///
/// Immutable once registered; re-registering the same ID replaces the
/// definition wholesale (callers needing versioning embed a version in the
/// ID).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// ID of the workflow
    pub id: WorkflowId,

    /// Human-readable name
    pub name: String,

    /// Description of the workflow
    pub description: Option<String>,

    /// The steps in this workflow, in execution order
    pub steps: Vec<Step>,
}

/// A step in a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Name of the step
    pub name: String,

    /// Whether child steps execute concurrently instead of in sequence
    pub parallel: bool,

    /// Child steps, in definition order
    pub child_steps: Vec<ChildStep>,
}

/// A child step: one primitive invocation with a request builder and a
/// response validation
///
/// Hooks are serializable strategy values rather than closures so a
/// definition can be persisted and versioned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChildStep {
    /// Name of the child step; outputs are merged under
    /// `<name>Result` / `<name>Completed`
    pub name: String,

    /// Name of the primitive invoked during the response phase
    pub primitive: String,

    /// How the request payload is built from execution data
    pub request: RequestSpec,

    /// Validation applied to the primitive's response
    pub validation: ValidationSpec,
}

/// Strategy for building a child step's request payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestSpec {
    /// Pass the full execution data map as the request payload
    PassThrough,

    /// Select named keys out of execution data; missing keys map to null
    SelectKeys {
        /// Keys copied into the request object
        keys: Vec<String>,
    },

    /// A fixed object merged over the execution data (template wins)
    Template {
        /// Template object
        template: Value,
    },
}

impl RequestSpec {
    /// Build the request payload from the current execution data
    pub fn build(&self, data: &ExecutionData) -> Result<DataPacket, ConveyorError> {
        match self {
            RequestSpec::PassThrough => DataPacket::from(data).map_err(Into::into),
            RequestSpec::SelectKeys { keys } => {
                let mut map = serde_json::Map::new();
                for key in keys {
                    let value = data.get(key).cloned().unwrap_or(Value::Null);
                    map.insert(key.clone(), value);
                }
                Ok(DataPacket::new(Value::Object(map)))
            }
            RequestSpec::Template { template } => {
                let base = serde_json::to_value(data)?;
                let mut map = match base {
                    Value::Object(map) => map,
                    _ => serde_json::Map::new(),
                };
                if let Value::Object(overrides) = template {
                    for (key, value) in overrides {
                        map.insert(key.clone(), value.clone());
                    }
                }
                Ok(DataPacket::new(Value::Object(map)))
            }
        }
    }
}

/// Validation applied to a primitive's response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValidationSpec {
    /// Accept any response
    None,

    /// Reject a null response
    NonNull,

    /// Require the response to be an object containing the named keys
    RequireKeys {
        /// Keys that must be present
        keys: Vec<String>,
    },
}

impl ValidationSpec {
    /// Check a response against this validation
    pub fn check(&self, child_step: &str, response: &DataPacket) -> Result<(), ConveyorError> {
        match self {
            ValidationSpec::None => Ok(()),
            ValidationSpec::NonNull => {
                if response.is_null() {
                    Err(ConveyorError::ValidationFailed(format!(
                        "Child step {} returned a null response",
                        child_step
                    )))
                } else {
                    Ok(())
                }
            }
            ValidationSpec::RequireKeys { keys } => {
                let obj = response.as_object().ok_or_else(|| {
                    ConveyorError::ValidationFailed(format!(
                        "Child step {} response is not an object",
                        child_step
                    ))
                })?;
                for key in keys {
                    if !obj.contains_key(key) {
                        return Err(ConveyorError::ValidationFailed(format!(
                            "Child step {} response missing key: {}",
                            child_step, key
                        )));
                    }
                }
                Ok(())
            }
        }
    }
}

impl WorkflowDefinition {
    /// Validate the workflow definition
    pub fn validate(&self) -> Result<(), ConveyorError> {
        if self.id.0.is_empty() {
            return Err(ConveyorError::ValidationFailed(
                "Workflow ID must not be empty".to_string(),
            ));
        }

        if self.steps.is_empty() {
            return Err(ConveyorError::ValidationFailed(
                "Workflow must have at least one step".to_string(),
            ));
        }

        let mut step_names = HashSet::new();
        for step in &self.steps {
            if !step_names.insert(step.name.as_str()) {
                return Err(ConveyorError::ValidationFailed(format!(
                    "Duplicate step name: {}",
                    step.name
                )));
            }

            if step.child_steps.is_empty() {
                return Err(ConveyorError::ValidationFailed(format!(
                    "Step {} must have at least one child step",
                    step.name
                )));
            }

            let mut child_names = HashSet::new();
            for child in &step.child_steps {
                if !child_names.insert(child.name.as_str()) {
                    return Err(ConveyorError::ValidationFailed(format!(
                        "Duplicate child step name in step {}: {}",
                        step.name, child.name
                    )));
                }
            }
        }

        Ok(())
    }

    /// Total number of steps
    #[inline]
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }
}
