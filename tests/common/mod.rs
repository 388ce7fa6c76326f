//! Shared harness for the workspace integration tests

use std::sync::Arc;
use std::time::Duration;

use conveyor::{
    ChannelConfig, ChildStep, CircuitBreaker, CircuitBreakerConfig, ConveyorError,
    ExecutionStatusView, ExecutorConfig, InMemoryMessageChannel, InMemoryRunStateStore,
    InMemoryWorkflowRegistry, RequestSpec, RunId, StaticPrimitiveResolver, Step, ValidationSpec,
    WorkflowDefinition, WorkflowExecutor, WorkflowId,
};

pub struct Harness {
    pub executor: Arc<WorkflowExecutor>,
    pub channel: Arc<InMemoryMessageChannel>,
    pub store: Arc<InMemoryRunStateStore>,
    pub registry: Arc<InMemoryWorkflowRegistry>,
}

/// Executor settings tightened for fast tests
pub fn fast_config() -> ExecutorConfig {
    ExecutorConfig {
        worker_count: 2,
        max_retries: 0,
        retry_delay: Duration::from_millis(10),
        step_timeout: Duration::from_secs(5),
        execution_timeout: Duration::from_secs(10),
        poll_interval: Duration::from_millis(5),
        redelivery_delay: Duration::from_millis(10),
        ..ExecutorConfig::default()
    }
}

pub async fn start(
    resolver: StaticPrimitiveResolver,
    config: ExecutorConfig,
    breaker: CircuitBreakerConfig,
) -> Harness {
    let channel = Arc::new(InMemoryMessageChannel::new(ChannelConfig {
        visibility_timeout: Duration::from_secs(5),
        max_deliver: 5,
    }));
    let store = Arc::new(InMemoryRunStateStore::with_defaults());
    let registry = Arc::new(InMemoryWorkflowRegistry::new());

    let executor = Arc::new(WorkflowExecutor::new(
        channel.clone(),
        store.clone(),
        registry.clone(),
        Arc::new(resolver),
        Arc::new(CircuitBreaker::new(breaker)),
        config,
    ));
    executor.clone().spawn_workers().await;

    Harness {
        executor,
        channel,
        store,
        registry,
    }
}

pub fn child(name: &str, primitive: &str) -> ChildStep {
    checked_child(name, primitive, ValidationSpec::None)
}

pub fn checked_child(name: &str, primitive: &str, validation: ValidationSpec) -> ChildStep {
    ChildStep {
        name: name.to_string(),
        primitive: primitive.to_string(),
        request: RequestSpec::PassThrough,
        validation,
    }
}

pub fn step(name: &str, parallel: bool, children: Vec<ChildStep>) -> Step {
    Step {
        name: name.to_string(),
        parallel,
        child_steps: children,
    }
}

pub fn definition(id: &str, steps: Vec<Step>) -> WorkflowDefinition {
    WorkflowDefinition {
        id: WorkflowId(id.to_string()),
        name: format!("Workflow {}", id),
        description: None,
        steps,
    }
}

/// Poll until the run reaches a terminal state
pub async fn wait_for_terminal(
    executor: &WorkflowExecutor,
    run_id: &RunId,
    deadline: Duration,
) -> Result<ExecutionStatusView, ConveyorError> {
    let started = tokio::time::Instant::now();
    loop {
        let view = executor.execution_status(run_id).await?;
        if view.is_terminal {
            return Ok(view);
        }
        if started.elapsed() > deadline {
            panic!("Run {} did not finish in time: {:?}", run_id, view.status);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until the run reports the given status
pub async fn wait_for_status(
    executor: &WorkflowExecutor,
    run_id: &RunId,
    wanted: conveyor::ExecutionStatus,
    deadline: Duration,
) -> ExecutionStatusView {
    let started = tokio::time::Instant::now();
    loop {
        let view = executor
            .execution_status(run_id)
            .await
            .expect("status lookup");
        if view.status == wanted {
            return view;
        }
        if started.elapsed() > deadline {
            panic!(
                "Run {} never reached {:?}, last seen {:?}",
                run_id, wanted, view.status
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
