//! Workflow executor
//!
//! Drives submitted runs through their workflow definitions. A fixed
//! pool of workers polls the message channel; each run is owned by one
//! worker at a time, guarded by the store's advisory run lock. Context
//! and data are persisted at every step boundary so a redelivered run
//! resumes from the last completed step.

use chrono::Utc;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::domain::execution::{
    ExecutionContext, ExecutionData, ExecutionStatus, ExecutionStatusView, RunId, StepRecord,
};
use crate::domain::message::{ExecutionRequest, Message};
use crate::domain::repository::{MessageChannel, ResponseHandle, RunStateStore, WorkflowRegistry};
use crate::domain::workflow::{ChildStep, Step, WorkflowDefinition, WorkflowId};
use crate::resilience::CircuitBreaker;
use crate::{ConveyorError, PrimitiveResolver};

/// Executor configuration
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Number of worker tasks polling the channel
    pub worker_count: usize,

    /// Retries per step after the first attempt
    pub max_retries: u32,

    /// Delay between step retries
    pub retry_delay: Duration,

    /// Deadline for a single step (all its child steps)
    pub step_timeout: Duration,

    /// Deadline for a whole run, paused time excluded
    pub execution_timeout: Duration,

    /// Upper bound on concurrently running child steps of a parallel step
    pub parallel_fanout_limit: usize,

    /// TTL on the advisory run lock
    pub lock_ttl: Duration,

    /// Retention window applied to run state at terminal persist
    pub run_ttl: Duration,

    /// Worker sleep between empty polls; also the pause-park poll period
    pub poll_interval: Duration,

    /// Requeue delay applied when a message is rejected for lock contention
    pub redelivery_delay: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            max_retries: 2,
            retry_delay: Duration::from_millis(200),
            step_timeout: Duration::from_secs(30),
            execution_timeout: Duration::from_secs(300),
            parallel_fanout_limit: 8,
            lock_ttl: Duration::from_secs(60),
            run_ttl: Duration::from_secs(3600),
            poll_interval: Duration::from_millis(20),
            redelivery_delay: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct RunControl {
    cancel_requested: bool,
    pause_requested: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlSignal {
    Continue,
    Pause,
    Cancel,
}

/// How far a step got
enum StepRun {
    Done,
    Cancelled,
}

/// How far a run got on this delivery
enum DriveOutcome {
    Completed,
    Cancelled,
    /// Parked paused at shutdown; the message goes back to the queue
    Parked,
}

enum Handling {
    Ack,
    Requeue,
}

/// The workflow execution engine
///
/// All backends are injected through traits; the executor itself holds
/// no storage beyond in-flight control flags.
pub struct WorkflowExecutor {
    channel: Arc<dyn MessageChannel>,
    store: Arc<dyn RunStateStore>,
    registry: Arc<dyn WorkflowRegistry>,
    resolver: Arc<dyn PrimitiveResolver>,
    breaker: Arc<CircuitBreaker>,
    config: ExecutorConfig,
    control: RwLock<HashMap<String, RunControl>>,
    shutting_down: AtomicBool,
    shutdown_notify: Notify,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkflowExecutor {
    /// Create an executor over the given backends
    pub fn new(
        channel: Arc<dyn MessageChannel>,
        store: Arc<dyn RunStateStore>,
        registry: Arc<dyn WorkflowRegistry>,
        resolver: Arc<dyn PrimitiveResolver>,
        breaker: Arc<CircuitBreaker>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            channel,
            store,
            registry,
            resolver,
            breaker,
            config,
            control: RwLock::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Submit a run for a registered workflow
    ///
    /// Returns the run ID immediately; execution happens on the worker
    /// pool. Unknown workflow IDs fail here, before anything is
    /// enqueued.
    pub async fn submit_workflow(
        &self,
        workflow_id: &WorkflowId,
        input: ExecutionData,
    ) -> Result<RunId, ConveyorError> {
        let message = self.prepare_submission(workflow_id, &input).await?;
        let run_id = message.run_id.clone();
        self.channel.enqueue(message).await?;
        info!(workflow = %workflow_id, run = %run_id, "Run submitted");
        Ok(run_id)
    }

    /// Submit a run and register interest in its terminal reply
    ///
    /// The reply registration is live before the message is enqueued, so
    /// the reply cannot be lost to a race with a fast worker.
    pub async fn submit_workflow_with_response(
        &self,
        workflow_id: &WorkflowId,
        input: ExecutionData,
        timeout: Duration,
    ) -> Result<(RunId, ResponseHandle), ConveyorError> {
        let message = self.prepare_submission(workflow_id, &input).await?;
        let run_id = message.run_id.clone();
        let handle = self.channel.enqueue_with_response(message, timeout).await?;
        info!(workflow = %workflow_id, run = %run_id, "Run submitted, awaiting reply");
        Ok((run_id, handle))
    }

    async fn prepare_submission(
        &self,
        workflow_id: &WorkflowId,
        input: &ExecutionData,
    ) -> Result<Message, ConveyorError> {
        let definition = self.registry.get(workflow_id).await?;

        let context = ExecutionContext::new(workflow_id.clone(), definition.step_count());
        self.store.save_context(&context).await?;
        self.store.save_data(&context.run_id, input).await?;

        Message::execution_request(context.run_id, workflow_id.clone(), input.clone())
    }

    /// Current status view of a run
    pub async fn execution_status(
        &self,
        run_id: &RunId,
    ) -> Result<ExecutionStatusView, ConveyorError> {
        Ok(self.store.find_context(run_id).await?.status_view())
    }

    /// Request cooperative cancellation of a run
    ///
    /// Takes effect at the next step boundary (or between sequential
    /// child steps); never interrupts a primitive call in flight.
    pub async fn cancel_execution(&self, run_id: &RunId) -> Result<(), ConveyorError> {
        let context = self.store.find_context(run_id).await?;
        if context.is_terminal() {
            return Err(ConveyorError::ExecutionError(format!(
                "Run {} is already terminal",
                run_id
            )));
        }

        let mut control = self.control.write().await;
        control.entry(run_id.0.clone()).or_default().cancel_requested = true;
        info!(run = %run_id, "Cancellation requested");
        Ok(())
    }

    /// Request a cooperative pause at the next step boundary
    pub async fn pause_execution(&self, run_id: &RunId) -> Result<(), ConveyorError> {
        let context = self.store.find_context(run_id).await?;
        if context.is_terminal() {
            return Err(ConveyorError::ExecutionError(format!(
                "Run {} is already terminal",
                run_id
            )));
        }

        let mut control = self.control.write().await;
        control.entry(run_id.0.clone()).or_default().pause_requested = true;
        info!(run = %run_id, "Pause requested");
        Ok(())
    }

    /// Resume a paused run
    pub async fn resume_execution(&self, run_id: &RunId) -> Result<(), ConveyorError> {
        let context = self.store.find_context(run_id).await?;
        if context.is_terminal() {
            return Err(ConveyorError::ExecutionError(format!(
                "Run {} is already terminal",
                run_id
            )));
        }

        let mut control = self.control.write().await;
        if let Some(entry) = control.get_mut(&run_id.0) {
            entry.pause_requested = false;
        }
        info!(run = %run_id, "Resume requested");
        Ok(())
    }

    /// Start the worker pool
    ///
    /// Clears any previous shutdown, so a stopped executor can be
    /// restarted with a fresh pool.
    pub async fn spawn_workers(self: Arc<Self>) {
        self.shutting_down.store(false, Ordering::SeqCst);
        let mut workers = self.workers.lock().await;
        for index in 0..self.config.worker_count {
            let executor = Arc::clone(&self);
            let name = format!("worker-{}", index);
            workers.push(tokio::spawn(async move {
                executor.worker_loop(name).await;
            }));
        }
        info!(workers = self.config.worker_count, "Worker pool started");
    }

    /// Stop the worker pool and wait for in-flight runs to park or finish
    ///
    /// A run parked `Paused` at shutdown goes back to the queue. Its
    /// in-process pause flag does not survive the requeue, so it resumes
    /// on redelivery unless paused again.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.shutdown_notify.notify_waiters();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }
        info!("Worker pool stopped");
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    async fn worker_loop(&self, worker: String) {
        debug!(worker = %worker, "Worker started");
        loop {
            if self.is_shutting_down() {
                break;
            }

            match self.channel.dequeue().await {
                Ok(Some(message)) => {
                    self.handle_message(&worker, message).await;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = self.shutdown_notify.notified() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    warn!(worker = %worker, error = %e, "Dequeue failed");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
            }
        }
        debug!(worker = %worker, "Worker stopped");
    }

    async fn handle_message(&self, worker: &str, message: Message) {
        let run_id = message.run_id.clone();

        let request = match ExecutionRequest::from_packet(&message.payload) {
            Ok(request) => request,
            Err(e) => {
                // Malformed payload; rejection routes it to the poison
                // handler once its delivery attempts are spent
                warn!(run = %run_id, error = %e, "Undecodable execution request");
                if let Err(e) = self.channel.reject(&message.id, None).await {
                    warn!(run = %run_id, error = %e, "Reject failed");
                }
                return;
            }
        };

        match self
            .store
            .acquire_lock(&run_id, worker, self.config.lock_ttl)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(run = %run_id, worker = %worker, "Run locked elsewhere, requeueing");
                if let Err(e) = self
                    .channel
                    .reject(&message.id, Some(self.config.redelivery_delay))
                    .await
                {
                    warn!(run = %run_id, error = %e, "Reject failed");
                }
                return;
            }
            Err(e) => {
                warn!(run = %run_id, error = %e, "Lock acquisition failed");
                if let Err(e) = self
                    .channel
                    .reject(&message.id, Some(self.config.redelivery_delay))
                    .await
                {
                    warn!(run = %run_id, error = %e, "Reject failed");
                }
                return;
            }
        }

        let handling = match self.drive_run(worker, &run_id, &request).await {
            Ok(Handling::Ack) => self.channel.acknowledge(&message.id).await,
            Ok(Handling::Requeue) => {
                self.channel
                    .reject(&message.id, Some(self.config.redelivery_delay))
                    .await
            }
            Err(e) => {
                // Infrastructure failure; leave the run for redelivery
                error!(run = %run_id, error = %e, "Run handling failed");
                self.channel
                    .reject(&message.id, Some(self.config.redelivery_delay))
                    .await
            }
        };
        if let Err(e) = handling {
            warn!(run = %run_id, error = %e, "Channel operation failed");
        }

        if let Err(e) = self.store.release_lock(&run_id, worker).await {
            warn!(run = %run_id, error = %e, "Lock release failed");
        }
    }

    async fn drive_run(
        &self,
        worker: &str,
        run_id: &RunId,
        request: &ExecutionRequest,
    ) -> Result<Handling, ConveyorError> {
        let mut context = match self.store.find_context(run_id).await {
            Ok(context) => context,
            Err(ConveyorError::RunNotFound(_)) => {
                debug!(run = %run_id, "Stale delivery for an expired run");
                return Ok(Handling::Ack);
            }
            Err(e) => return Err(e),
        };

        if context.is_terminal() {
            debug!(run = %run_id, "Duplicate delivery for a finished run");
            return Ok(Handling::Ack);
        }

        let definition = match self.registry.get(&context.workflow_id).await {
            Ok(definition) => definition,
            Err(e @ ConveyorError::WorkflowNotFound(_)) => {
                // Definition removed between submit and pickup
                context.fail(&e)?;
                self.finish(&context, &request.input, Some(&e)).await?;
                return Ok(Handling::Ack);
            }
            Err(e) => return Err(e),
        };

        let mut data = match self.store.find_data(run_id).await {
            Ok(data) => data,
            Err(ConveyorError::RunNotFound(_)) => request.input.clone(),
            Err(e) => return Err(e),
        };

        if context.status == ExecutionStatus::Pending {
            context.start()?;
            self.store.save_context(&context).await?;
            info!(run = %run_id, worker = %worker, workflow = %context.workflow_id, "Run started");
        }

        let outcome = self
            .run_steps(&mut context, &mut data, &definition, run_id)
            .await;

        let handling = match outcome {
            Ok(DriveOutcome::Parked) => Ok(Handling::Requeue),
            Ok(DriveOutcome::Completed) => {
                context.complete()?;
                self.finish(&context, &data, None).await?;
                info!(run = %run_id, "Run completed");
                Ok(Handling::Ack)
            }
            Ok(DriveOutcome::Cancelled) => {
                context.cancel()?;
                let cause = ConveyorError::ExecutionError("Execution cancelled".to_string());
                self.finish(&context, &data, Some(&cause)).await?;
                info!(run = %run_id, "Run cancelled");
                Ok(Handling::Ack)
            }
            Err(cause) => {
                context.fail(&cause)?;
                self.finish(&context, &data, Some(&cause)).await?;
                warn!(run = %run_id, error = %cause, "Run failed");
                Ok(Handling::Ack)
            }
        };

        self.control.write().await.remove(&run_id.0);
        handling
    }

    /// Persist terminal state, apply retention, then publish the reply
    ///
    /// Publishing comes last and only logs on failure: the terminal
    /// persist must stand regardless of the channel's health.
    async fn finish(
        &self,
        context: &ExecutionContext,
        data: &ExecutionData,
        cause: Option<&ConveyorError>,
    ) -> Result<(), ConveyorError> {
        let run_id = context.run_id.clone();
        self.store.save_context(context).await?;
        self.store.save_data(&run_id, data).await?;
        self.store.set_ttl(&run_id, self.config.run_ttl).await?;

        let published = match cause {
            None => {
                let output = crate::DataPacket::from(data)?;
                self.channel.publish_result(&run_id, output).await
            }
            Some(error) => self.channel.publish_error(&run_id, error).await,
        };
        if let Err(e) = published {
            warn!(run = %run_id, error = %e, "Reply publish failed");
        }
        Ok(())
    }

    async fn run_steps(
        &self,
        context: &mut ExecutionContext,
        data: &mut ExecutionData,
        definition: &WorkflowDefinition,
        run_id: &RunId,
    ) -> Result<DriveOutcome, ConveyorError> {
        let mut deadline = Instant::now() + self.config.execution_timeout;

        while context.current_step_index < definition.steps.len() {
            match self.control_signal(run_id).await {
                ControlSignal::Cancel => return Ok(DriveOutcome::Cancelled),
                ControlSignal::Pause => {
                    if let Some(outcome) = self.park(context, data, run_id, &mut deadline).await? {
                        return Ok(outcome);
                    }
                }
                ControlSignal::Continue => {
                    if context.status == ExecutionStatus::Paused {
                        context.resume()?;
                        self.store.save_context(context).await?;
                    }
                }
            }

            if Instant::now() >= deadline {
                return Err(ConveyorError::Timeout(format!(
                    "Run {} exceeded the execution deadline",
                    run_id
                )));
            }

            let step = &definition.steps[context.current_step_index];
            context.last_attempted_step = Some(step.name.clone());

            let mut attempt: u32 = 0;
            loop {
                let result = match tokio::time::timeout(
                    self.config.step_timeout,
                    self.run_step(step, context, data, run_id),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ConveyorError::Timeout(format!(
                        "Step {} exceeded its deadline",
                        step.name
                    ))),
                };

                match result {
                    Ok(StepRun::Done) => break,
                    Ok(StepRun::Cancelled) => return Ok(DriveOutcome::Cancelled),
                    Err(cause) if attempt < self.config.max_retries => {
                        attempt += 1;
                        warn!(
                            run = %run_id,
                            step = %step.name,
                            attempt,
                            error = %cause,
                            "Step failed, retrying"
                        );
                        context.retry_from_step(context.current_step_index)?;
                        tokio::time::sleep(self.config.retry_delay).await;
                    }
                    Err(cause) => return Err(cause),
                }
            }

            let step_name = step.name.clone();
            context.advance_step(&step_name)?;
            // Step-boundary persistence: a redelivered run resumes here
            self.store.save_context(context).await?;
            self.store.save_data(run_id, data).await?;
            debug!(run = %run_id, step = %step_name, "Step completed");
        }

        Ok(DriveOutcome::Completed)
    }

    /// Park a paused run, polling for resume or cancel
    ///
    /// Returns `Some(outcome)` when the run should stop here; `None`
    /// after a resume. Parked time does not count against the execution
    /// deadline.
    async fn park(
        &self,
        context: &mut ExecutionContext,
        data: &ExecutionData,
        run_id: &RunId,
        deadline: &mut Instant,
    ) -> Result<Option<DriveOutcome>, ConveyorError> {
        if context.status != ExecutionStatus::Paused {
            context.pause()?;
            self.store.save_context(context).await?;
            self.store.save_data(run_id, data).await?;
            info!(run = %run_id, "Run paused");
        }

        let parked_at = Instant::now();
        loop {
            if self.is_shutting_down() {
                return Ok(Some(DriveOutcome::Parked));
            }
            tokio::time::sleep(self.config.poll_interval).await;

            match self.control_signal(run_id).await {
                ControlSignal::Cancel => return Ok(Some(DriveOutcome::Cancelled)),
                ControlSignal::Pause => {}
                ControlSignal::Continue => {
                    context.resume()?;
                    self.store.save_context(context).await?;
                    *deadline += parked_at.elapsed();
                    info!(run = %run_id, "Run resumed");
                    return Ok(None);
                }
            }
        }
    }

    async fn run_step(
        &self,
        step: &Step,
        context: &mut ExecutionContext,
        data: &mut ExecutionData,
        run_id: &RunId,
    ) -> Result<StepRun, ConveyorError> {
        let start_time = Utc::now();
        let mut keys_before: Vec<String> = data.iter().map(|(k, _)| k.clone()).collect();
        keys_before.sort();

        debug!(
            run = %run_id,
            step = %step.name,
            parallel = step.parallel,
            children = step.child_steps.len(),
            "Step started"
        );

        let (completed, failed, cancelled, first_error) = if step.parallel {
            self.run_parallel_children(step, data, run_id).await
        } else {
            self.run_sequential_children(step, context, data, run_id)
                .await
        };

        let mut keys_after: Vec<String> = data.iter().map(|(k, _)| k.clone()).collect();
        keys_after.sort();

        let record = StepRecord {
            step: step.name.clone(),
            start_time,
            end_time: Utc::now(),
            completed_child_steps: completed,
            failed_child_steps: failed,
            data_keys_before: keys_before,
            data_keys_after: keys_after,
        };
        data.insert(
            format!("{}Record", step.name),
            serde_json::to_value(&record)?,
        );

        if let Some(cause) = first_error {
            return Err(cause);
        }
        if cancelled {
            return Ok(StepRun::Cancelled);
        }
        Ok(StepRun::Done)
    }

    /// Run children in order; first failure aborts the remainder
    async fn run_sequential_children(
        &self,
        step: &Step,
        context: &mut ExecutionContext,
        data: &mut ExecutionData,
        run_id: &RunId,
    ) -> (usize, usize, bool, Option<ConveyorError>) {
        let mut completed = 0;
        let mut failed = 0;
        let mut first_error = None;

        for (index, child) in step.child_steps.iter().enumerate() {
            // Cancellation is observed between children, never mid-call
            if self.control_signal(run_id).await == ControlSignal::Cancel {
                return (completed, failed, true, None);
            }
            context.set_child_cursor(index);

            match self.run_child(child, data).await {
                Ok(response) => {
                    data.record_child_result(&child.name, response);
                    completed += 1;
                }
                Err(cause) => {
                    failed += 1;
                    first_error = Some(cause);
                    break;
                }
            }
        }

        (completed, failed, false, first_error)
    }

    /// Fan children out concurrently, bounded by the fan-out limit
    ///
    /// All children are joined regardless of individual failures; the
    /// first error (in definition order) becomes the step's error.
    async fn run_parallel_children(
        &self,
        step: &Step,
        data: &mut ExecutionData,
        run_id: &RunId,
    ) -> (usize, usize, bool, Option<ConveyorError>) {
        let semaphore = Arc::new(Semaphore::new(self.config.parallel_fanout_limit.max(1)));
        let snapshot = data.clone();

        let children = step.child_steps.iter().map(|child| {
            let semaphore = semaphore.clone();
            let snapshot = snapshot.clone();
            async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return (
                            child.name.clone(),
                            Err(ConveyorError::ExecutionError(
                                "Fan-out semaphore closed".to_string(),
                            )),
                        )
                    }
                };
                (child.name.clone(), self.run_child(child, &snapshot).await)
            }
        });

        let results = join_all(children).await;

        let mut completed = 0;
        let mut failed = 0;
        let mut first_error = None;
        for (name, result) in results {
            match result {
                Ok(response) => {
                    data.record_child_result(&name, response);
                    completed += 1;
                }
                Err(cause) => {
                    debug!(run = %run_id, child = %name, error = %cause, "Child step failed");
                    failed += 1;
                    if first_error.is_none() {
                        first_error = Some(cause);
                    }
                }
            }
        }

        (completed, failed, false, first_error)
    }

    /// One child step: build request, invoke the primitive through the
    /// circuit breaker, validate the response
    async fn run_child(
        &self,
        child: &ChildStep,
        data: &ExecutionData,
    ) -> Result<serde_json::Value, ConveyorError> {
        let request = child.request.build(data)?;
        let primitive = self.resolver.resolve(&child.primitive).await?;

        let response = self
            .breaker
            .call(&child.primitive, move || async move {
                primitive.invoke(request).await
            })
            .await?;

        child.validation.check(&child.name, &response)?;
        Ok(response.into_value())
    }

    async fn control_signal(&self, run_id: &RunId) -> ControlSignal {
        let control = self.control.read().await;
        match control.get(&run_id.0) {
            Some(flags) if flags.cancel_requested => ControlSignal::Cancel,
            Some(flags) if flags.pause_requested => ControlSignal::Pause,
            _ => ControlSignal::Continue,
        }
    }
}
