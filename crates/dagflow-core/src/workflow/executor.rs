//! Workflow engine: FIFO ready-queue DAG execution with durable checkpointing.
//!
//! The engine drains a queue of ready step IDs in batches of up to N (the
//! execution's concurrency limit). A batch of one runs inline; larger
//! batches run concurrently in a `JoinSet` and are awaited together. Every
//! step is checkpointed before (`step_starting`) and after
//! (`step_completed`/`step_failed`) it runs.
//!
//! # Single writer
//!
//! The drain loop owns the `ExecutionContext` and `ExecutionState`. Step
//! tasks only see snapshots and hand their `StepOutcome` back; retry notices
//! reach the loop over an mpsc channel. No lock guards the step or variable
//! maps because nothing else can reach them.
//!
//! # Execution flow
//!
//! 1. Validate and normalize the document, persist it, checkpoint
//!    `execution_started`, and seed the queue with the entry steps (or, on
//!    resume, with the unfinished frontier).
//! 2. Pop a batch; for each step check cancel/pause, skip finished steps
//!    (still enqueuing their successors), evaluate the `when` guard.
//! 3. Run the batch, apply outcomes in batch order, enqueue successors.
//! 4. On a failure with no `on_error` fallback stop taking new work.
//! 5. Checkpoint the terminal status and notify observers.

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dagflow_types::config::EngineConfig;
use dagflow_types::execution::{CheckpointType, ExecutionState, ExecutionStatus, StepResult, StepStatus};
use dagflow_types::workflow::{StepDefinition, WorkflowDefinition};
use dashmap::DashMap;
use futures_util::FutureExt;
use serde_json::{Map, Value, json};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::repository::state::StateStore;

use super::checkpoint::{CheckpointError, CheckpointManager};
use super::context::ExecutionContext;
use super::dag;
use super::definition::{WorkflowError, validate_definition};
use super::expression::ExpressionEvaluator;
use super::recovery::ResumePoint;
use super::step_runner::{RetryNotice, StepOutcome, StepRunner};
use super::task::TaskRegistry;

// ---------------------------------------------------------------------------
// Observers
// ---------------------------------------------------------------------------

/// Fire-and-forget notification hooks.
///
/// Called from the drain loop. A panicking observer is logged and ignored.
pub trait ExecutionObserver: Send + Sync {
    fn on_step_complete(&self, _context: &ExecutionContext, _result: &StepResult) {}

    fn on_execution_complete(&self, _context: &ExecutionContext, _status: ExecutionStatus) {}
}

// ---------------------------------------------------------------------------
// ExecutionResult
// ---------------------------------------------------------------------------

/// Result of a finished, paused or cancelled execution.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub execution_id: Uuid,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    /// Final context (step results, variables).
    pub context: ExecutionContext,
    /// Final durable state, as last persisted.
    pub state: ExecutionState,
    /// Identifying error when the execution failed or was cancelled.
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Per-execution bookkeeping
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct ExecutionControl {
    cancel: CancellationToken,
    pause: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Halt {
    Cancelled,
    Paused,
    TimedOut(f64),
}

/// Mutable state of one drain loop.
struct Run {
    def: Arc<WorkflowDefinition>,
    ctx: ExecutionContext,
    state: ExecutionState,
    queue: VecDeque<String>,
    visited: HashSet<String>,
    control: ExecutionControl,
    /// `depends_on` joins reached before all their predecessors finished.
    waiting: Vec<String>,
    /// Step ID and error of the first unhandled failure.
    fatal: Option<(String, String)>,
}

impl Run {
    fn halt_requested(&self) -> Option<Halt> {
        if self.control.cancel.is_cancelled() {
            Some(Halt::Cancelled)
        } else if self.control.pause.is_cancelled() {
            Some(Halt::Paused)
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// DAG workflow engine with durable checkpointing.
///
/// Generic over `S: StateStore` for storage flexibility. Engines share
/// nothing unless the host attaches the same process-wide pool to several.
pub struct WorkflowEngine<S: StateStore> {
    checkpoints: CheckpointManager<S>,
    runner: Arc<StepRunner>,
    config: EngineConfig,
    observers: Vec<Arc<dyn ExecutionObserver>>,
    /// Bounds step concurrency across executions when set.
    shared_pool: Option<Arc<Semaphore>>,
    /// Cancel/pause tokens of executions currently draining, keyed by ID.
    controls: DashMap<Uuid, ExecutionControl>,
}

impl<S: StateStore + 'static> WorkflowEngine<S> {
    pub fn new(store: Arc<S>, registry: Arc<TaskRegistry>, config: EngineConfig) -> Self {
        let runner = StepRunner::new(registry, Arc::new(ExpressionEvaluator::new()), config.clone());
        Self {
            checkpoints: CheckpointManager::new(store),
            runner: Arc::new(runner),
            config,
            observers: Vec::new(),
            shared_pool: None,
            controls: DashMap::new(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Attach a semaphore shared with other engines or executions.
    pub fn with_shared_pool(mut self, pool: Arc<Semaphore>) -> Self {
        self.shared_pool = Some(pool);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        self.checkpoints.store()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// True while the execution is draining in this engine.
    pub fn is_active(&self, execution_id: Uuid) -> bool {
        self.controls.contains_key(&execution_id)
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    /// Start a new execution of `definition`.
    pub async fn execute(
        &self,
        definition: &WorkflowDefinition,
        variables: Map<String, Value>,
        trigger_payload: Option<Value>,
    ) -> Result<ExecutionResult, EngineError> {
        self.execute_with_id(Uuid::now_v7(), definition, variables, trigger_payload)
            .await
    }

    /// Start a new execution under a caller-chosen ID.
    pub async fn execute_with_id(
        &self,
        execution_id: Uuid,
        definition: &WorkflowDefinition,
        variables: Map<String, Value>,
        trigger_payload: Option<Value>,
    ) -> Result<ExecutionResult, EngineError> {
        validate_definition(definition)?;
        if self.is_active(execution_id) {
            return Err(EngineError::AlreadyActive(execution_id));
        }

        if let Err(e) = self.store().save_definition(definition).await {
            tracing::warn!(workflow_id = %definition.id, error = %e, "failed to persist workflow definition");
        }

        let def = Arc::new(dag::normalize(definition));
        let ctx = ExecutionContext::new(execution_id, definition, variables, trigger_payload.clone());
        let mut state = ExecutionState::new(execution_id, &definition.id, definition.steps.len());
        state.variables = ctx.variables.clone();
        state.trigger_payload = trigger_payload;

        let entries = dag::entry_steps(&def);
        tracing::info!(
            execution_id = %execution_id,
            workflow_id = %definition.id,
            steps = definition.steps.len(),
            entry_steps = ?entries,
            "starting workflow execution"
        );

        self.checkpoints
            .save_checkpoint(
                &mut state,
                CheckpointType::ExecutionStarted,
                None,
                None,
                Some(json!({ "workflow_id": definition.id, "entry_steps": entries })),
            )
            .await;

        let mut run = self.begin(def, ctx, state, VecDeque::new(), HashSet::new())?;
        for id in entries {
            let index = run.def.step_index(&id);
            run.visited.insert(id.clone());
            self.checkpoints
                .save_checkpoint(&mut run.state, CheckpointType::StepQueued, Some(&id), index, None)
                .await;
            run.queue.push_back(id);
        }
        Ok(self.drive(run).await)
    }

    /// Re-enter the drain loop from a resume point produced by recovery.
    ///
    /// The `execution_resumed` checkpoint was already written by the
    /// recovery service.
    pub async fn resume(&self, point: ResumePoint) -> Result<ExecutionResult, EngineError> {
        let (state, def) = self.load_resumable(point.execution_id).await?;
        tracing::info!(
            execution_id = %point.execution_id,
            resume_from = ?point.resume_from,
            reason = %point.reason,
            "resuming recovered execution"
        );
        let seed: Vec<String> = point
            .resume_from
            .into_iter()
            .filter(|id| def.step(id).is_some())
            .collect();
        self.resume_with(state, def, Some(seed)).await
    }

    /// Resume a paused or interrupted execution by ID.
    pub async fn resume_execution(&self, execution_id: Uuid) -> Result<ExecutionResult, EngineError> {
        let (mut state, def) = self.load_resumable(execution_id).await?;
        tracing::info!(execution_id = %execution_id, status = %state.status, "resuming execution");
        let reason = format!("resumed from status {}", state.status);
        self.checkpoints
            .save_checkpoint(
                &mut state,
                CheckpointType::ExecutionResumed,
                None,
                None,
                Some(json!({ "reason": reason })),
            )
            .await;
        self.resume_with(state, def, None).await
    }

    /// Request cooperative cancellation.
    ///
    /// A draining execution stops at the next step boundary. A paused or
    /// interrupted execution that is not draining is marked cancelled in the
    /// store directly. Returns false when there was nothing to cancel.
    pub async fn cancel_execution(&self, execution_id: Uuid) -> Result<bool, EngineError> {
        let token = self.controls.get(&execution_id).map(|c| c.cancel.clone());
        if let Some(token) = token {
            token.cancel();
            tracing::info!(execution_id = %execution_id, "cancellation requested");
            return Ok(true);
        }

        let mut state = match self.checkpoints.load_state(execution_id).await {
            Ok(state) => state,
            Err(CheckpointError::ExecutionNotFound(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if !state.can_resume() {
            return Ok(false);
        }
        state
            .metadata
            .insert("cancel_requested".to_string(), Value::Bool(true));
        self.checkpoints
            .save_checkpoint(&mut state, CheckpointType::ExecutionCancelled, None, None, None)
            .await;
        tracing::info!(execution_id = %execution_id, "idle execution cancelled");
        Ok(true)
    }

    /// Request a cooperative pause. Returns false when not draining here.
    pub fn pause_execution(&self, execution_id: Uuid) -> bool {
        let token = self.controls.get(&execution_id).map(|c| c.pause.clone());
        match token {
            Some(token) => {
                token.cancel();
                tracing::info!(execution_id = %execution_id, "pause requested");
                true
            }
            None => false,
        }
    }

    // -----------------------------------------------------------------------
    // Resume helpers
    // -----------------------------------------------------------------------

    async fn load_resumable(
        &self,
        execution_id: Uuid,
    ) -> Result<(ExecutionState, Arc<WorkflowDefinition>), EngineError> {
        if self.is_active(execution_id) {
            return Err(EngineError::AlreadyActive(execution_id));
        }

        let state = self
            .checkpoints
            .load_state(execution_id)
            .await
            .map_err(|e| match e {
                CheckpointError::ExecutionNotFound(id) => EngineError::ExecutionNotFound(id),
                other => EngineError::Checkpoint(other),
            })?;

        if !state.can_resume() {
            return Err(EngineError::NotResumable {
                execution_id,
                status: state.status,
            });
        }

        let definition = self
            .store()
            .load_definition(&state.workflow_id)
            .await
            .map_err(|e| EngineError::Checkpoint(CheckpointError::Repository(e.to_string())))?
            .ok_or_else(|| EngineError::DefinitionNotFound(state.workflow_id.clone()))?;

        Ok((state, Arc::new(dag::normalize(&definition))))
    }

    async fn resume_with(
        &self,
        state: ExecutionState,
        def: Arc<WorkflowDefinition>,
        seed: Option<Vec<String>>,
    ) -> Result<ExecutionResult, EngineError> {
        let ctx = ExecutionContext::from_state(&state);
        let frontier = dag::resume_frontier(&def, &ctx.steps);
        let ready = match seed {
            Some(seed) if !seed.is_empty() => seed,
            _ => frontier.ready,
        };

        let mut visited = frontier.visited;
        visited.extend(ready.iter().cloned());
        let fatal = unhandled_failure(&def, &ctx.steps);
        let mut run = self.begin(def, ctx, state, ready.into_iter().collect(), visited)?;
        run.waiting = frontier.waiting;
        if let Some((step_id, error)) = fatal {
            tracing::warn!(
                execution_id = %run.ctx.execution_id,
                step_id = %step_id,
                "resumed execution already holds an unhandled step failure"
            );
            run.fatal = Some((step_id, error));
        }
        Ok(self.drive(run).await)
    }

    fn begin(
        &self,
        def: Arc<WorkflowDefinition>,
        ctx: ExecutionContext,
        state: ExecutionState,
        queue: VecDeque<String>,
        visited: HashSet<String>,
    ) -> Result<Run, EngineError> {
        let control = ExecutionControl::default();
        match self.controls.entry(ctx.execution_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => return Err(EngineError::AlreadyActive(ctx.execution_id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(control.clone());
            }
        }
        Ok(Run {
            def,
            ctx,
            state,
            queue,
            visited,
            control,
            waiting: Vec::new(),
            fatal: None,
        })
    }

    // -----------------------------------------------------------------------
    // Drain loop
    // -----------------------------------------------------------------------

    async fn drive(&self, mut run: Run) -> ExecutionResult {
        let limit = run
            .def
            .max_concurrency
            .unwrap_or(self.config.max_concurrency)
            .max(1);
        let semaphore = Arc::new(Semaphore::new(limit));
        let timeout_secs = run.def.timeout;
        let deadline = timeout_secs
            .and_then(|s| Duration::try_from_secs_f64(s).ok())
            .map(|d| Instant::now() + d);
        let (retry_tx, mut retry_rx) = mpsc::unbounded_channel::<RetryNotice>();

        let halt = loop {
            if run.fatal.is_some() {
                break None;
            }
            if let Some(halt) = run.halt_requested() {
                break Some(halt);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                break Some(Halt::TimedOut(timeout_secs.unwrap_or_default()));
            }
            if run.queue.is_empty() && !self.release_joins(&mut run).await {
                break None;
            }

            let take = limit.min(run.queue.len());
            let batch: Vec<String> = run.queue.drain(..take).collect();
            tracing::debug!(
                execution_id = %run.ctx.execution_id,
                batch = ?batch,
                queued = run.queue.len(),
                "processing batch"
            );

            let ready = self.prepare_batch(&mut run, batch).await;
            if ready.is_empty() {
                continue;
            }

            let (outcomes, timed_out) = self
                .run_batch(&mut run, ready, &semaphore, &retry_tx, &mut retry_rx, deadline)
                .await;
            while let Ok(notice) = retry_rx.try_recv() {
                self.record_retry(&mut run, notice).await;
            }
            for (step, outcome) in outcomes {
                self.accept_outcome(&mut run, &step, outcome).await;
            }
            if timed_out {
                break Some(Halt::TimedOut(timeout_secs.unwrap_or_default()));
            }
        };

        self.finish(run, halt).await
    }

    /// Apply the per-step guards and return the steps that should run.
    async fn prepare_batch(&self, run: &mut Run, batch: Vec<String>) -> Vec<StepDefinition> {
        let mut ready = Vec::with_capacity(batch.len());
        for id in batch {
            if run.halt_requested().is_some() {
                break;
            }

            let Some(step) = run.def.step(&id).cloned() else {
                tracing::warn!(execution_id = %run.ctx.execution_id, step_id = %id, "queued step does not exist");
                continue;
            };
            let index = run.def.step_index(&id);

            let finished = run.ctx.steps.get(&id).filter(|r| r.status.is_terminal()).cloned();
            if let Some(result) = finished {
                tracing::debug!(step_id = %id, status = %result.status, "step already finished, following its successors");
                self.enqueue_successors(run, &step, &result).await;
                continue;
            }

            if !self.runner.guard_allows(&step, &run.ctx) {
                let skipped = StepResult::skipped(id.as_str(), "when guard evaluated false");
                run.ctx.record_result(skipped.clone());
                self.checkpoints
                    .save_checkpoint(
                        &mut run.state,
                        CheckpointType::StepSkipped,
                        Some(&id),
                        index,
                        serde_json::to_value(&skipped).ok(),
                    )
                    .await;
                self.notify_step(&run.ctx, &skipped);
                self.enqueue_successors(run, &step, &skipped).await;
                continue;
            }

            self.checkpoints
                .save_checkpoint(
                    &mut run.state,
                    CheckpointType::StepStarting,
                    Some(&id),
                    index,
                    Some(json!({ "step_type": step.step_type })),
                )
                .await;
            run.ctx.record_result(StepResult::running(id.as_str()));
            ready.push(step);
        }
        ready
    }

    /// Run the prepared steps, relaying retry notices into checkpoints.
    ///
    /// Returns outcomes in batch order, and whether the workflow deadline
    /// cut the batch short.
    async fn run_batch(
        &self,
        run: &mut Run,
        ready: Vec<StepDefinition>,
        semaphore: &Arc<Semaphore>,
        retry_tx: &mpsc::UnboundedSender<RetryNotice>,
        retry_rx: &mut mpsc::UnboundedReceiver<RetryNotice>,
        deadline: Option<Instant>,
    ) -> (Vec<(StepDefinition, StepOutcome)>, bool) {
        if let [step] = ready.as_slice() {
            let _permits = acquire_permits(semaphore.clone(), self.shared_pool.clone()).await;
            let tx = retry_tx.clone();
            let notify = move |notice: RetryNotice| {
                let _ = tx.send(notice);
            };
            let fut = AssertUnwindSafe(self.runner.execute_step(step, &run.ctx, &run.def, &notify))
                .catch_unwind();
            tokio::pin!(fut);

            loop {
                tokio::select! {
                    outcome = &mut fut => {
                        let outcome = outcome.unwrap_or_else(|_| panicked(step));
                        return (vec![(step.clone(), outcome)], false);
                    }
                    Some(notice) = retry_rx.recv() => {
                        self.checkpoint_retry(&mut run.state, &run.def, notice).await;
                    }
                    _ = deadline_reached(deadline) => {
                        return (vec![(step.clone(), cut_off(step))], true);
                    }
                }
            }
        }

        let snapshot = Arc::new(run.ctx.clone());
        let mut tasks = JoinSet::new();
        for step in &ready {
            let step = step.clone();
            let runner = Arc::clone(&self.runner);
            let ctx = Arc::clone(&snapshot);
            let def = Arc::clone(&run.def);
            let tx = retry_tx.clone();
            let semaphore = Arc::clone(semaphore);
            let shared = self.shared_pool.clone();

            tasks.spawn(async move {
                let _permits = acquire_permits(semaphore, shared).await;
                let notify = move |notice: RetryNotice| {
                    let _ = tx.send(notice);
                };
                let outcome = AssertUnwindSafe(runner.execute_step(&step, &ctx, &def, &notify))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|_| panicked(&step));
                (step.id.clone(), outcome)
            });
        }

        let mut finished: HashMap<String, StepOutcome> = HashMap::new();
        let mut timed_out = false;
        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok((id, outcome))) => {
                        finished.insert(id, outcome);
                    }
                    Some(Err(e)) => {
                        tracing::warn!(execution_id = %run.ctx.execution_id, error = %e, "step task aborted");
                    }
                },
                Some(notice) = retry_rx.recv() => {
                    self.checkpoint_retry(&mut run.state, &run.def, notice).await;
                }
                _ = deadline_reached(deadline) => {
                    tasks.abort_all();
                    timed_out = true;
                    break;
                }
            }
        }

        let outcomes = ready
            .into_iter()
            .map(|step| {
                let outcome = finished.remove(&step.id).unwrap_or_else(|| cut_off(&step));
                (step, outcome)
            })
            .collect();
        (outcomes, timed_out)
    }

    /// Fold one step outcome into the context and state, then enqueue
    /// successors or mark the run fatally failed.
    async fn accept_outcome(&self, run: &mut Run, step: &StepDefinition, outcome: StepOutcome) {
        let StepOutcome {
            result,
            variables,
            iterations,
            conversation_state,
        } = outcome;
        let index = run.def.step_index(&step.id);

        for iteration in iterations {
            if run.ctx.record_result(iteration.clone()) {
                run.state.steps.insert(iteration.step_id.clone(), iteration);
            }
        }

        if !variables.is_empty() {
            run.ctx.variables.extend(variables.clone());
            self.checkpoints
                .save_checkpoint(
                    &mut run.state,
                    CheckpointType::VariableUpdated,
                    Some(&step.id),
                    index,
                    Some(Value::Object(variables)),
                )
                .await;
        }

        if let Some(conversation) = conversation_state {
            run.ctx
                .conversation_states
                .insert(step.id.clone(), conversation.clone());
            self.checkpoints
                .save_checkpoint(
                    &mut run.state,
                    CheckpointType::AiConversationState,
                    Some(&step.id),
                    index,
                    Some(conversation),
                )
                .await;
        }

        if !run.ctx.record_result(result.clone()) {
            tracing::debug!(step_id = %step.id, "late result discarded");
            return;
        }

        let checkpoint_type = match result.status {
            StepStatus::Completed => CheckpointType::StepCompleted,
            StepStatus::Skipped => CheckpointType::StepSkipped,
            _ => CheckpointType::StepFailed,
        };
        self.checkpoints
            .save_checkpoint(
                &mut run.state,
                checkpoint_type,
                Some(&step.id),
                index,
                serde_json::to_value(&result).ok(),
            )
            .await;

        match result.status {
            StepStatus::Completed | StepStatus::Skipped => tracing::debug!(
                execution_id = %run.ctx.execution_id,
                step_id = %step.id,
                status = %result.status,
                retries = result.retry_count,
                "step finished"
            ),
            _ => tracing::warn!(
                execution_id = %run.ctx.execution_id,
                step_id = %step.id,
                status = %result.status,
                error = result.error.as_deref().unwrap_or(""),
                "step did not complete"
            ),
        }

        self.notify_step(&run.ctx, &result);

        match result.status {
            StepStatus::Failed => {
                let fallback = step
                    .on_error
                    .as_deref()
                    .filter(|target| run.def.step(target).is_some());
                if fallback.is_some() {
                    self.enqueue_successors(run, step, &result).await;
                } else if run.fatal.is_none() {
                    let error = result.error.clone().unwrap_or_else(|| "step failed".to_string());
                    run.fatal = Some((step.id.clone(), error));
                }
            }
            StepStatus::Cancelled => {}
            _ => self.enqueue_successors(run, step, &result).await,
        }
    }

    /// Enqueue the successors of a finished step.
    ///
    /// A step ID enters the queue at most once per execution. A `depends_on`
    /// join waits until every listed predecessor has a terminal result, or
    /// until nothing else can run (see [`Self::release_joins`]).
    async fn enqueue_successors(&self, run: &mut Run, step: &StepDefinition, result: &StepResult) {
        for next in dag::successors(step, result) {
            if run.visited.contains(&next) {
                continue;
            }
            let (deps_met, index) = match run.def.step(&next) {
                Some(successor) => (
                    dag::dependencies_met(successor, &run.ctx.steps),
                    run.def.step_index(&next),
                ),
                None => {
                    tracing::warn!(step_id = %step.id, successor = %next, "successor does not exist");
                    continue;
                }
            };
            if !deps_met {
                tracing::debug!(step_id = %next, "waiting for remaining dependencies");
                if !run.waiting.contains(&next) {
                    run.waiting.push(next);
                }
                continue;
            }

            run.visited.insert(next.clone());
            self.checkpoints
                .save_checkpoint(&mut run.state, CheckpointType::StepQueued, Some(&next), index, None)
                .await;
            run.queue.push_back(next);
        }
    }

    /// Enqueue waiting joins once the queue has drained.
    ///
    /// With nothing queued or in flight, any predecessor still unfinished
    /// sits on an untaken branch and will never run, so the join goes ahead
    /// on the predecessors that did finish. Returns true if anything was
    /// enqueued.
    async fn release_joins(&self, run: &mut Run) -> bool {
        let waiting = std::mem::take(&mut run.waiting);
        let mut released = false;
        for id in waiting {
            if !run.visited.insert(id.clone()) {
                continue;
            }
            tracing::debug!(
                execution_id = %run.ctx.execution_id,
                step_id = %id,
                "releasing join, remaining predecessors were not taken"
            );
            let index = run.def.step_index(&id);
            self.checkpoints
                .save_checkpoint(&mut run.state, CheckpointType::StepQueued, Some(&id), index, None)
                .await;
            run.queue.push_back(id);
            released = true;
        }
        released
    }

    async fn record_retry(&self, run: &mut Run, notice: RetryNotice) {
        self.checkpoint_retry(&mut run.state, &run.def, notice).await;
    }

    async fn checkpoint_retry(&self, state: &mut ExecutionState, def: &WorkflowDefinition, notice: RetryNotice) {
        tracing::debug!(
            execution_id = %state.execution_id,
            step_id = %notice.step_id,
            attempt = notice.attempt,
            delay_ms = notice.delay.as_millis() as u64,
            "step retry scheduled"
        );
        let index = def.step_index(&notice.step_id);
        self.checkpoints
            .save_checkpoint(
                state,
                CheckpointType::StepRetrying,
                Some(&notice.step_id),
                index,
                Some(json!({
                    "attempt": notice.attempt,
                    "delay": notice.delay.as_secs_f64(),
                    "error": notice.error,
                })),
            )
            .await;
    }

    async fn finish(&self, mut run: Run, halt: Option<Halt>) -> ExecutionResult {
        let execution_id = run.ctx.execution_id;

        let (status, error, checkpoint_type, data) = match (run.fatal.take(), halt) {
            (Some((step_id, error)), _) => {
                let message = format!("step '{step_id}' failed: {error}");
                let data = json!({ "error": message, "step_id": step_id });
                (ExecutionStatus::Failed, Some(message), CheckpointType::ExecutionFailed, Some(data))
            }
            (None, Some(Halt::TimedOut(secs))) => {
                let message = format!("workflow timed out after {secs}s");
                let data = json!({ "error": message });
                (ExecutionStatus::Failed, Some(message), CheckpointType::ExecutionFailed, Some(data))
            }
            (None, Some(Halt::Cancelled)) => {
                run.ctx
                    .metadata
                    .insert("cancel_requested".to_string(), Value::Bool(true));
                run.state
                    .metadata
                    .insert("cancel_requested".to_string(), Value::Bool(true));
                (
                    ExecutionStatus::Cancelled,
                    Some("execution cancelled".to_string()),
                    CheckpointType::ExecutionCancelled,
                    None,
                )
            }
            (None, Some(Halt::Paused)) => (ExecutionStatus::Paused, None, CheckpointType::ExecutionPaused, None),
            (None, None) => (ExecutionStatus::Completed, None, CheckpointType::ExecutionCompleted, None),
        };

        run.state.variables = run.ctx.variables.clone();
        self.checkpoints
            .save_checkpoint(&mut run.state, checkpoint_type, None, None, data)
            .await;
        self.controls.remove(&execution_id);

        tracing::info!(
            execution_id = %execution_id,
            workflow_id = %run.ctx.workflow_id,
            status = %status,
            steps = run.ctx.steps.len(),
            error = error.as_deref().unwrap_or(""),
            "workflow execution finished"
        );

        for observer in &self.observers {
            let notified = std::panic::catch_unwind(AssertUnwindSafe(|| {
                observer.on_execution_complete(&run.ctx, status)
            }));
            if notified.is_err() {
                tracing::warn!(execution_id = %execution_id, "execution observer panicked");
            }
        }

        ExecutionResult {
            execution_id,
            workflow_id: run.ctx.workflow_id.clone(),
            status,
            context: run.ctx,
            state: run.state,
            error,
        }
    }

    fn notify_step(&self, ctx: &ExecutionContext, result: &StepResult) {
        for observer in &self.observers {
            let notified =
                std::panic::catch_unwind(AssertUnwindSafe(|| observer.on_step_complete(ctx, result)));
            if notified.is_err() {
                tracing::warn!(step_id = %result.step_id, "step observer panicked");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn acquire_permits(
    local: Arc<Semaphore>,
    shared: Option<Arc<Semaphore>>,
) -> (Option<OwnedSemaphorePermit>, Option<OwnedSemaphorePermit>) {
    let local = local.acquire_owned().await.ok();
    let shared = match shared {
        Some(pool) => pool.acquire_owned().await.ok(),
        None => None,
    };
    (local, shared)
}

async fn deadline_reached(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn panicked(step: &StepDefinition) -> StepOutcome {
    tracing::warn!(step_id = %step.id, "step execution panicked");
    outcome_of(StepResult::running(step.id.as_str()).fail("step execution panicked"))
}

fn cut_off(step: &StepDefinition) -> StepOutcome {
    outcome_of(StepResult::running(step.id.as_str()).cancel())
}

/// First failed step (in document order) without a usable `on_error`
/// fallback, with its error.
fn unhandled_failure(
    def: &WorkflowDefinition,
    results: &std::collections::BTreeMap<String, StepResult>,
) -> Option<(String, String)> {
    def.steps.iter().find_map(|step| {
        let result = results.get(&step.id).filter(|r| r.status == StepStatus::Failed)?;
        let handled = step
            .on_error
            .as_deref()
            .is_some_and(|target| def.step(target).is_some());
        (!handled).then(|| {
            let error = result.error.clone().unwrap_or_else(|| "step failed".to_string());
            (step.id.clone(), error)
        })
    })
}

fn outcome_of(result: StepResult) -> StepOutcome {
    StepOutcome {
        result,
        variables: Map::new(),
        iterations: Vec::new(),
        conversation_state: None,
    }
}

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Reasons an execution could not be started or resumed.
///
/// Failures inside a running execution never surface here; they end the
/// execution with status `failed` instead.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid workflow: {0}")]
    InvalidWorkflow(#[from] WorkflowError),

    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("execution {execution_id} cannot be resumed from status {status}")]
    NotResumable {
        execution_id: Uuid,
        status: ExecutionStatus,
    },

    #[error("workflow definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("execution already active: {0}")]
    AlreadyActive(Uuid),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::memory::InMemoryStateStore;
    use crate::workflow::task::{FnTask, TaskOutcome};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn workflow(steps: Vec<StepDefinition>) -> WorkflowDefinition {
        WorkflowDefinition {
            id: "wf".to_string(),
            name: None,
            description: None,
            variables: Default::default(),
            steps,
            max_concurrency: None,
            timeout: None,
            metadata: Default::default(),
        }
    }

    fn step(id: &str, step_type: &str, next: &[&str]) -> StepDefinition {
        let mut s = StepDefinition::new(id, step_type);
        s.next = next.iter().map(|n| n.to_string()).collect();
        s
    }

    fn engine(registry: TaskRegistry) -> WorkflowEngine<InMemoryStateStore> {
        WorkflowEngine::new(
            Arc::new(InMemoryStateStore::new()),
            Arc::new(registry),
            EngineConfig::default(),
        )
    }

    fn echo_registry() -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        registry.register(
            "echo",
            FnTask(|config: Value, _ctx| async move { Ok(TaskOutcome::ok(config)) }),
        );
        registry.register(
            "fail",
            FnTask(|_config: Value, _ctx| async move { Ok(TaskOutcome::failed("invalid payload")) }),
        );
        registry
    }

    #[tokio::test]
    async fn test_linear_execution_completes() {
        let wf = workflow(vec![step("a", "echo", &["b"]), step("b", "echo", &[])]);
        let result = engine(echo_registry())
            .execute(&wf, Map::new(), None)
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.state.completed_steps, vec!["a", "b"]);
        assert_eq!(result.state.current_step_index, 2);
        let last = result.state.checkpoints.last().unwrap();
        assert_eq!(last.checkpoint_type, CheckpointType::ExecutionCompleted);
    }

    #[tokio::test]
    async fn test_invalid_document_is_rejected_up_front() {
        let wf = workflow(vec![step("a", "echo", &["missing"])]);
        let err = engine(echo_registry())
            .execute(&wf, Map::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidWorkflow(_)));
    }

    #[tokio::test]
    async fn test_unhandled_failure_is_fatal() {
        let wf = workflow(vec![step("a", "fail", &["b"]), step("b", "echo", &[])]);
        let result = engine(echo_registry())
            .execute(&wf, Map::new(), None)
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert!(result.error.unwrap().contains("invalid payload"));
        assert!(!result.context.steps.contains_key("b"));
        assert_eq!(result.state.failed_steps, vec!["a"]);
    }

    #[tokio::test]
    async fn test_on_error_fallback_recovers() {
        let mut a = step("a", "fail", &["b"]);
        a.on_error = Some("recover".to_string());
        let wf = workflow(vec![a, step("b", "echo", &[]), step("recover", "echo", &[])]);
        let result = engine(echo_registry())
            .execute(&wf, Map::new(), None)
            .await
            .unwrap();

        assert_eq!(result.status, ExecutionStatus::Completed);
        assert!(result.context.steps.contains_key("recover"));
        assert!(!result.context.steps.contains_key("b"));
    }

    #[tokio::test]
    async fn test_when_guard_skips_but_continues() {
        let mut b = step("b", "echo", &["c"]);
        b.when = Some("{{ variables.enabled }}".to_string());
        let wf = workflow(vec![step("a", "echo", &["b"]), b, step("c", "echo", &[])]);
        let mut vars = Map::new();
        vars.insert("enabled".to_string(), json!(false));

        let result = engine(echo_registry()).execute(&wf, vars, None).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.context.steps["b"].status, StepStatus::Skipped);
        assert_eq!(result.context.steps["c"].status, StepStatus::Completed);
        assert_eq!(result.state.skipped_steps, vec!["b"]);
    }

    #[tokio::test]
    async fn test_depends_on_join_runs_once_after_all() {
        let mut join = step("join", "echo", &[]);
        join.depends_on = vec!["left".to_string(), "right".to_string()];
        let mut fan = StepDefinition::new("fan", "parallel");
        fan.branches = Some(dagflow_types::workflow::BranchSpec::Parallel(vec![
            "left".to_string(),
            "right".to_string(),
        ]));
        let wf = workflow(vec![fan, step("left", "echo", &[]), step("right", "echo", &[]), join]);

        let joins = Arc::new(AtomicUsize::new(0));
        struct CountJoins(Arc<AtomicUsize>);
        impl ExecutionObserver for CountJoins {
            fn on_step_complete(&self, ctx: &ExecutionContext, result: &StepResult) {
                let ready = ["left", "right"]
                    .iter()
                    .all(|id| ctx.steps.get(*id).is_some_and(|r| r.status.is_terminal()));
                if result.step_id == "join" && ready {
                    self.0.fetch_add(1, Ordering::SeqCst);
                }
            }
        }

        let result = engine(echo_registry())
            .with_observer(Arc::new(CountJoins(joins.clone())))
            .execute(&wf, Map::new(), None)
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(joins.load(Ordering::SeqCst), 1);
        assert_eq!(result.context.steps["fan"].output["branches"], json!(["left", "right"]));
    }

    #[tokio::test]
    async fn test_panicking_observer_is_ignored() {
        struct Explodes;
        impl ExecutionObserver for Explodes {
            fn on_step_complete(&self, _ctx: &ExecutionContext, _result: &StepResult) {
                panic!("observer bug");
            }
        }
        let wf = workflow(vec![step("a", "echo", &[])]);
        let result = engine(echo_registry())
            .with_observer(Arc::new(Explodes))
            .execute(&wf, Map::new(), None)
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
    }

    #[tokio::test]
    async fn test_set_variable_flows_to_later_steps() {
        let mut set = step("set", "set_variable", &["use"]);
        set.config = json!({ "name": "greeting", "value": "hello" });
        let mut use_it = step("use", "echo", &[]);
        use_it.config = json!({ "text": "{{ variables.greeting }} world" });
        let wf = workflow(vec![set, use_it]);

        let result = engine(echo_registry()).execute(&wf, Map::new(), None).await.unwrap();
        assert_eq!(result.context.steps["use"].output["text"], json!("hello world"));
        assert_eq!(result.state.variables["greeting"], json!("hello"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_workflow_timeout_fails_execution() {
        let mut registry = TaskRegistry::new();
        registry.register(
            "slow",
            FnTask(|_config: Value, _ctx| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(TaskOutcome::ok(Value::Null))
            }),
        );
        let mut wf = workflow(vec![step("a", "slow", &["b"]), step("b", "slow", &[])]);
        wf.timeout = Some(5.0);

        let result = engine(registry).execute(&wf, Map::new(), None).await.unwrap();
        assert_eq!(result.status, ExecutionStatus::Failed);
        assert!(result.error.unwrap().contains("timed out"));
        assert_eq!(result.context.steps["a"].status, StepStatus::Cancelled);
        assert!(!result.context.steps.contains_key("b"));
    }

    #[tokio::test]
    async fn test_resume_unknown_execution() {
        let err = engine(echo_registry())
            .resume_execution(Uuid::now_v7())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ExecutionNotFound(_)));
    }
}
