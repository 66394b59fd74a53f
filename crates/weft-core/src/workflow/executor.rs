//! Workflow engine: ordered step execution with durable checkpointing.
//!
//! `WorkflowEngine` drives one run per call. Top-level steps run in
//! definition order; `parallel` steps fan out into a `JoinSet` and rejoin
//! before the step completes, `branch` runs a single arm, and `subworkflow`
//! runs a registered definition in a fresh context under the parent's
//! checkpoint namespace.
//!
//! # Execution flow
//!
//! 1. Resolve inputs and create the checkpoint header (or load it for resume).
//! 2. For each step: restore it from its settled record, or evaluate `when`,
//!    dispatch by kind, and append a record.
//! 3. Advance the top-level cursor after each top-level step.
//! 4. Evaluate the workflow `outputs`.
//! 5. Clear the checkpoint on success; keep it for failure and cancellation.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;
use weft_types::checkpoint::RecordStatus;
use weft_types::config::EngineConfig;
use weft_types::event::WorkflowEvent;
use weft_types::workflow::{BranchArm, RunStatus, Step, StepKind, WorkflowDefinition};

use crate::event::bus::EventBus;
use crate::repository::checkpoint::CheckpointRepository;

use super::checkpoint::{CheckpointError, CheckpointManager, ResumeState};
use super::context::{ExecutionContext, InputError, json_type_name, resolve_inputs};
use super::definition::WorkflowError;
use super::expression::{ExpressionError, parse_condition, render_value};
use super::graph::visit_steps;
use super::registry::{ComponentKind, ComponentRegistry, RegistryError};
use super::retry::{RetryAction, RetryHandler};
use super::step_runner::{StepError, StepInvocation};

// ---------------------------------------------------------------------------
// WorkflowExecutor trait
// ---------------------------------------------------------------------------

/// Trait for workflow execution engines.
///
/// Uses RPITIT (return-position `impl Trait` in traits) for async methods,
/// consistent with the project's Rust 2024 edition approach.
pub trait WorkflowExecutor: Send + Sync {
    /// Execute a workflow definition from the beginning.
    fn execute(
        &self,
        definition: &WorkflowDefinition,
        inputs: Map<String, Value>,
    ) -> impl std::future::Future<Output = Result<ExecutionResult, EngineError>> + Send;

    /// Resume a failed, cancelled or crashed run from its checkpoint.
    ///
    /// `inputs` override the persisted inputs; persisted values fill the gaps.
    fn resume(
        &self,
        run_id: Uuid,
        definition: &WorkflowDefinition,
        inputs: Map<String, Value>,
    ) -> impl std::future::Future<Output = Result<ExecutionResult, EngineError>> + Send;

    /// Cancel a running workflow.
    fn cancel(&self, run_id: Uuid) -> impl std::future::Future<Output = Result<(), EngineError>> + Send;
}

// ---------------------------------------------------------------------------
// ExecutionResult
// ---------------------------------------------------------------------------

/// Result of a completed or cancelled run. Failures are returned as
/// [`EngineError`] instead.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub run_id: Uuid,
    pub workflow_name: String,
    pub status: RunStatus,
    /// Evaluated workflow outputs (empty unless completed).
    pub outputs: Map<String, Value>,
    /// Final top-level context.
    pub context: ExecutionContext,
    /// Steps completed in this run, restored ones included.
    pub steps_completed: u32,
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Step executor with durable checkpointing.
///
/// Generic over `R: CheckpointRepository` for storage flexibility.
pub struct WorkflowEngine<R: CheckpointRepository> {
    registry: Arc<ComponentRegistry>,
    checkpoint: Arc<CheckpointManager<R>>,
    event_bus: EventBus,
    config: Arc<EngineConfig>,
    /// Cancellation tokens keyed by run_id.
    cancellation_tokens: DashMap<Uuid, CancellationToken>,
}

impl<R: CheckpointRepository + 'static> WorkflowEngine<R> {
    pub fn new(
        registry: Arc<ComponentRegistry>,
        repo: R,
        event_bus: EventBus,
        config: EngineConfig,
    ) -> Self {
        Self {
            registry,
            checkpoint: Arc::new(CheckpointManager::new(repo)),
            event_bus,
            config: Arc::new(config),
            cancellation_tokens: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    pub fn checkpoint(&self) -> &CheckpointManager<R> {
        &self.checkpoint
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Whether `run_id` is currently being driven by this engine.
    pub fn is_running(&self, run_id: Uuid) -> bool {
        self.cancellation_tokens.contains_key(&run_id)
    }

    /// Execute `definition` under a caller-chosen run id, so the caller can
    /// filter the event stream before the run starts.
    pub async fn execute_with_id(
        &self,
        run_id: Uuid,
        definition: &WorkflowDefinition,
        inputs: Map<String, Value>,
    ) -> Result<ExecutionResult, EngineError> {
        let inputs = resolve_inputs(&definition.inputs, &inputs).map_err(|source| {
            EngineError::InvalidInputs {
                workflow: definition.name.clone(),
                source,
            }
        })?;

        self.checkpoint.begin_run(run_id, definition, &inputs).await?;

        self.event_bus.publish(WorkflowEvent::RunStarted {
            run_id,
            workflow_name: definition.name.clone(),
            resumed: false,
        });
        tracing::info!(
            run_id = %run_id,
            workflow = definition.name.as_str(),
            "starting workflow execution"
        );

        self.drive(run_id, definition, ExecutionContext::new(inputs), None)
            .await
    }

    async fn resume_run(
        &self,
        run_id: Uuid,
        definition: &WorkflowDefinition,
        inputs: Map<String, Value>,
    ) -> Result<ExecutionResult, EngineError> {
        if self.is_running(run_id) {
            return Err(EngineError::AlreadyRunning(run_id));
        }

        let state = self.checkpoint.load_resume_state(run_id, definition).await?;

        let mut merged: Map<String, Value> = state
            .inputs()
            .into_iter()
            .filter(|(_, value)| !value.is_null())
            .collect();
        merged.extend(inputs);
        let inputs = resolve_inputs(&definition.inputs, &merged).map_err(|source| {
            EngineError::InvalidInputs {
                workflow: definition.name.clone(),
                source,
            }
        })?;

        self.checkpoint
            .mark_status(run_id, RunStatus::Running, None)
            .await?;

        self.event_bus.publish(WorkflowEvent::RunStarted {
            run_id,
            workflow_name: definition.name.clone(),
            resumed: true,
        });
        tracing::info!(
            run_id = %run_id,
            workflow = definition.name.as_str(),
            cursor = state.run.cursor,
            restorable = state.settled_count(),
            "resuming workflow execution"
        );

        self.drive(run_id, definition, ExecutionContext::new(inputs), Some(state))
            .await
    }

    /// Run every top-level step under the workflow timeout and settle the
    /// checkpoint according to the outcome.
    async fn drive(
        &self,
        run_id: Uuid,
        definition: &WorkflowDefinition,
        mut ctx: ExecutionContext,
        resume: Option<ResumeState>,
    ) -> Result<ExecutionResult, EngineError> {
        let cancel = CancellationToken::new();
        self.cancellation_tokens.insert(run_id, cancel.clone());

        let cursor = resume.as_ref().map_or(0, |state| state.run.cursor);
        let driver = RunDriver {
            run_id,
            registry: Arc::clone(&self.registry),
            checkpoint: Arc::clone(&self.checkpoint),
            event_bus: self.event_bus.clone(),
            config: Arc::clone(&self.config),
            cancel: cancel.clone(),
            resume: resume.map(Arc::new),
            completed: Arc::new(AtomicU32::new(0)),
        };

        let run_start = Instant::now();
        let workflow_timeout = self.config.workflow_timeout_secs;
        let result = match tokio::time::timeout(
            Duration::from_secs(workflow_timeout),
            driver
                .run_steps(definition, &mut ctx, cursor)
                .instrument(tracing::info_span!(
                    "workflow_run",
                    run_id = %run_id,
                    workflow = definition.name.as_str()
                )),
        )
        .await
        {
            Ok(result) => result,
            Err(_elapsed) => {
                cancel.cancel();
                Err(EngineError::WorkflowTimeout {
                    secs: workflow_timeout,
                })
            }
        };

        // Clean up cancellation token
        self.cancellation_tokens.remove(&run_id);
        let steps_completed = driver.completed.load(Ordering::Relaxed);

        match result {
            Ok(outputs) => {
                self.checkpoint.finish_run(run_id).await?;

                self.event_bus.publish(WorkflowEvent::RunCompleted {
                    run_id,
                    workflow_name: definition.name.clone(),
                    duration_ms: run_start.elapsed().as_millis() as u64,
                    steps_completed,
                });
                tracing::info!(
                    run_id = %run_id,
                    workflow = definition.name.as_str(),
                    steps_completed,
                    "workflow completed"
                );

                Ok(ExecutionResult {
                    run_id,
                    workflow_name: definition.name.clone(),
                    status: RunStatus::Completed,
                    outputs,
                    context: ctx,
                    steps_completed,
                    error: None,
                })
            }
            Err(EngineError::Cancelled) => {
                self.checkpoint
                    .mark_status(run_id, RunStatus::Cancelled, Some("cancelled by user"))
                    .await?;

                self.event_bus.publish(WorkflowEvent::RunCancelled {
                    run_id,
                    workflow_name: definition.name.clone(),
                });
                tracing::info!(run_id = %run_id, "workflow cancelled");

                Ok(ExecutionResult {
                    run_id,
                    workflow_name: definition.name.clone(),
                    status: RunStatus::Cancelled,
                    outputs: Map::new(),
                    context: ctx,
                    steps_completed,
                    error: Some(EngineError::Cancelled.to_string()),
                })
            }
            Err(err) => {
                let message = err.to_string();
                if let Err(e) = self
                    .checkpoint
                    .mark_status(run_id, RunStatus::Failed, Some(&message))
                    .await
                {
                    tracing::warn!(run_id = %run_id, error = %e, "failed to record run failure");
                }

                self.event_bus.publish(WorkflowEvent::RunFailed {
                    run_id,
                    workflow_name: definition.name.clone(),
                    step: err.step().map(str::to_string),
                    error: message.clone(),
                });
                tracing::warn!(
                    run_id = %run_id,
                    workflow = definition.name.as_str(),
                    error = %message,
                    "workflow failed"
                );

                Err(err)
            }
        }
    }
}

impl<R: CheckpointRepository + 'static> WorkflowExecutor for WorkflowEngine<R> {
    async fn execute(
        &self,
        definition: &WorkflowDefinition,
        inputs: Map<String, Value>,
    ) -> Result<ExecutionResult, EngineError> {
        self.execute_with_id(Uuid::now_v7(), definition, inputs).await
    }

    async fn resume(
        &self,
        run_id: Uuid,
        definition: &WorkflowDefinition,
        inputs: Map<String, Value>,
    ) -> Result<ExecutionResult, EngineError> {
        self.resume_run(run_id, definition, inputs).await
    }

    async fn cancel(&self, run_id: Uuid) -> Result<(), EngineError> {
        match self.cancellation_tokens.get(&run_id) {
            Some(token) => {
                token.cancel();
                tracing::info!(run_id = %run_id, "cancellation requested");
                Ok(())
            }
            None => Err(EngineError::RunNotFound(run_id)),
        }
    }
}

// ---------------------------------------------------------------------------
// Scope
// ---------------------------------------------------------------------------

/// Checkpoint namespace of the steps being run.
#[derive(Debug, Clone, Default)]
struct Scope {
    prefix: String,
    depth: u32,
}

impl Scope {
    fn key(&self, name: &str) -> String {
        format!("{}{name}", self.prefix)
    }

    /// Children of a `parallel` or `branch` step.
    fn nested(&self, name: &str) -> Scope {
        Scope {
            prefix: format!("{}{name}/", self.prefix),
            depth: self.depth,
        }
    }

    /// One `for_each` iteration.
    fn item(&self, name: &str, index: usize) -> Scope {
        Scope {
            prefix: format!("{}{name}[{index}]/", self.prefix),
            depth: self.depth,
        }
    }

    fn subworkflow(&self, name: &str) -> Scope {
        Scope {
            prefix: format!("{}{name}/", self.prefix),
            depth: self.depth + 1,
        }
    }
}

fn mark_skipped_tree(step: &Step, ctx: &mut ExecutionContext) {
    visit_steps(std::slice::from_ref(step), &mut |s| ctx.mark_skipped(&s.name));
}

fn subtree_names(step: &Step) -> Vec<&str> {
    let mut names = Vec::new();
    visit_steps(std::slice::from_ref(step), &mut |s| names.push(s.name.as_str()));
    names
}

/// Component, name and argument mapping of a leaf step.
fn leaf_call(step: &Step) -> Option<(ComponentKind, &str, &BTreeMap<String, Value>)> {
    match &step.kind {
        StepKind::Python { action, args } => Some((ComponentKind::Action, action.as_str(), args)),
        StepKind::Agent { agent, context } => Some((ComponentKind::Agent, agent.as_str(), context)),
        StepKind::Generate { generator, context } => {
            Some((ComponentKind::Generator, generator.as_str(), context))
        }
        _ => None,
    }
}

fn evaluate_outputs(
    definition: &WorkflowDefinition,
    ctx: &ExecutionContext,
) -> Result<Map<String, Value>, EngineError> {
    let mut outputs = Map::new();
    for output in &definition.outputs {
        let value = render_value(&Value::String(output.expression.clone()), ctx)
            .map_err(|e| EngineError::evaluation(&format!("outputs.{}", output.name), e))?;
        outputs.insert(output.name.clone(), value);
    }
    Ok(outputs)
}

// ---------------------------------------------------------------------------
// RunDriver
// ---------------------------------------------------------------------------

/// Per-run state shared by every task of the run. Cheap to clone.
struct RunDriver<R: CheckpointRepository> {
    run_id: Uuid,
    registry: Arc<ComponentRegistry>,
    checkpoint: Arc<CheckpointManager<R>>,
    event_bus: EventBus,
    config: Arc<EngineConfig>,
    cancel: CancellationToken,
    resume: Option<Arc<ResumeState>>,
    completed: Arc<AtomicU32>,
}

impl<R: CheckpointRepository> Clone for RunDriver<R> {
    fn clone(&self) -> Self {
        Self {
            run_id: self.run_id,
            registry: Arc::clone(&self.registry),
            checkpoint: Arc::clone(&self.checkpoint),
            event_bus: self.event_bus.clone(),
            config: Arc::clone(&self.config),
            cancel: self.cancel.clone(),
            resume: self.resume.clone(),
            completed: Arc::clone(&self.completed),
        }
    }
}

impl<R: CheckpointRepository + 'static> RunDriver<R> {
    async fn run_steps(
        &self,
        definition: &WorkflowDefinition,
        ctx: &mut ExecutionContext,
        mut cursor: u32,
    ) -> Result<Map<String, Value>, EngineError> {
        let scope = Scope::default();
        for (index, step) in definition.steps.iter().enumerate() {
            self.run_step(step, &scope, ctx).await?;

            let next = index as u32 + 1;
            if next > cursor {
                self.checkpoint.advance_cursor(self.run_id, next).await?;
                cursor = next;
            }
        }
        evaluate_outputs(definition, ctx)
    }

    fn publish(&self, event: WorkflowEvent) {
        self.event_bus.publish(event);
    }

    /// Run (or restore) one step and commit its output into `ctx`.
    fn run_step<'a>(
        &'a self,
        step: &'a Step,
        scope: &'a Scope,
        ctx: &'a mut ExecutionContext,
    ) -> BoxFuture<'a, Result<(), EngineError>> {
        let span = tracing::info_span!("step", step = %scope.key(&step.name), kind = step.kind.name());
        Box::pin(async move {
            let key = scope.key(&step.name);
            if self.restore(step, scope, ctx)? {
                return Ok(());
            }
            if self.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }

            let started = Instant::now();
            let result = match self.should_run(step, &key, ctx) {
                Ok(false) => return self.skip(step, &key, ctx).await,
                Ok(true) => {
                    self.publish(WorkflowEvent::StepStarted {
                        run_id: self.run_id,
                        step: key.clone(),
                        kind: step.kind.name().to_string(),
                        attempt: 1,
                    });
                    tracing::debug!(
                        run_id = %self.run_id,
                        step = key.as_str(),
                        kind = step.kind.name(),
                        "dispatching step"
                    );
                    self.dispatch(step, &key, scope, ctx).await
                }
                Err(err) => Err(err),
            };

            match result {
                Ok((output, attempts)) => {
                    self.checkpoint
                        .record_completed(self.run_id, &key, &output, attempts)
                        .await?;
                    ctx.set_step_output(&step.name, output);
                    self.completed.fetch_add(1, Ordering::Relaxed);

                    self.publish(WorkflowEvent::StepCompleted {
                        run_id: self.run_id,
                        step: key,
                        duration_ms: started.elapsed().as_millis() as u64,
                    });
                    Ok(())
                }
                Err(EngineError::Cancelled) => Err(EngineError::Cancelled),
                Err(err) => {
                    self.fail(&key, &err).await;
                    Err(err)
                }
            }
        }
        .instrument(span))
    }

    fn should_run(&self, step: &Step, key: &str, ctx: &ExecutionContext) -> Result<bool, EngineError> {
        match &step.when {
            Some(condition) => self.condition_holds(condition, key, ctx),
            None => Ok(true),
        }
    }

    fn condition_holds(
        &self,
        condition: &str,
        key: &str,
        ctx: &ExecutionContext,
    ) -> Result<bool, EngineError> {
        let expr = parse_condition(condition).map_err(|e| EngineError::evaluation(key, e))?;
        expr.evaluate_bool(ctx)
            .map_err(|e| EngineError::evaluation(key, e))
    }

    async fn skip(&self, step: &Step, key: &str, ctx: &mut ExecutionContext) -> Result<(), EngineError> {
        mark_skipped_tree(step, ctx);
        self.checkpoint.record_skipped(self.run_id, key).await?;
        self.publish(WorkflowEvent::StepSkipped {
            run_id: self.run_id,
            step: key.to_string(),
            restored: false,
        });
        tracing::debug!(run_id = %self.run_id, step = key, "step skipped");
        Ok(())
    }

    async fn fail(&self, key: &str, err: &EngineError) {
        let message = err.to_string();
        if let Err(e) = self
            .checkpoint
            .record_failed(self.run_id, key, &message, 1)
            .await
        {
            tracing::warn!(run_id = %self.run_id, step = key, error = %e, "failed to record step failure");
        }
        self.publish(WorkflowEvent::StepFailed {
            run_id: self.run_id,
            step: key.to_string(),
            error: message,
            will_retry: false,
        });
    }

    // -----------------------------------------------------------------------
    // Resume
    // -----------------------------------------------------------------------

    /// Restore `step` from its settled record. Returns `false` when the step
    /// has no record and has to run.
    fn restore(&self, step: &Step, scope: &Scope, ctx: &mut ExecutionContext) -> Result<bool, EngineError> {
        let Some(resume) = self.resume.as_deref() else {
            return Ok(false);
        };
        let key = scope.key(&step.name);
        let Some(record) = resume.settled(&key) else {
            return Ok(false);
        };

        if record.status == RecordStatus::Skipped {
            mark_skipped_tree(step, ctx);
            self.publish(WorkflowEvent::StepSkipped {
                run_id: self.run_id,
                step: key,
                restored: true,
            });
            return Ok(true);
        }

        let output = record.output.clone().unwrap_or(Value::Null);
        match &step.kind {
            StepKind::Parallel {
                steps,
                for_each: None,
            } => {
                let inner = scope.nested(&step.name);
                for child in steps {
                    self.restore_required(child, &inner, ctx)?;
                }
            }
            StepKind::Branch { arms } => {
                let inner = scope.nested(&step.name);
                let taken = output.get("arm").and_then(Value::as_str);
                for arm in arms {
                    for child in &arm.steps {
                        if taken == Some(arm.label.as_str()) {
                            self.restore_required(child, &inner, ctx)?;
                        } else {
                            mark_skipped_tree(child, ctx);
                        }
                    }
                }
            }
            _ => {}
        }

        ctx.set_step_output(&step.name, output);
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.publish(WorkflowEvent::StepRestored {
            run_id: self.run_id,
            step: key,
        });
        Ok(true)
    }

    fn restore_required(&self, step: &Step, scope: &Scope, ctx: &mut ExecutionContext) -> Result<(), EngineError> {
        if self.restore(step, scope, ctx)? {
            Ok(())
        } else {
            Err(CheckpointError::Corrupted(format!(
                "parent of '{}' completed but the step has no record",
                scope.key(&step.name)
            ))
            .into())
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    async fn dispatch(
        &self,
        step: &Step,
        key: &str,
        scope: &Scope,
        ctx: &mut ExecutionContext,
    ) -> Result<(Value, u32), EngineError> {
        match &step.kind {
            StepKind::Python { .. } | StepKind::Agent { .. } | StepKind::Generate { .. } => {
                let output = self.run_leaf(step, key, ctx, 1, None).await?;
                Ok((output, 1))
            }
            StepKind::Validate {
                stages,
                args,
                retry,
                on_failure,
            } => {
                self.run_validate(step, key, stages, args, *retry, on_failure.as_deref(), ctx)
                    .await
            }
            StepKind::Subworkflow { workflow, inputs } => {
                let output = self
                    .run_subworkflow(step, key, workflow, inputs, scope, ctx)
                    .await?;
                Ok((output, 1))
            }
            StepKind::Branch { arms } => {
                let output = self.run_branch(step, key, arms, scope, ctx).await?;
                Ok((output, 1))
            }
            StepKind::Parallel {
                steps,
                for_each: None,
            } => {
                let output = self.run_parallel(step, key, steps, scope, ctx).await?;
                Ok((output, 1))
            }
            StepKind::Parallel {
                steps,
                for_each: Some(expression),
            } => {
                let output = self
                    .run_for_each(step, key, steps, expression, scope, ctx)
                    .await?;
                Ok((output, 1))
            }
        }
    }

    fn render_arguments(
        &self,
        fields: &BTreeMap<String, Value>,
        key: &str,
        ctx: &ExecutionContext,
    ) -> Result<Value, EngineError> {
        let mut rendered = Map::with_capacity(fields.len());
        for (name, value) in fields {
            let value = render_value(value, ctx).map_err(|e| EngineError::evaluation(key, e))?;
            rendered.insert(name.clone(), value);
        }
        Ok(Value::Object(rendered))
    }

    async fn run_leaf(
        &self,
        step: &Step,
        key: &str,
        ctx: &ExecutionContext,
        attempt: u32,
        last_error: Option<String>,
    ) -> Result<Value, EngineError> {
        let Some((kind, component, fields)) = leaf_call(step) else {
            return Err(EngineError::StepFailed {
                step: key.to_string(),
                kind: step.kind.name(),
                source: StepError::failed("expected a python, agent or generate step"),
            });
        };
        let arguments = self.render_arguments(fields, key, ctx)?;
        self.invoke(kind, component, step, key, arguments, attempt, last_error)
            .await
    }

    /// Call the registered executor, bounded by the step timeout and
    /// observing cancellation.
    #[allow(clippy::too_many_arguments)]
    async fn invoke(
        &self,
        kind: ComponentKind,
        component: &str,
        step: &Step,
        key: &str,
        arguments: Value,
        attempt: u32,
        last_error: Option<String>,
    ) -> Result<Value, EngineError> {
        let executor = self
            .registry
            .resolve_executor(kind, component)
            .map_err(|source| EngineError::Component {
                step: key.to_string(),
                source,
            })?;

        let invocation = StepInvocation {
            run_id: self.run_id,
            step: step.name.clone(),
            step_key: key.to_string(),
            kind: step.kind.name(),
            component: component.to_string(),
            arguments,
            attempt,
            last_error,
        };

        let timeout_secs = step.timeout_secs.unwrap_or(self.config.step_timeout_secs);
        let call = tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            executor.execute(invocation, self.cancel.child_token()),
        );

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(EngineError::Cancelled),
            result = call => match result {
                Err(_elapsed) => Err(EngineError::StepTimeout {
                    step: key.to_string(),
                    timeout_secs,
                }),
                Ok(Ok(output)) => Ok(output),
                Ok(Err(StepError::Cancelled)) => Err(EngineError::Cancelled),
                Ok(Err(source)) => Err(EngineError::StepFailed {
                    step: key.to_string(),
                    kind: step.kind.name(),
                    source,
                }),
            },
        }
    }

    // -----------------------------------------------------------------------
    // validate
    // -----------------------------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    async fn run_validate(
        &self,
        step: &Step,
        key: &str,
        stages: &[String],
        args: &BTreeMap<String, Value>,
        retry: u32,
        on_failure: Option<&Step>,
        ctx: &ExecutionContext,
    ) -> Result<(Value, u32), EngineError> {
        let arguments = self.render_arguments(args, key, ctx)?;
        let mut attempt = 1;
        let mut corrections = 0u32;

        loop {
            let failure = match self.run_stages(step, key, stages, &arguments, attempt).await {
                Ok(outputs) => {
                    let output = json!({
                        "stages": outputs,
                        "attempts": attempt,
                        "corrections": corrections,
                    });
                    return Ok((output, attempt));
                }
                Err((_, err @ (EngineError::Cancelled | EngineError::Component { .. }))) => {
                    return Err(err);
                }
                Err((stage, err)) => RetryHandler::describe_failure(&stage, &err.cause_message()),
            };

            let action = RetryHandler::next_action(retry, attempt, on_failure.is_some());
            if action == RetryAction::GiveUp {
                return Err(EngineError::RetryExhausted {
                    step: key.to_string(),
                    attempts: attempt,
                    last_error: failure,
                });
            }

            self.publish(WorkflowEvent::StepFailed {
                run_id: self.run_id,
                step: key.to_string(),
                error: failure.clone(),
                will_retry: true,
            });
            tracing::info!(
                run_id = %self.run_id,
                step = key,
                attempt,
                error = failure.as_str(),
                "validation failed, retrying"
            );

            let mut corrective_step = None;
            if let (RetryAction::Correct, Some(corrective)) = (action, on_failure) {
                if self.run_corrective(corrective, key, ctx, &failure, attempt).await? {
                    corrections += 1;
                    corrective_step = Some(corrective.name.clone());
                }
            }

            attempt += 1;
            self.publish(WorkflowEvent::StepRetrying {
                run_id: self.run_id,
                step: key.to_string(),
                attempt,
                corrective_step,
            });
        }
    }

    /// Run every stage in order, stopping at the first failure.
    async fn run_stages(
        &self,
        step: &Step,
        key: &str,
        stages: &[String],
        arguments: &Value,
        attempt: u32,
    ) -> Result<Map<String, Value>, (String, EngineError)> {
        let mut outputs = Map::new();
        for stage in stages {
            match self
                .invoke(ComponentKind::Action, stage, step, key, arguments.clone(), attempt, None)
                .await
            {
                Ok(output) => {
                    outputs.insert(stage.clone(), output);
                }
                Err(err) => return Err((stage.clone(), err)),
            }
        }
        Ok(outputs)
    }

    /// Run the `on_failure` step. Returns `false` if its condition skipped it.
    async fn run_corrective(
        &self,
        corrective: &Step,
        parent_key: &str,
        ctx: &ExecutionContext,
        failure: &str,
        attempt: u32,
    ) -> Result<bool, EngineError> {
        let key = format!("{parent_key}/{}", corrective.name);
        if !self.should_run(corrective, &key, ctx)? {
            self.publish(WorkflowEvent::StepSkipped {
                run_id: self.run_id,
                step: key,
                restored: false,
            });
            return Ok(false);
        }

        self.publish(WorkflowEvent::StepStarted {
            run_id: self.run_id,
            step: key.clone(),
            kind: corrective.kind.name().to_string(),
            attempt,
        });
        let started = Instant::now();

        match self
            .run_leaf(corrective, &key, ctx, attempt, Some(failure.to_string()))
            .await
        {
            Ok(_) => {
                self.publish(WorkflowEvent::StepCompleted {
                    run_id: self.run_id,
                    step: key,
                    duration_ms: started.elapsed().as_millis() as u64,
                });
                Ok(true)
            }
            Err(EngineError::Cancelled) => Err(EngineError::Cancelled),
            Err(err) => {
                self.publish(WorkflowEvent::StepFailed {
                    run_id: self.run_id,
                    step: key,
                    error: err.to_string(),
                    will_retry: false,
                });
                Err(err)
            }
        }
    }

    // -----------------------------------------------------------------------
    // subworkflow
    // -----------------------------------------------------------------------

    async fn run_subworkflow(
        &self,
        step: &Step,
        key: &str,
        workflow: &str,
        inputs: &BTreeMap<String, Value>,
        scope: &Scope,
        ctx: &ExecutionContext,
    ) -> Result<Value, EngineError> {
        let max = self.config.max_subworkflow_depth;
        if scope.depth + 1 > max {
            return Err(EngineError::SubWorkflowDepthExceeded {
                step: key.to_string(),
                max,
            });
        }

        let definition = Arc::clone(self.registry.resolve_workflow(workflow).map_err(|source| {
            EngineError::Component {
                step: key.to_string(),
                source,
            }
        })?);

        let mut provided = Map::new();
        for (name, value) in inputs {
            let value = render_value(value, ctx).map_err(|e| EngineError::evaluation(key, e))?;
            provided.insert(name.clone(), value);
        }
        let resolved = resolve_inputs(&definition.inputs, &provided).map_err(|source| {
            EngineError::InvalidInputs {
                workflow: definition.name.clone(),
                source,
            }
        })?;

        let inner = scope.subworkflow(&step.name);
        let mut child_ctx = ExecutionContext::new(resolved);
        for child in &definition.steps {
            self.run_step(child, &inner, &mut child_ctx).await?;
        }

        Ok(Value::Object(evaluate_outputs(&definition, &child_ctx)?))
    }

    // -----------------------------------------------------------------------
    // branch
    // -----------------------------------------------------------------------

    async fn run_branch(
        &self,
        step: &Step,
        key: &str,
        arms: &[BranchArm],
        scope: &Scope,
        ctx: &mut ExecutionContext,
    ) -> Result<Value, EngineError> {
        let inner = scope.nested(&step.name);
        let chosen = match self.resumed_arm(arms, &inner) {
            Some(index) => Some(index),
            None => self.select_arm(arms, key, ctx)?,
        };

        for (index, arm) in arms.iter().enumerate() {
            if chosen != Some(index) {
                for child in &arm.steps {
                    mark_skipped_tree(child, ctx);
                }
            }
        }

        let Some(index) = chosen else {
            tracing::debug!(run_id = %self.run_id, step = key, "no branch arm matched");
            return Ok(json!({}));
        };

        let arm = &arms[index];
        tracing::debug!(run_id = %self.run_id, step = key, arm = arm.label.as_str(), "branch arm selected");
        for child in &arm.steps {
            self.run_step(child, &inner, ctx).await?;
        }
        Ok(json!({ "arm": arm.label }))
    }

    fn select_arm(
        &self,
        arms: &[BranchArm],
        key: &str,
        ctx: &ExecutionContext,
    ) -> Result<Option<usize>, EngineError> {
        for (index, arm) in arms.iter().enumerate() {
            let matched = match &arm.when {
                Some(condition) => self.condition_holds(condition, key, ctx)?,
                None => true,
            };
            if matched {
                return Ok(Some(index));
            }
        }
        Ok(None)
    }

    /// The arm already holding checkpoint records, if any.
    fn resumed_arm(&self, arms: &[BranchArm], inner: &Scope) -> Option<usize> {
        let resume = self.resume.as_deref()?;
        arms.iter().position(|arm| {
            arm.steps
                .iter()
                .any(|child| resume.has_records_under(&inner.key(&child.name)))
        })
    }

    // -----------------------------------------------------------------------
    // parallel
    // -----------------------------------------------------------------------

    /// Run every child concurrently on a snapshot of `ctx`, then merge the
    /// successful children back. A failing child never cancels its siblings.
    async fn run_parallel(
        &self,
        step: &Step,
        key: &str,
        children: &[Step],
        scope: &Scope,
        ctx: &mut ExecutionContext,
    ) -> Result<Value, EngineError> {
        let inner = scope.nested(&step.name);
        let permits = Arc::new(Semaphore::new(self.config.max_parallel.max(1)));
        let mut join_set = JoinSet::new();

        for (index, child) in children.iter().enumerate() {
            let driver = self.clone();
            let child = child.clone();
            let scope = inner.clone();
            let mut snapshot = ctx.clone();
            let permits = Arc::clone(&permits);

            join_set.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let result = driver.run_step(&child, &scope, &mut snapshot).await;
                (index, result, snapshot)
            });
        }

        let mut finished = Vec::with_capacity(children.len());
        let mut failures = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(done) => finished.push(done),
                Err(e) => failures.push(ChildFailure {
                    step: key.to_string(),
                    error: format!("task join error: {e}"),
                }),
            }
        }
        finished.sort_by_key(|(index, ..)| *index);

        let mut output = Map::new();
        let mut cancelled = false;
        for (index, result, snapshot) in finished {
            let child = &children[index];
            match result {
                Ok(()) => {
                    ctx.merge_steps(&snapshot, subtree_names(child));
                    let value = snapshot
                        .step_slot(&child.name)
                        .map(|slot| slot.output().clone())
                        .unwrap_or(Value::Null);
                    output.insert(child.name.clone(), value);
                }
                Err(EngineError::Cancelled) => cancelled = true,
                Err(err) => failures.push(ChildFailure {
                    step: inner.key(&child.name),
                    error: err.to_string(),
                }),
            }
        }

        if cancelled {
            return Err(EngineError::Cancelled);
        }
        if !failures.is_empty() {
            return Err(EngineError::ParallelFailed {
                step: key.to_string(),
                failures,
                completed: output,
            });
        }
        Ok(Value::Object(output))
    }

    /// Run the children once per item: items concurrently, the children of
    /// one item in order. The output lists each item's `{child: output}`.
    async fn run_for_each(
        &self,
        step: &Step,
        key: &str,
        children: &[Step],
        expression: &str,
        scope: &Scope,
        ctx: &ExecutionContext,
    ) -> Result<Value, EngineError> {
        let expr = parse_condition(expression).map_err(|e| EngineError::evaluation(key, e))?;
        let items = match expr.evaluate(ctx).map_err(|e| EngineError::evaluation(key, e))? {
            Value::Array(items) => items,
            other => {
                return Err(EngineError::NotAList {
                    step: key.to_string(),
                    found: json_type_name(&other),
                });
            }
        };

        let count = items.len();
        let children: Arc<[Step]> = children.into();
        let permits = Arc::new(Semaphore::new(self.config.max_parallel.max(1)));
        let mut join_set = JoinSet::new();

        for (index, item) in items.into_iter().enumerate() {
            let driver = self.clone();
            let children = Arc::clone(&children);
            let scope = scope.item(&step.name, index);
            let mut item_ctx = ctx.scoped_for_item(item, index);
            let permits = Arc::clone(&permits);

            join_set.spawn(async move {
                let _permit = permits.acquire_owned().await;
                for child in children.iter() {
                    if let Err(err) = driver.run_step(child, &scope, &mut item_ctx).await {
                        return (index, Err(err));
                    }
                }
                let outputs: Map<String, Value> = children
                    .iter()
                    .filter_map(|child| {
                        item_ctx
                            .step_slot(&child.name)
                            .map(|slot| (child.name.clone(), slot.output().clone()))
                    })
                    .collect();
                (index, Ok(outputs))
            });
        }

        let mut results: Vec<Option<Map<String, Value>>> = vec![None; count];
        let mut failures = Vec::new();
        let mut cancelled = false;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, Ok(outputs))) => results[index] = Some(outputs),
                Ok((_, Err(EngineError::Cancelled))) => cancelled = true,
                Ok((index, Err(err))) => failures.push(ChildFailure {
                    step: format!("{key}[{index}]"),
                    error: err.to_string(),
                }),
                Err(e) => failures.push(ChildFailure {
                    step: key.to_string(),
                    error: format!("task join error: {e}"),
                }),
            }
        }

        if cancelled {
            return Err(EngineError::Cancelled);
        }
        if !failures.is_empty() {
            failures.sort_by(|a, b| a.step.cmp(&b.step));
            let completed = results
                .into_iter()
                .enumerate()
                .filter_map(|(index, outputs)| {
                    outputs.map(|outputs| (index.to_string(), Value::Object(outputs)))
                })
                .collect();
            return Err(EngineError::ParallelFailed {
                step: key.to_string(),
                failures,
                completed,
            });
        }
        Ok(Value::Array(
            results
                .into_iter()
                .map(|outputs| Value::Object(outputs.unwrap_or_default()))
                .collect(),
        ))
    }
}

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// One failed child of a `parallel` step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChildFailure {
    /// Checkpoint key of the child (or `step[i]` for a `for_each` item).
    pub step: String,
    pub error: String,
}

fn format_failures(failures: &[ChildFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.step, f.error))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors that can occur during workflow execution.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Workflow document could not be loaded.
    #[error("workflow error: {0}")]
    Definition(#[from] WorkflowError),

    #[error("{source} (workflow '{workflow}')")]
    InvalidInputs { workflow: String, source: InputError },

    /// A `when`, argument, `for_each` or output expression failed.
    #[error("expression error in '{step}': {source}")]
    Evaluation { step: String, source: ExpressionError },

    /// A component named by the step is not registered.
    #[error("step '{step}': {source}")]
    Component { step: String, source: RegistryError },

    /// An executor returned an error.
    #[error("step '{step}' ({kind}) failed: {source}")]
    StepFailed {
        step: String,
        kind: &'static str,
        source: StepError,
    },

    #[error("step '{step}' timed out after {timeout_secs}s")]
    StepTimeout { step: String, timeout_secs: u64 },

    /// Every child ran; at least one failed.
    #[error("parallel step '{step}' failed: {}", format_failures(.failures))]
    ParallelFailed {
        step: String,
        failures: Vec<ChildFailure>,
        /// Outputs of the children that succeeded, keyed by child name
        /// (or by item index for `for_each`).
        completed: Map<String, Value>,
    },

    /// A validate step spent its retry budget.
    #[error("step '{step}' failed after {attempts} attempts: {last_error}")]
    RetryExhausted {
        step: String,
        attempts: u32,
        last_error: String,
    },

    #[error("for_each of step '{step}' must evaluate to an array, got {found}")]
    NotAList { step: String, found: &'static str },

    #[error("step '{step}' exceeds the maximum sub-workflow depth of {max}")]
    SubWorkflowDepthExceeded { step: String, max: u32 },

    /// Checkpoint persistence error.
    #[error("checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Workflow exceeded its overall timeout.
    #[error("workflow timed out after {secs}s")]
    WorkflowTimeout { secs: u64 },

    /// Workflow execution was cancelled.
    #[error("workflow cancelled")]
    Cancelled,

    /// Run not found (for cancel).
    #[error("workflow run not found: {0}")]
    RunNotFound(Uuid),

    #[error("workflow run {0} is already running")]
    AlreadyRunning(Uuid),

    /// The task driving the run panicked or was aborted.
    #[error("workflow task failed: {0}")]
    TaskFailed(String),
}

impl EngineError {
    fn evaluation(step: &str, err: impl Into<ExpressionError>) -> Self {
        EngineError::Evaluation {
            step: step.to_string(),
            source: err.into(),
        }
    }

    /// Checkpoint key of the step that failed, when the error names one.
    pub fn step(&self) -> Option<&str> {
        match self {
            EngineError::Evaluation { step, .. }
            | EngineError::Component { step, .. }
            | EngineError::StepFailed { step, .. }
            | EngineError::StepTimeout { step, .. }
            | EngineError::ParallelFailed { step, .. }
            | EngineError::RetryExhausted { step, .. }
            | EngineError::NotAList { step, .. }
            | EngineError::SubWorkflowDepthExceeded { step, .. } => Some(step),
            _ => None,
        }
    }

    /// The executor's own message for executor failures, the full message
    /// otherwise.
    fn cause_message(&self) -> String {
        match self {
            EngineError::StepFailed { source, .. } => source.to_string(),
            other => other.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
