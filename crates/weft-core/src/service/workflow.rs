//! Workflow service: the command surface over the engine.
//!
//! `validate` returns every diagnostic for a workflow document without
//! running it. `run` loads, validates and executes a document (or resumes a
//! checkpointed run) and yields the run's events followed by its result.

use std::sync::Arc;

use futures_util::Stream;
use serde_json::{Map, Value};
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;
use weft_types::config::ValidationMode;
use weft_types::event::WorkflowEvent;

use crate::repository::checkpoint::CheckpointRepository;
use crate::workflow::definition::{WorkflowError, parse_workflow_str};
use crate::workflow::executor::{EngineError, ExecutionResult, WorkflowEngine, WorkflowExecutor};
use crate::workflow::validator::{Diagnostic, DiagnosticKind, load_workflow, validate_definition};

/// One item of a run stream.
#[derive(Debug)]
pub enum RunUpdate {
    Event(WorkflowEvent),
    /// Always the last item.
    Finished(Result<ExecutionResult, EngineError>),
}

/// Service exposing `validate` and `run` over a shared engine.
///
/// Generic over the checkpoint repository so the same service runs against
/// SQLite in production and the in-memory store in tests.
pub struct WorkflowService<R: CheckpointRepository> {
    engine: Arc<WorkflowEngine<R>>,
    mode: ValidationMode,
}

impl<R: CheckpointRepository + 'static> WorkflowService<R> {
    pub fn new(engine: Arc<WorkflowEngine<R>>) -> Self {
        let mode = engine.config().validation;
        Self { engine, mode }
    }

    pub fn engine(&self) -> &Arc<WorkflowEngine<R>> {
        &self.engine
    }

    /// Parse and statically check `source`. Document-level errors (syntax,
    /// version) come back as a single diagnostic.
    pub fn validate(&self, source: &str) -> Vec<Diagnostic> {
        match parse_workflow_str(source) {
            Ok(def) => validate_definition(&def, self.engine.registry()),
            Err(err) => {
                let path = match &err {
                    WorkflowError::UnsupportedVersion(_) => "version",
                    _ => "",
                };
                vec![Diagnostic {
                    kind: DiagnosticKind::Structure,
                    path: path.to_string(),
                    message: err.to_string(),
                    offset: None,
                }]
            }
        }
    }

    /// Run `source` with `inputs`, or resume `resume_from` with `inputs` as
    /// overrides.
    ///
    /// The stream yields this run's events as they are published and ends
    /// with [`RunUpdate::Finished`]. Load and validation failures produce a
    /// single `Finished` item.
    pub fn run(
        &self,
        source: &str,
        inputs: Map<String, Value>,
        resume_from: Option<Uuid>,
    ) -> impl Stream<Item = RunUpdate> + Send + 'static {
        let engine = Arc::clone(&self.engine);
        let loaded = load_workflow(source, engine.registry(), self.mode);

        async_stream::stream! {
            let def = match loaded {
                Ok((def, diagnostics)) => {
                    let blocking: Vec<Diagnostic> = diagnostics
                        .into_iter()
                        .filter(|diagnostic| diagnostic.kind.blocks_execution())
                        .collect();
                    if !blocking.is_empty() {
                        yield RunUpdate::Finished(Err(EngineError::Definition(WorkflowError::Validation(blocking))));
                        return;
                    }
                    def
                }
                Err(err) => {
                    yield RunUpdate::Finished(Err(EngineError::Definition(err)));
                    return;
                }
            };

            let run_id = resume_from.unwrap_or_else(Uuid::now_v7);
            // Subscribe before the run starts so no event is missed.
            let mut rx = engine.event_bus().subscribe();

            let mut handle = tokio::spawn({
                let engine = Arc::clone(&engine);
                async move {
                    match resume_from {
                        Some(run_id) => engine.resume(run_id, &def, inputs).await,
                        None => engine.execute_with_id(run_id, &def, inputs).await,
                    }
                }
            });

            let joined = loop {
                let next = tokio::select! {
                    biased;
                    event = rx.recv() => Next::Event(event),
                    joined = &mut handle => Next::Done(joined),
                };
                match next {
                    Next::Event(Ok(event)) => {
                        if event.run_id() == run_id {
                            yield RunUpdate::Event(event);
                        }
                    }
                    Next::Event(Err(RecvError::Lagged(skipped))) => {
                        tracing::warn!(run_id = %run_id, skipped, "run update stream lagged behind the event bus");
                    }
                    Next::Event(Err(RecvError::Closed)) => break (&mut handle).await,
                    Next::Done(joined) => break joined,
                }
            };

            // Events published right before the task finished.
            while let Ok(event) = rx.try_recv() {
                if event.run_id() == run_id {
                    yield RunUpdate::Event(event);
                }
            }

            let result = match joined {
                Ok(result) => result,
                Err(e) => Err(EngineError::TaskFailed(e.to_string())),
            };
            yield RunUpdate::Finished(result);
        }
    }
}

enum Next<E, J> {
    Event(E),
    Done(J),
}
