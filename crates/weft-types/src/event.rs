//! Event types for the weft workflow event bus.
//!
//! `WorkflowEvent` is broadcast by the engine as a run progresses. All
//! variants are Clone + Send + Sync for use with tokio broadcast channels,
//! and every variant carries the `run_id` so subscribers can filter.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Events emitted during workflow execution.
///
/// Step identifiers are scope-qualified checkpoint keys (`fanout/left`,
/// `publish/upload`), so nested steps are distinguishable in the stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// A run has started (or re-entered after a checkpoint).
    RunStarted {
        run_id: Uuid,
        workflow_name: String,
        resumed: bool,
    },

    /// A step has been dispatched.
    StepStarted {
        run_id: Uuid,
        step: String,
        kind: String,
        attempt: u32,
    },

    /// A step's condition evaluated false (or a persisted skip was replayed).
    StepSkipped {
        run_id: Uuid,
        step: String,
        restored: bool,
    },

    /// A step's output was restored from a checkpoint instead of re-running.
    StepRestored { run_id: Uuid, step: String },

    /// A step completed successfully.
    StepCompleted {
        run_id: Uuid,
        step: String,
        duration_ms: u64,
    },

    /// A step failed.
    StepFailed {
        run_id: Uuid,
        step: String,
        error: String,
        will_retry: bool,
    },

    /// A validate step is about to re-attempt, after its corrective step ran.
    StepRetrying {
        run_id: Uuid,
        step: String,
        attempt: u32,
        corrective_step: Option<String>,
    },

    /// A run completed successfully.
    RunCompleted {
        run_id: Uuid,
        workflow_name: String,
        duration_ms: u64,
        steps_completed: u32,
    },

    /// A run failed.
    RunFailed {
        run_id: Uuid,
        workflow_name: String,
        step: Option<String>,
        error: String,
    },

    /// A run was cancelled.
    RunCancelled { run_id: Uuid, workflow_name: String },
}

impl WorkflowEvent {
    /// The run this event belongs to.
    pub fn run_id(&self) -> Uuid {
        match self {
            WorkflowEvent::RunStarted { run_id, .. }
            | WorkflowEvent::StepStarted { run_id, .. }
            | WorkflowEvent::StepSkipped { run_id, .. }
            | WorkflowEvent::StepRestored { run_id, .. }
            | WorkflowEvent::StepCompleted { run_id, .. }
            | WorkflowEvent::StepFailed { run_id, .. }
            | WorkflowEvent::StepRetrying { run_id, .. }
            | WorkflowEvent::RunCompleted { run_id, .. }
            | WorkflowEvent::RunFailed { run_id, .. }
            | WorkflowEvent::RunCancelled { run_id, .. } => *run_id,
        }
    }

    /// Whether this event ends a run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowEvent::RunCompleted { .. }
                | WorkflowEvent::RunFailed { .. }
                | WorkflowEvent::RunCancelled { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let run_id = Uuid::now_v7();
        let event = WorkflowEvent::StepSkipped {
            run_id,
            step: "hello".to_string(),
            restored: false,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], json!("step_skipped"));
        assert_eq!(value["step"], json!("hello"));

        let back: WorkflowEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.run_id(), run_id);
    }

    #[test]
    fn test_terminal_events() {
        let run_id = Uuid::nil();
        assert!(
            WorkflowEvent::RunCancelled {
                run_id,
                workflow_name: "wf".to_string()
            }
            .is_terminal()
        );
        assert!(
            !WorkflowEvent::StepRestored {
                run_id,
                step: "a".to_string()
            }
            .is_terminal()
        );
    }
}
