//! Workflow domain types for weft.
//!
//! Defines the canonical representation of a parsed workflow document:
//! `WorkflowDefinition` with its ordered inputs, steps and outputs. The
//! document format is YAML (or JSON), and this module round-trips it
//! losslessly: `inputs` and `outputs` are mappings in the document but keep
//! their declaration order here.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A parsed workflow document. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkflowDefinition {
    /// Document format version (must be a 1.x version).
    pub version: String,
    /// Workflow name.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Declared inputs, in declaration order.
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        serialize_with = "serialize_inputs",
        deserialize_with = "deserialize_inputs"
    )]
    pub inputs: Vec<InputSpec>,
    /// Ordered top-level steps.
    pub steps: Vec<Step>,
    /// Named output expressions, in declaration order.
    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        serialize_with = "serialize_outputs",
        deserialize_with = "deserialize_outputs"
    )]
    pub outputs: Vec<OutputSpec>,
}

impl WorkflowDefinition {
    /// Look up a declared input by name.
    pub fn input(&self, name: &str) -> Option<&InputSpec> {
        self.inputs.iter().find(|i| i.name == name)
    }
}

// ---------------------------------------------------------------------------
// Inputs and outputs
// ---------------------------------------------------------------------------

/// A declared workflow input.
#[derive(Debug, Clone, PartialEq)]
pub struct InputSpec {
    pub name: String,
    pub input_type: InputType,
    pub required: bool,
    pub default: Option<Value>,
    pub description: Option<String>,
}

/// Type tag of a workflow input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
    #[default]
    Any,
}

impl InputType {
    /// Whether `value` conforms to this type. `null` never conforms except for `Any`.
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            InputType::String => value.is_string(),
            InputType::Integer => value.is_i64() || value.is_u64(),
            InputType::Number => value.is_number(),
            InputType::Boolean => value.is_boolean(),
            InputType::Array => value.is_array(),
            InputType::Object => value.is_object(),
            InputType::Any => true,
        }
    }
}

impl fmt::Display for InputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InputType::String => "string",
            InputType::Integer => "integer",
            InputType::Number => "number",
            InputType::Boolean => "boolean",
            InputType::Array => "array",
            InputType::Object => "object",
            InputType::Any => "any",
        };
        f.write_str(s)
    }
}

/// A named workflow output and the expression producing it.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSpec {
    pub name: String,
    pub expression: String,
}

/// Body of an input entry as it appears in the document (the key is the name).
#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct InputBody {
    #[serde(default, rename = "type")]
    input_type: InputType,
    #[serde(default)]
    required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    description: Option<String>,
}

fn serialize_inputs<S: Serializer>(inputs: &[InputSpec], serializer: S) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(inputs.len()))?;
    for input in inputs {
        let body = InputBody {
            input_type: input.input_type,
            required: input.required,
            default: input.default.clone(),
            description: input.description.clone(),
        };
        map.serialize_entry(&input.name, &body)?;
    }
    map.end()
}

fn deserialize_inputs<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<InputSpec>, D::Error> {
    struct InputsVisitor;

    impl<'de> Visitor<'de> for InputsVisitor {
        type Value = Vec<InputSpec>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a mapping of input name to input specification")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
            let mut inputs = Vec::new();
            while let Some((name, body)) = access.next_entry::<String, InputBody>()? {
                inputs.push(InputSpec {
                    name,
                    input_type: body.input_type,
                    required: body.required,
                    default: body.default,
                    description: body.description,
                });
            }
            Ok(inputs)
        }
    }

    deserializer.deserialize_map(InputsVisitor)
}

fn serialize_outputs<S: Serializer>(outputs: &[OutputSpec], serializer: S) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(outputs.len()))?;
    for output in outputs {
        map.serialize_entry(&output.name, &output.expression)?;
    }
    map.end()
}

fn deserialize_outputs<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<OutputSpec>, D::Error> {
    struct OutputsVisitor;

    impl<'de> Visitor<'de> for OutputsVisitor {
        type Value = Vec<OutputSpec>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a mapping of output name to expression")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
            let mut outputs = Vec::new();
            while let Some((name, expression)) = access.next_entry::<String, String>()? {
                outputs.push(OutputSpec { name, expression });
            }
            Ok(outputs)
        }
    }

    deserializer.deserialize_map(OutputsVisitor)
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// A single named unit of work.
///
/// The kind is flattened into the step mapping and discriminated by `type`:
/// ```yaml
/// - name: hello
///   type: python
///   action: echo
///   args: { text: "${{ inputs.name }}" }
///   when: "${{ not inputs.skip }}"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Unique step name (also the context and checkpoint key).
    pub name: String,
    /// Optional run condition; absent means always run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    /// Step-level timeout override in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Kind-specific configuration.
    #[serde(flatten)]
    pub kind: StepKind,
}

/// Closed set of step kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Call a registered action.
    Python {
        action: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        args: BTreeMap<String, Value>,
    },
    /// Invoke a registered agent.
    Agent {
        agent: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        context: BTreeMap<String, Value>,
    },
    /// Invoke a registered generator.
    Generate {
        generator: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        context: BTreeMap<String, Value>,
    },
    /// Run validation stages (registered actions), retrying with a corrective step.
    Validate {
        stages: Vec<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        args: BTreeMap<String, Value>,
        #[serde(default)]
        retry: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        on_failure: Option<Box<Step>>,
    },
    /// Run a registered workflow as a nested run.
    Subworkflow {
        workflow: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        inputs: BTreeMap<String, Value>,
    },
    /// Run the first arm whose condition holds.
    Branch { arms: Vec<BranchArm> },
    /// Run children concurrently, optionally once per item of `for_each`.
    Parallel {
        steps: Vec<Step>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        for_each: Option<String>,
    },
}

impl StepKind {
    /// The `type` tag as written in documents.
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Python { .. } => "python",
            StepKind::Agent { .. } => "agent",
            StepKind::Generate { .. } => "generate",
            StepKind::Validate { .. } => "validate",
            StepKind::Subworkflow { .. } => "subworkflow",
            StepKind::Branch { .. } => "branch",
            StepKind::Parallel { .. } => "parallel",
        }
    }

    /// Leaf kinds dispatch straight to an external executor.
    pub fn is_leaf(&self) -> bool {
        matches!(
            self,
            StepKind::Python { .. } | StepKind::Agent { .. } | StepKind::Generate { .. }
        )
    }
}

/// One labeled arm of a `branch` step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchArm {
    pub label: String,
    /// Arm condition; an arm without one always matches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    pub steps: Vec<Step>,
}

// ---------------------------------------------------------------------------
// Run status
// ---------------------------------------------------------------------------

/// Lifecycle state of one workflow run.
///
/// `Pending -> Running -> {Completed, Failed, Cancelled}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Pending, RunStatus::Running)
                | (RunStatus::Pending, RunStatus::Cancelled)
                | (RunStatus::Running, RunStatus::Completed)
                | (RunStatus::Running, RunStatus::Failed)
                | (RunStatus::Running, RunStatus::Cancelled)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn leaf(name: &str, action: &str) -> Step {
        Step {
            name: name.to_string(),
            when: None,
            timeout_secs: None,
            kind: StepKind::Python {
                action: action.to_string(),
                args: BTreeMap::from([("text".to_string(), json!("${{ inputs.name }}"))]),
            },
        }
    }

    /// A definition exercising every step kind.
    fn sample_workflow() -> WorkflowDefinition {
        WorkflowDefinition {
            version: "1".to_string(),
            name: "release".to_string(),
            description: Some("Build, check and publish".to_string()),
            inputs: vec![
                InputSpec {
                    name: "name".to_string(),
                    input_type: InputType::String,
                    required: true,
                    default: None,
                    description: Some("who to greet".to_string()),
                },
                InputSpec {
                    name: "skip".to_string(),
                    input_type: InputType::Boolean,
                    required: false,
                    default: Some(json!(false)),
                    description: None,
                },
            ],
            steps: vec![
                Step {
                    when: Some("${{ not inputs.skip }}".to_string()),
                    ..leaf("hello", "echo")
                },
                Step {
                    name: "plan".to_string(),
                    when: None,
                    timeout_secs: Some(30),
                    kind: StepKind::Agent {
                        agent: "planner".to_string(),
                        context: BTreeMap::from([("goal".to_string(), json!("ship"))]),
                    },
                },
                Step {
                    name: "draft".to_string(),
                    when: None,
                    timeout_secs: None,
                    kind: StepKind::Generate {
                        generator: "changelog".to_string(),
                        context: BTreeMap::new(),
                    },
                },
                Step {
                    name: "check".to_string(),
                    when: None,
                    timeout_secs: None,
                    kind: StepKind::Validate {
                        stages: vec!["lint".to_string(), "test".to_string()],
                        args: BTreeMap::new(),
                        retry: 3,
                        on_failure: Some(Box::new(leaf("fix", "autofix"))),
                    },
                },
                Step {
                    name: "fanout".to_string(),
                    when: None,
                    timeout_secs: None,
                    kind: StepKind::Parallel {
                        steps: vec![leaf("left", "echo"), leaf("right", "echo")],
                        for_each: None,
                    },
                },
                Step {
                    name: "route".to_string(),
                    when: None,
                    timeout_secs: None,
                    kind: StepKind::Branch {
                        arms: vec![
                            BranchArm {
                                label: "fast".to_string(),
                                when: Some("${{ inputs.skip }}".to_string()),
                                steps: vec![leaf("quick", "echo")],
                            },
                            BranchArm {
                                label: "slow".to_string(),
                                when: None,
                                steps: vec![leaf("careful", "echo")],
                            },
                        ],
                    },
                },
                Step {
                    name: "publish".to_string(),
                    when: None,
                    timeout_secs: None,
                    kind: StepKind::Subworkflow {
                        workflow: "publish-flow".to_string(),
                        inputs: BTreeMap::from([(
                            "target".to_string(),
                            json!("${{ steps.draft.output }}"),
                        )]),
                    },
                },
            ],
            outputs: vec![
                OutputSpec {
                    name: "greeting".to_string(),
                    expression: "${{ steps.hello.output }}".to_string(),
                },
                OutputSpec {
                    name: "checked".to_string(),
                    expression: "${{ steps.check.output }}".to_string(),
                },
            ],
        }
    }

    #[test]
    fn test_workflow_yaml_roundtrip() {
        let def = sample_workflow();
        let yaml = serde_yaml_ng::to_string(&def).unwrap();
        let parsed: WorkflowDefinition = serde_yaml_ng::from_str(&yaml).unwrap();
        assert_eq!(parsed, def);
    }

    #[test]
    fn test_workflow_json_roundtrip() {
        let def = sample_workflow();
        let json = serde_json::to_string(&def).unwrap();
        let parsed: WorkflowDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, def);
    }

    #[test]
    fn test_inputs_keep_declaration_order() {
        let yaml = r#"
version: "1"
name: ordered
inputs:
  zeta: { type: string }
  alpha: { type: integer, required: true }
  mid: {}
steps:
  - name: only
    type: python
    action: noop
"#;
        let def: WorkflowDefinition = serde_yaml_ng::from_str(yaml).unwrap();
        let names: Vec<&str> = def.inputs.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
        assert_eq!(def.inputs[1].input_type, InputType::Integer);
        assert!(def.inputs[1].required);
        assert_eq!(def.inputs[2].input_type, InputType::Any);
    }

    #[test]
    fn test_unknown_top_level_key_rejected() {
        let yaml = r#"
version: "1"
name: bad
triggers: []
steps: []
"#;
        let err = serde_yaml_ng::from_str::<WorkflowDefinition>(yaml).unwrap_err();
        assert!(err.to_string().contains("triggers"), "got: {err}");
    }

    #[test]
    fn test_step_kind_tag_parsing() {
        let yaml = r#"
name: gate
type: validate
stages: [lint]
retry: 2
on_failure:
  name: repair
  type: agent
  agent: fixer
"#;
        let step: Step = serde_yaml_ng::from_str(yaml).unwrap();
        assert_eq!(step.kind.name(), "validate");
        match step.kind {
            StepKind::Validate { retry, on_failure, .. } => {
                assert_eq!(retry, 2);
                let fix = on_failure.unwrap();
                assert_eq!(fix.name, "repair");
                assert!(fix.kind.is_leaf());
            }
            other => panic!("expected validate, got {other:?}"),
        }
    }

    #[test]
    fn test_input_type_accepts() {
        assert!(InputType::String.accepts(&json!("x")));
        assert!(!InputType::String.accepts(&json!(1)));
        assert!(InputType::Integer.accepts(&json!(-3)));
        assert!(!InputType::Integer.accepts(&json!(1.5)));
        assert!(InputType::Number.accepts(&json!(1.5)));
        assert!(InputType::Boolean.accepts(&json!(true)));
        assert!(InputType::Array.accepts(&json!([])));
        assert!(InputType::Object.accepts(&json!({})));
        assert!(InputType::Any.accepts(&Value::Null));
    }

    #[test]
    fn test_run_status_transitions() {
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Completed));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Cancelled));
        assert!(!RunStatus::Completed.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Pending.can_transition_to(RunStatus::Completed));
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn test_run_status_serde() {
        assert_eq!(serde_json::to_value(RunStatus::Cancelled).unwrap(), json!("cancelled"));
        let parsed: RunStatus = serde_json::from_value(json!("running")).unwrap();
        assert_eq!(parsed, RunStatus::Running);
    }
}
