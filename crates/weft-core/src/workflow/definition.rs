//! Workflow document parsing, version gate and filesystem operations.
//!
//! Converts between YAML/JSON text and the canonical `WorkflowDefinition`.
//! Parsing here is purely syntactic; semantic checks live in
//! [`validator`](super::validator).

use std::path::{Path, PathBuf};

use semver::{Version, VersionReq};
use serde_json::Value;
use thiserror::Error;

use weft_types::workflow::WorkflowDefinition;

use super::validator::Diagnostic;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while loading a workflow document.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML/JSON syntax or shape error.
    #[error("parse error: {0}")]
    Parse(String),

    #[error("unsupported workflow version '{0}' (expected 1.x)")]
    UnsupportedVersion(String),

    /// One or more validation diagnostics (strict mode).
    #[error("workflow failed validation with {} problem(s):\n{}", .0.len(), render_diagnostics(.0))]
    Validation(Vec<Diagnostic>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn render_diagnostics(diagnostics: &[Diagnostic]) -> String {
    diagnostics
        .iter()
        .map(|d| format!("  - {d}"))
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse YAML or JSON text into a `WorkflowDefinition`.
///
/// JSON is a subset of YAML, so one parser covers both.
pub fn parse_workflow_str(source: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let value: Value =
        serde_yaml_ng::from_str(source).map_err(|e| WorkflowError::Parse(e.to_string()))?;
    parse_workflow_value(value)
}

/// Parse an already-structured document.
pub fn parse_workflow_value(mut value: Value) -> Result<WorkflowDefinition, WorkflowError> {
    let Some(doc) = value.as_object_mut() else {
        return Err(WorkflowError::Parse(
            "workflow document must be a mapping".to_string(),
        ));
    };

    // `version: 1` arrives as a number from YAML; the model keeps it textual.
    let numeric = doc
        .get("version")
        .filter(|v| v.is_number())
        .map(Value::to_string);
    if let Some(text) = numeric {
        doc.insert("version".to_string(), Value::String(text));
    }

    let def: WorkflowDefinition =
        serde_json::from_value(value).map_err(|e| WorkflowError::Parse(e.to_string()))?;
    check_version(&def.version)?;
    Ok(def)
}

/// Accept `"1"`, `"1.0"`, `"1.2.3"` and any other 1.x version.
pub fn check_version(version: &str) -> Result<(), WorkflowError> {
    let unsupported = || WorkflowError::UnsupportedVersion(version.to_string());

    let trimmed = version.trim();
    let parts = trimmed.split('.').count();
    let normalized = match parts {
        1 => format!("{trimmed}.0.0"),
        2 => format!("{trimmed}.0"),
        _ => trimmed.to_string(),
    };

    let parsed = Version::parse(&normalized).map_err(|_| unsupported())?;
    let supported = VersionReq::parse("^1").map_err(|_| unsupported())?;
    if supported.matches(&parsed) {
        Ok(())
    } else {
        Err(unsupported())
    }
}

/// Serialize a `WorkflowDefinition` to a YAML string.
pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, WorkflowError> {
    serde_yaml_ng::to_string(def).map_err(|e| WorkflowError::Parse(e.to_string()))
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a workflow definition from a YAML or JSON file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_str(&content)
}

/// Save a workflow definition as YAML, creating parent directories.
pub fn save_workflow_file(path: &Path, def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serialize_workflow_yaml(def)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

/// Discover all workflow files under `base_dir`.
///
/// Scans recursively for `.yaml`, `.yml` and `.json` files. Files that fail
/// to parse are skipped with a warning.
pub fn discover_workflows(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowDefinition)>, WorkflowError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowDefinition)>,
) -> Result<(), WorkflowError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
            continue;
        }
        let is_workflow_file = path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml" || ext == "json");
        if !is_workflow_file {
            continue;
        }
        match load_workflow_file(&path) {
            Ok(def) => results.push((path, def)),
            Err(error) => {
                tracing::warn!(?path, %error, "skipping unparseable workflow file");
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weft_types::workflow::StepKind;

    const GREET: &str = r#"
version: "1"
name: greet
description: Greets someone
inputs:
  name: { type: string, required: true }
  skip: { type: boolean }
steps:
  - name: hello
    type: python
    action: echo
    args: { text: "${{ inputs.name }}" }
    when: "${{ not inputs.skip }}"
outputs:
  greeting: "${{ steps.hello.output }}"
"#;

    #[test]
    fn test_parse_greet_document() {
        let def = parse_workflow_str(GREET).expect("should parse");
        assert_eq!(def.name, "greet");
        assert_eq!(def.inputs.len(), 2);
        assert_eq!(def.steps.len(), 1);
        assert!(matches!(def.steps[0].kind, StepKind::Python { ref action, .. } if action == "echo"));
        assert_eq!(def.outputs[0].name, "greeting");
    }

    #[test]
    fn test_serialize_then_parse_is_identity() {
        let def = parse_workflow_str(GREET).unwrap();
        let yaml = serialize_workflow_yaml(&def).unwrap();
        assert_eq!(parse_workflow_str(&yaml).unwrap(), def);
    }

    #[test]
    fn test_parse_json_text_and_value() {
        let doc = json!({
            "version": "1.0",
            "name": "json-flow",
            "steps": [{"name": "a", "type": "agent", "agent": "writer"}]
        });
        let from_text = parse_workflow_str(&doc.to_string()).unwrap();
        let from_value = parse_workflow_value(doc).unwrap();
        assert_eq!(from_text, from_value);
    }

    #[test]
    fn test_numeric_version_accepted() {
        let def = parse_workflow_str("version: 1\nname: n\nsteps: []\n").unwrap();
        assert_eq!(def.version, "1");
    }

    #[test]
    fn test_unknown_top_level_key_rejected() {
        let err = parse_workflow_str("version: '1'\nname: n\nsteps: []\ntriggers: []\n").unwrap_err();
        assert!(matches!(err, WorkflowError::Parse(ref msg) if msg.contains("triggers")), "got: {err}");
    }

    #[test]
    fn test_non_mapping_rejected() {
        let err = parse_workflow_str("- just\n- a list\n").unwrap_err();
        assert!(err.to_string().contains("must be a mapping"), "got: {err}");
    }

    #[test]
    fn test_version_gate() {
        for ok in ["1", "1.0", "1.2.3", " 1.4 "] {
            assert!(check_version(ok).is_ok(), "{ok} should be accepted");
        }
        for bad in ["2", "0.9", "2.0.0", "v1", "", "one"] {
            let err = check_version(bad).unwrap_err();
            assert!(matches!(err, WorkflowError::UnsupportedVersion(_)), "{bad}");
        }
    }

    #[test]
    fn test_save_and_load_workflow_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workflows/greet.yaml");

        let def = parse_workflow_str(GREET).unwrap();
        save_workflow_file(&path, &def).expect("should save");

        let loaded = load_workflow_file(&path).expect("should load");
        assert_eq!(loaded, def);
    }

    #[test]
    fn test_discover_workflows() {
        let dir = tempfile::tempdir().unwrap();
        let def = parse_workflow_str(GREET).unwrap();

        save_workflow_file(&dir.path().join("greet.yaml"), &def).unwrap();
        save_workflow_file(&dir.path().join("nested/again.yml"), &def).unwrap();
        std::fs::write(dir.path().join("not-a-workflow.yaml"), "key: value").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let found = discover_workflows(dir.path()).expect("should discover");
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn test_discover_nonexistent_dir() {
        let found = discover_workflows(Path::new("/nonexistent/path")).unwrap();
        assert!(found.is_empty());
    }
}
