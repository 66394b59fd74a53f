//! Structural walks over a step tree and sub-workflow cycle detection.
//!
//! Sub-workflow references form a directed graph between workflow names.
//! `petgraph` models it; a failed topological sort means a workflow can reach
//! itself through `subworkflow` steps, and the strongly connected component
//! around the offending node names the workflows involved.

use std::collections::{HashMap, VecDeque};

use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use weft_types::workflow::{Step, StepKind, WorkflowDefinition};

use super::registry::ComponentRegistry;

// ---------------------------------------------------------------------------
// Step tree walks
// ---------------------------------------------------------------------------

/// Direct children of a composite step, in definition order.
///
/// A validate step's `on_failure` counts as its child.
pub fn child_steps(step: &Step) -> Vec<&Step> {
    match &step.kind {
        StepKind::Parallel { steps, .. } => steps.iter().collect(),
        StepKind::Branch { arms } => arms.iter().flat_map(|arm| arm.steps.iter()).collect(),
        StepKind::Validate {
            on_failure: Some(corrective),
            ..
        } => vec![corrective.as_ref()],
        _ => Vec::new(),
    }
}

/// Visit every step in the tree, parents before children.
pub fn visit_steps<'a>(steps: &'a [Step], visit: &mut dyn FnMut(&'a Step)) {
    for step in steps {
        visit_step(step, visit);
    }
}

fn visit_step<'a>(step: &'a Step, visit: &mut dyn FnMut(&'a Step)) {
    visit(step);
    for child in child_steps(step) {
        visit_step(child, visit);
    }
}

/// Names of every workflow referenced by a `subworkflow` step, in order of
/// first appearance.
pub fn subworkflow_references(def: &WorkflowDefinition) -> Vec<&str> {
    let mut names: Vec<&str> = Vec::new();
    visit_steps(&def.steps, &mut |step| {
        if let StepKind::Subworkflow { workflow, .. } = &step.kind {
            if !names.contains(&workflow.as_str()) {
                names.push(workflow.as_str());
            }
        }
    });
    names
}

// ---------------------------------------------------------------------------
// Cycle detection
// ---------------------------------------------------------------------------

/// Find a sub-workflow cycle reachable from `root`.
///
/// Unregistered targets are ignored here; they are reported separately as
/// unknown references. Returns the sorted names of the workflows forming the
/// cycle.
pub fn find_subworkflow_cycle(
    root: &WorkflowDefinition,
    registry: &ComponentRegistry,
) -> Option<Vec<String>> {
    let mut graph = DiGraph::<String, ()>::new();
    let mut indices: HashMap<String, NodeIndex> = HashMap::new();
    let mut queue: VecDeque<(NodeIndex, &WorkflowDefinition)> = VecDeque::new();

    let root_idx = graph.add_node(root.name.clone());
    indices.insert(root.name.clone(), root_idx);
    queue.push_back((root_idx, root));

    while let Some((from, def)) = queue.pop_front() {
        for target in subworkflow_references(def) {
            let to = match indices.get(target) {
                Some(idx) => *idx,
                None => {
                    let Some(child) = registry.workflow(target) else {
                        continue;
                    };
                    let idx = graph.add_node(target.to_string());
                    indices.insert(target.to_string(), idx);
                    queue.push_back((idx, child.as_ref()));
                    idx
                }
            };
            graph.add_edge(from, to, ());
        }
    }

    let cycle = toposort(&graph, None).err()?;
    let offending = cycle.node_id();
    let component = tarjan_scc(&graph)
        .into_iter()
        .find(|scc| scc.contains(&offending))
        .unwrap_or_else(|| vec![offending]);

    let mut names: Vec<String> = component.into_iter().map(|idx| graph[idx].clone()).collect();
    names.sort();
    Some(names)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::definition::parse_workflow_str;

    fn workflow(name: &str, children: &[&str]) -> WorkflowDefinition {
        let mut yaml = format!("version: '1'\nname: {name}\nsteps:\n  - name: {name}-local\n    type: python\n    action: echo\n");
        for child in children {
            yaml.push_str(&format!(
                "  - name: {name}-calls-{child}\n    type: subworkflow\n    workflow: {child}\n"
            ));
        }
        parse_workflow_str(&yaml).unwrap()
    }

    #[test]
    fn test_visit_steps_reaches_nested_children() {
        let def = parse_workflow_str(
            r#"
version: "1"
name: nested
steps:
  - name: fan
    type: parallel
    steps:
      - { name: a, type: python, action: echo }
      - name: pick
        type: branch
        arms:
          - label: approved
            steps: [{ name: b, type: agent, agent: writer }]
  - name: check
    type: validate
    stages: [lint]
    on_failure: { name: fix, type: generate, generator: fixer }
"#,
        )
        .unwrap();

        let mut seen = Vec::new();
        visit_steps(&def.steps, &mut |step| seen.push(step.name.clone()));
        assert_eq!(seen, vec!["fan", "a", "pick", "b", "check", "fix"]);
    }

    #[test]
    fn test_subworkflow_references_deduplicated() {
        let def = workflow("parent", &["child", "other", "child"]);
        assert_eq!(subworkflow_references(&def), vec!["child", "other"]);
    }

    #[test]
    fn test_no_cycle() {
        let mut registry = ComponentRegistry::new();
        registry.register_subworkflow(workflow("child", &["leaf"])).unwrap();
        registry.register_subworkflow(workflow("leaf", &[])).unwrap();

        assert!(find_subworkflow_cycle(&workflow("root", &["child", "leaf"]), &registry).is_none());
    }

    #[test]
    fn test_indirect_cycle_detected() {
        let mut registry = ComponentRegistry::new();
        registry.register_subworkflow(workflow("a", &["b"])).unwrap();
        registry.register_subworkflow(workflow("b", &["a"])).unwrap();

        let cycle = find_subworkflow_cycle(&workflow("root", &["a"]), &registry).unwrap();
        assert_eq!(cycle, vec!["a", "b"]);
    }

    #[test]
    fn test_self_reference_through_registry() {
        let mut registry = ComponentRegistry::new();
        registry.register_subworkflow(workflow("loop", &["loop"])).unwrap();

        let cycle = find_subworkflow_cycle(&workflow("loop", &["loop"]), &registry).unwrap();
        assert_eq!(cycle, vec!["loop"]);
    }

    #[test]
    fn test_unregistered_target_ignored() {
        let registry = ComponentRegistry::new();
        assert!(find_subworkflow_cycle(&workflow("root", &["ghost"]), &registry).is_none());
    }
}
