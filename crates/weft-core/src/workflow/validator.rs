//! Static validation of a parsed workflow.
//!
//! Validation never stops at the first problem: every check appends to one
//! diagnostics list. In strict mode any diagnostic rejects the workflow; in
//! lenient mode the definition is returned alongside its diagnostics.
//!
//! Reference visibility follows execution order. A step sees the steps that
//! are guaranteed to have settled before it starts:
//! - earlier steps in the same sequence, plus everything they expose;
//! - not itself, not later steps;
//! - not a sibling arm of the same branch;
//! - not a concurrent sibling inside a `parallel` (inside a `for_each` body
//!   the children of one item run in order, so earlier children are visible).
//!
//! A finished branch exposes the steps of all its arms (untaken arms read as
//! null). A finished `parallel` without `for_each` exposes its children; a
//! `for_each` body is private to its iterations.

use std::collections::HashSet;
use std::fmt;

use serde_json::Value;
use weft_types::config::ValidationMode;
use weft_types::workflow::{Step, StepKind, WorkflowDefinition};

use super::definition::{WorkflowError, parse_workflow_str, parse_workflow_value};
use super::expression::{Expr, ParseError, Reference, Template, parse_condition};
use super::graph::{find_subworkflow_cycle, visit_steps};
use super::registry::{ComponentKind, ComponentRegistry};

// ---------------------------------------------------------------------------
// Diagnostic
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// Shape problems: empty lists, bad names, duplicates.
    Structure,
    /// Expression or template syntax.
    Syntax,
    /// Unregistered action, agent, generator or sub-workflow.
    UnknownComponent,
    /// A reference to an undeclared input or an invisible step.
    Reference,
    /// `item`/`index` outside a `for_each` scope.
    Scope,
    /// Input default or sub-workflow input mismatch.
    Type,
    /// Sub-workflow cycle.
    Cycle,
}

impl DiagnosticKind {
    /// Whether a definition carrying this finding may still be executed.
    ///
    /// Only `Type` findings are tolerated: a mismatched default is used as
    /// written and sub-workflow inputs are checked again at call time.
    pub fn blocks_execution(self) -> bool {
        !matches!(self, Self::Type)
    }
}

/// One validation finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    /// Field path, e.g. `fan/fetch.args.url` or `outputs.greeting`.
    pub path: String,
    pub message: String,
    /// Character offset within the field, for syntax errors.
    pub offset: Option<usize>,
}

impl Diagnostic {
    fn new(kind: DiagnosticKind, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            message: message.into(),
            offset: None,
        }
    }

    fn syntax(path: impl Into<String>, error: &ParseError) -> Self {
        Self {
            kind: DiagnosticKind::Syntax,
            path: path.into(),
            message: error.message.clone(),
            offset: Some(error.offset),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)?;
        if let Some(offset) = self.offset {
            write!(f, " (at offset {offset})")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Parse YAML/JSON text and validate it.
pub fn load_workflow(
    source: &str,
    registry: &ComponentRegistry,
    mode: ValidationMode,
) -> Result<(WorkflowDefinition, Vec<Diagnostic>), WorkflowError> {
    finish_load(parse_workflow_str(source)?, registry, mode)
}

/// Validate an already-structured document.
pub fn load_workflow_value(
    value: Value,
    registry: &ComponentRegistry,
    mode: ValidationMode,
) -> Result<(WorkflowDefinition, Vec<Diagnostic>), WorkflowError> {
    finish_load(parse_workflow_value(value)?, registry, mode)
}

fn finish_load(
    def: WorkflowDefinition,
    registry: &ComponentRegistry,
    mode: ValidationMode,
) -> Result<(WorkflowDefinition, Vec<Diagnostic>), WorkflowError> {
    let diagnostics = validate_definition(&def, registry);
    if mode == ValidationMode::Strict && !diagnostics.is_empty() {
        return Err(WorkflowError::Validation(diagnostics));
    }
    for diagnostic in &diagnostics {
        tracing::warn!(workflow = %def.name, %diagnostic, "workflow validation problem (lenient)");
    }
    Ok((def, diagnostics))
}

/// Run every check and return all findings.
pub fn validate_definition(def: &WorkflowDefinition, registry: &ComponentRegistry) -> Vec<Diagnostic> {
    let mut validator = Validator::new(def, registry);
    validator.check_header();
    validator.check_inputs();
    validator.check_sequence(&def.steps, "", &[], false);
    validator.check_outputs();
    validator.check_cycles();
    validator.diagnostics
}

// ---------------------------------------------------------------------------
// Validator
// ---------------------------------------------------------------------------

struct Validator<'a> {
    def: &'a WorkflowDefinition,
    registry: &'a ComponentRegistry,
    diagnostics: Vec<Diagnostic>,
    /// Every step name in the definition.
    all_names: HashSet<&'a str>,
    /// Steps living inside a `for_each` body.
    loop_names: HashSet<&'a str>,
    /// `on_failure` steps of validate steps. Their outputs are never recorded.
    corrective_names: HashSet<&'a str>,
}

/// Where an expression is being checked.
struct Scope<'s, 'a> {
    visible: &'s [&'a str],
    in_loop: bool,
    /// The step whose field is checked, if any.
    owner: Option<&'a str>,
}

impl<'a> Validator<'a> {
    fn new(def: &'a WorkflowDefinition, registry: &'a ComponentRegistry) -> Self {
        let mut validator = Self {
            def,
            registry,
            diagnostics: Vec::new(),
            all_names: HashSet::new(),
            loop_names: HashSet::new(),
            corrective_names: HashSet::new(),
        };
        validator.collect_names();
        validator
    }

    fn push(&mut self, diagnostic: Diagnostic) {
        self.diagnostics.push(diagnostic);
    }

    fn collect_names(&mut self) {
        let def = self.def;
        let mut names: Vec<&'a Step> = Vec::new();
        visit_steps(&def.steps, &mut |step| names.push(step));

        for step in names {
            if !self.all_names.insert(step.name.as_str()) {
                self.push(Diagnostic::new(
                    DiagnosticKind::Structure,
                    step.name.clone(),
                    format!("duplicate step name '{}'", step.name),
                ));
            }
            if let StepKind::Parallel {
                steps,
                for_each: Some(_),
            } = &step.kind
            {
                let mut body = Vec::new();
                visit_steps(steps, &mut |child| body.push(child.name.as_str()));
                self.loop_names.extend(body);
            }
            if let StepKind::Validate {
                on_failure: Some(corrective),
                ..
            } = &step.kind
            {
                let mut body = Vec::new();
                visit_steps(std::slice::from_ref(corrective.as_ref()), &mut |child| {
                    body.push(child.name.as_str())
                });
                self.corrective_names.extend(body);
            }
        }
    }

    // -- Document level ----------------------------------------------------

    fn check_header(&mut self) {
        let def = self.def;
        let name = &def.name;
        if name.is_empty() {
            self.push(Diagnostic::new(
                DiagnosticKind::Structure,
                "name",
                "workflow name must not be empty",
            ));
        } else if !name.chars().all(|c| c.is_alphanumeric() || c == '-' || c == '_') {
            self.push(Diagnostic::new(
                DiagnosticKind::Structure,
                "name",
                format!(
                    "workflow name '{name}' contains invalid characters (only alphanumerics, '-' and '_' allowed)"
                ),
            ));
        }
        if def.steps.is_empty() {
            self.push(Diagnostic::new(
                DiagnosticKind::Structure,
                "steps",
                "workflow must have at least one step",
            ));
        }
    }

    fn check_inputs(&mut self) {
        let def = self.def;
        for spec in &def.inputs {
            if let Some(default) = &spec.default {
                if !spec.input_type.accepts(default) {
                    self.push(Diagnostic::new(
                        DiagnosticKind::Type,
                        format!("inputs.{}.default", spec.name),
                        format!("default {default} does not match declared type {}", spec.input_type),
                    ));
                }
            }
        }
    }

    fn check_outputs(&mut self) {
        let visible: Vec<&str> = self
            .all_names
            .iter()
            .filter(|name| !self.loop_names.contains(*name) && !self.corrective_names.contains(*name))
            .copied()
            .collect();
        let def = self.def;
        for output in &def.outputs {
            let scope = Scope {
                visible: &visible,
                in_loop: false,
                owner: None,
            };
            let path = format!("outputs.{}", output.name);
            self.check_template(&path, &output.expression, &scope);
        }
    }

    fn check_cycles(&mut self) {
        if let Some(cycle) = find_subworkflow_cycle(self.def, self.registry) {
            self.push(Diagnostic::new(
                DiagnosticKind::Cycle,
                "steps",
                format!("sub-workflow cycle through {}", cycle.join(" -> ")),
            ));
        }
    }

    // -- Steps -------------------------------------------------------------

    /// Check steps that run one after another. Returns the names they expose.
    fn check_sequence(
        &mut self,
        steps: &'a [Step],
        prefix: &str,
        outer: &[&'a str],
        in_loop: bool,
    ) -> Vec<&'a str> {
        let mut visible: Vec<&'a str> = outer.to_vec();
        let mut exposed = Vec::new();
        for step in steps {
            let names = self.check_step(step, prefix, &visible, in_loop);
            visible.extend(names.iter().copied());
            exposed.extend(names);
        }
        exposed
    }

    /// Check one step against what is visible before it. Returns the names
    /// it exposes to later steps.
    fn check_step(
        &mut self,
        step: &'a Step,
        prefix: &str,
        visible: &[&'a str],
        in_loop: bool,
    ) -> Vec<&'a str> {
        let key = format!("{prefix}{}", step.name);
        let scope = Scope {
            visible,
            in_loop,
            owner: Some(step.name.as_str()),
        };

        if step.name.is_empty() {
            self.push(Diagnostic::new(DiagnosticKind::Structure, &key, "step name must not be empty"));
        } else if step.name.contains(['/', '[', ']']) {
            self.push(Diagnostic::new(
                DiagnosticKind::Structure,
                &key,
                format!("step name '{}' must not contain '/', '[' or ']'", step.name),
            ));
        }
        if step.timeout_secs == Some(0) {
            self.push(Diagnostic::new(DiagnosticKind::Structure, format!("{key}.timeout_secs"), "timeout must be > 0"));
        }
        if let Some(when) = &step.when {
            self.check_condition(&format!("{key}.when"), when, &scope);
        }

        let mut exposed = vec![step.name.as_str()];
        match &step.kind {
            StepKind::Python { action, args } => {
                self.check_component(&format!("{key}.action"), ComponentKind::Action, action);
                self.check_mapping(&format!("{key}.args"), args.iter(), &scope);
            }
            StepKind::Agent { agent, context } => {
                self.check_component(&format!("{key}.agent"), ComponentKind::Agent, agent);
                self.check_mapping(&format!("{key}.context"), context.iter(), &scope);
            }
            StepKind::Generate { generator, context } => {
                self.check_component(&format!("{key}.generator"), ComponentKind::Generator, generator);
                self.check_mapping(&format!("{key}.context"), context.iter(), &scope);
            }
            StepKind::Validate {
                stages,
                args,
                on_failure,
                ..
            } => {
                if stages.is_empty() {
                    self.push(Diagnostic::new(
                        DiagnosticKind::Structure,
                        format!("{key}.stages"),
                        "validate step must have at least one stage",
                    ));
                }
                for (i, stage) in stages.iter().enumerate() {
                    self.check_component(&format!("{key}.stages[{i}]"), ComponentKind::Action, stage);
                }
                self.check_mapping(&format!("{key}.args"), args.iter(), &scope);

                if let Some(corrective) = on_failure {
                    if !corrective.kind.is_leaf() {
                        self.push(Diagnostic::new(
                            DiagnosticKind::Structure,
                            format!("{key}.on_failure"),
                            format!(
                                "on_failure must be a python, agent or generate step, not '{}'",
                                corrective.kind.name()
                            ),
                        ));
                    }
                    self.check_step(corrective, &format!("{key}/"), visible, in_loop);
                }
            }
            StepKind::Subworkflow { workflow, inputs } => {
                self.check_component(&format!("{key}.workflow"), ComponentKind::SubWorkflow, workflow);
                self.check_mapping(&format!("{key}.inputs"), inputs.iter(), &scope);
                let registry = self.registry;
                if let Some(target) = registry.workflow(workflow) {
                    for name in inputs.keys() {
                        if target.input(name).is_none() {
                            self.push(Diagnostic::new(
                                DiagnosticKind::Type,
                                format!("{key}.inputs.{name}"),
                                format!("workflow '{workflow}' declares no input '{name}'"),
                            ));
                        }
                    }
                    for spec in &target.inputs {
                        if spec.required && spec.default.is_none() && !inputs.contains_key(&spec.name) {
                            self.push(Diagnostic::new(
                                DiagnosticKind::Type,
                                format!("{key}.inputs"),
                                format!("missing required input '{}' for workflow '{workflow}'", spec.name),
                            ));
                        }
                    }
                }
            }
            StepKind::Branch { arms } => {
                if arms.is_empty() {
                    self.push(Diagnostic::new(
                        DiagnosticKind::Structure,
                        format!("{key}.arms"),
                        "branch step must have at least one arm",
                    ));
                }
                let mut labels = HashSet::new();
                for arm in arms {
                    if !labels.insert(arm.label.as_str()) {
                        self.push(Diagnostic::new(
                            DiagnosticKind::Structure,
                            format!("{key}.arms.{}", arm.label),
                            format!("duplicate arm label '{}'", arm.label),
                        ));
                    }
                    if let Some(when) = &arm.when {
                        self.check_condition(&format!("{key}.arms.{}.when", arm.label), when, &scope);
                    }
                    let arm_exposed = self.check_sequence(&arm.steps, &format!("{key}/"), visible, in_loop);
                    exposed.extend(arm_exposed);
                }
            }
            StepKind::Parallel { steps, for_each } => {
                if steps.is_empty() {
                    self.push(Diagnostic::new(
                        DiagnosticKind::Structure,
                        format!("{key}.steps"),
                        "parallel step must have at least one child",
                    ));
                }
                match for_each {
                    Some(items) => {
                        self.check_condition(&format!("{key}.for_each"), items, &scope);
                        self.check_sequence(steps, &format!("{key}[]/"), visible, true);
                    }
                    None => {
                        for child in steps {
                            let child_exposed = self.check_step(child, &format!("{key}/"), visible, in_loop);
                            exposed.extend(child_exposed);
                        }
                    }
                }
            }
        }
        exposed
    }

    // -- Fields ------------------------------------------------------------

    fn check_component(&mut self, path: &str, kind: ComponentKind, name: &str) {
        let mut deferred = Vec::new();
        if self.registry.resolve_deferred(kind, name, &mut deferred).is_placeholder() {
            for error in deferred {
                self.push(Diagnostic::new(DiagnosticKind::UnknownComponent, path, error.to_string()));
            }
        }
    }

    fn check_condition(&mut self, path: &str, source: &str, scope: &Scope<'_, 'a>) {
        match parse_condition(source) {
            Ok(expr) => self.check_expr(path, &expr, scope),
            Err(error) => self.push(Diagnostic::syntax(path, &error)),
        }
    }

    fn check_mapping<'v>(
        &mut self,
        path: &str,
        entries: impl Iterator<Item = (&'v String, &'v Value)>,
        scope: &Scope<'_, 'a>,
    ) {
        for (name, value) in entries {
            self.check_value(&format!("{path}.{name}"), value, scope);
        }
    }

    fn check_value(&mut self, path: &str, value: &Value, scope: &Scope<'_, 'a>) {
        match value {
            Value::String(text) => self.check_template(path, text, scope),
            Value::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    self.check_value(&format!("{path}[{i}]"), item, scope);
                }
            }
            Value::Object(map) => self.check_mapping(path, map.iter(), scope),
            _ => {}
        }
    }

    fn check_template(&mut self, path: &str, source: &str, scope: &Scope<'_, 'a>) {
        match Template::parse(source) {
            Ok(template) => {
                for expr in template.expressions() {
                    self.check_expr(path, expr, scope);
                }
            }
            Err(error) => self.push(Diagnostic::syntax(path, &error)),
        }
    }

    fn check_expr(&mut self, path: &str, expr: &Expr, scope: &Scope<'_, 'a>) {
        for reference in expr.references() {
            let problem = match reference {
                Reference::Input(name) if self.def.input(name).is_none() => Some((
                    DiagnosticKind::Reference,
                    format!("unknown input 'inputs.{name}'"),
                )),
                Reference::Step(name) if Some(name) == scope.owner => Some((
                    DiagnosticKind::Reference,
                    format!("step '{name}' cannot reference its own output"),
                )),
                Reference::Step(name) if scope.visible.contains(&name) => None,
                Reference::Step(name) if self.corrective_names.contains(name) => Some((
                    DiagnosticKind::Reference,
                    format!("step '{name}' is an on_failure step and its output is not recorded"),
                )),
                Reference::Step(name) if self.loop_names.contains(name) && scope.owner.is_none() => Some((
                    DiagnosticKind::Scope,
                    format!("step '{name}' runs inside a for_each body and is not visible here"),
                )),
                Reference::Step(name) if self.all_names.contains(name) && scope.owner.is_some() => Some((
                    DiagnosticKind::Reference,
                    format!(
                        "step '{name}' is not visible here (it runs later, in a sibling branch arm, or concurrently)"
                    ),
                )),
                Reference::Step(name) if !self.all_names.contains(name) => Some((
                    DiagnosticKind::Reference,
                    format!("unknown step '{name}'"),
                )),
                Reference::Item | Reference::Index if !scope.in_loop => Some((
                    DiagnosticKind::Scope,
                    format!(
                        "'{}' is only available inside a for_each scope",
                        if reference == Reference::Item { "item" } else { "index" }
                    ),
                )),
                _ => None,
            };
            if let Some((kind, message)) = problem {
                self.push(Diagnostic::new(kind, path, message));
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
