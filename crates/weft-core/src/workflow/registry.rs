//! Component registry.
//!
//! Four independent name-indexed sub-registries (actions, agents,
//! generators, sub-workflows) behind one facade. The registry is populated
//! up front and then shared read-only behind an `Arc`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use weft_types::workflow::WorkflowDefinition;

use super::step_runner::BoxStepExecutor;

// ---------------------------------------------------------------------------
// Kinds and errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentKind {
    Action,
    Agent,
    Generator,
    SubWorkflow,
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ComponentKind::Action => "action",
            ComponentKind::Agent => "agent",
            ComponentKind::Generator => "generator",
            ComponentKind::SubWorkflow => "sub-workflow",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("{kind} '{name}' is already registered")]
    Duplicate { kind: ComponentKind, name: String },

    #[error("unknown {kind} '{name}'")]
    NotFound { kind: ComponentKind, name: String },
}

// ---------------------------------------------------------------------------
// SubRegistry
// ---------------------------------------------------------------------------

/// Name-indexed entries of one component kind.
#[derive(Debug, Clone)]
pub struct SubRegistry<T> {
    kind: ComponentKind,
    entries: HashMap<String, T>,
}

impl<T> SubRegistry<T> {
    pub fn new(kind: ComponentKind) -> Self {
        Self {
            kind,
            entries: HashMap::new(),
        }
    }

    /// Register `entry` under `name`; existing names are never replaced.
    pub fn register(&mut self, name: impl Into<String>, entry: T) -> Result<(), RegistryError> {
        let name = name.into();
        if self.entries.contains_key(&name) {
            return Err(RegistryError::Duplicate {
                kind: self.kind,
                name,
            });
        }
        self.entries.insert(name, entry);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Strict lookup.
    pub fn resolve(&self, name: &str) -> Result<&T, RegistryError> {
        self.entries.get(name).ok_or_else(|| RegistryError::NotFound {
            kind: self.kind,
            name: name.to_string(),
        })
    }

    /// Sorted entry names.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// ComponentRegistry
// ---------------------------------------------------------------------------

/// Outcome of a lenient lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    Found,
    /// Stand-in for a missing component, usable for static analysis only.
    Placeholder { kind: ComponentKind, name: String },
}

impl Resolved {
    pub fn is_placeholder(&self) -> bool {
        matches!(self, Resolved::Placeholder { .. })
    }
}

#[derive(Debug, Clone)]
pub struct ComponentRegistry {
    actions: SubRegistry<BoxStepExecutor>,
    agents: SubRegistry<BoxStepExecutor>,
    generators: SubRegistry<BoxStepExecutor>,
    workflows: SubRegistry<Arc<WorkflowDefinition>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self {
            actions: SubRegistry::new(ComponentKind::Action),
            agents: SubRegistry::new(ComponentKind::Agent),
            generators: SubRegistry::new(ComponentKind::Generator),
            workflows: SubRegistry::new(ComponentKind::SubWorkflow),
        }
    }

    pub fn register_action(
        &mut self,
        name: impl Into<String>,
        executor: BoxStepExecutor,
    ) -> Result<(), RegistryError> {
        self.actions.register(name, executor)
    }

    pub fn register_agent(
        &mut self,
        name: impl Into<String>,
        executor: BoxStepExecutor,
    ) -> Result<(), RegistryError> {
        self.agents.register(name, executor)
    }

    pub fn register_generator(
        &mut self,
        name: impl Into<String>,
        executor: BoxStepExecutor,
    ) -> Result<(), RegistryError> {
        self.generators.register(name, executor)
    }

    /// Register a workflow under its own name for use by `subworkflow` steps.
    pub fn register_subworkflow(&mut self, definition: WorkflowDefinition) -> Result<(), RegistryError> {
        let name = definition.name.clone();
        self.workflows.register(name, Arc::new(definition))
    }

    fn executors(&self, kind: ComponentKind) -> Option<&SubRegistry<BoxStepExecutor>> {
        match kind {
            ComponentKind::Action => Some(&self.actions),
            ComponentKind::Agent => Some(&self.agents),
            ComponentKind::Generator => Some(&self.generators),
            ComponentKind::SubWorkflow => None,
        }
    }

    pub fn contains(&self, kind: ComponentKind, name: &str) -> bool {
        match self.executors(kind) {
            Some(registry) => registry.contains(name),
            None => self.workflows.contains(name),
        }
    }

    /// Strict executor lookup for action, agent and generator kinds.
    pub fn resolve_executor(
        &self,
        kind: ComponentKind,
        name: &str,
    ) -> Result<&BoxStepExecutor, RegistryError> {
        match self.executors(kind) {
            Some(registry) => registry.resolve(name),
            None => Err(RegistryError::NotFound {
                kind,
                name: name.to_string(),
            }),
        }
    }

    pub fn resolve_workflow(&self, name: &str) -> Result<&Arc<WorkflowDefinition>, RegistryError> {
        self.workflows.resolve(name)
    }

    pub fn workflow(&self, name: &str) -> Option<&Arc<WorkflowDefinition>> {
        self.workflows.get(name)
    }

    /// Lenient lookup: a miss is pushed onto `deferred` and a placeholder is
    /// returned instead of failing.
    pub fn resolve_deferred(
        &self,
        kind: ComponentKind,
        name: &str,
        deferred: &mut Vec<RegistryError>,
    ) -> Resolved {
        if self.contains(kind, name) {
            Resolved::Found
        } else {
            deferred.push(RegistryError::NotFound {
                kind,
                name: name.to_string(),
            });
            Resolved::Placeholder {
                kind,
                name: name.to_string(),
            }
        }
    }

    /// Sorted names registered for `kind`.
    pub fn names(&self, kind: ComponentKind) -> Vec<&str> {
        match self.executors(kind) {
            Some(registry) => registry.names(),
            None => self.workflows.names(),
        }
    }
}

impl Default for ComponentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
