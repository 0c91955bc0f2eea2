//! Modules and dependency ordering.
//!
//! A [`Module`] bundles related components. It names the modules it depends
//! on, and its [`Module::init`] is the only place where it registers
//! components, buses and drivers with the [`Framework`].
//!
//! [`resolve_order`] computes an initialization order in which every module
//! comes after all of its dependencies (Kahn's algorithm). The order is one
//! valid topological order, not necessarily the only one.

use std::borrow::Cow;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::{KronosError, Result};
use crate::framework::Framework;

/// Stable identifier of a module.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(Cow<'static, str>);

impl ModuleId {
    /// An id from a static string, usable in constants.
    #[must_use]
    pub const fn new(id: &'static str) -> Self {
        Self(Cow::Borrowed(id))
    }

    /// An id from an owned string.
    #[must_use]
    pub fn owned(id: impl Into<String>) -> Self {
        Self(Cow::Owned(id.into()))
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ModuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A unit of functionality registered with the framework.
pub trait Module: Send + Sync {
    /// The module's unique id.
    fn id(&self) -> ModuleId;

    /// Human-readable name, used in logs. Defaults to the id.
    fn name(&self) -> String {
        self.id().to_string()
    }

    /// Register this module's components, buses and drivers.
    ///
    /// Called exactly once, after the init of every dependency.
    ///
    /// # Errors
    ///
    /// Any error aborts module initialization.
    fn init(&self, framework: &mut Framework) -> Result<()>;

    /// Modules that must be initialized first.
    fn dependencies(&self) -> Vec<ModuleId> {
        Vec::new()
    }

    /// Names of the components this module registers for others to use.
    fn exported_components(&self) -> Vec<&str> {
        Vec::new()
    }
}

/// Compute an initialization order for a module dependency graph.
///
/// `graph` lists each module with its dependencies, in registration order.
/// Modules without dependencies are emitted first, in registration order;
/// every other module is emitted as soon as its last dependency was.
///
/// # Errors
///
/// - [`KronosError::MissingModule`] if a dependency is not in `graph`.
/// - [`KronosError::CyclicDependency`] if some modules can never be resolved.
pub fn resolve_order(graph: &[(ModuleId, Vec<ModuleId>)]) -> Result<Vec<ModuleId>> {
    let known: HashSet<&ModuleId> = graph.iter().map(|(id, _)| id).collect();

    let mut parents: HashMap<&ModuleId, HashSet<&ModuleId>> = HashMap::new();
    let mut children: HashMap<&ModuleId, Vec<&ModuleId>> = HashMap::new();
    for (id, dependencies) in graph {
        for dependency in dependencies {
            if !known.contains(dependency) {
                return Err(KronosError::MissingModule(dependency.clone()));
            }
            parents.entry(id).or_default().insert(dependency);
            children.entry(dependency).or_default().push(id);
        }
    }

    // Seed with every module that has nothing to wait for.
    let mut ready: VecDeque<&ModuleId> = graph
        .iter()
        .map(|(id, _)| id)
        .filter(|id| parents.get(id).is_none_or(HashSet::is_empty))
        .collect();

    let mut order = Vec::with_capacity(graph.len());
    while let Some(id) = ready.pop_front() {
        order.push(id.clone());

        let Some(dependents) = children.get(id) else {
            continue;
        };
        for &child in dependents {
            if let Some(remaining) = parents.get_mut(child)
                && remaining.remove(id)
                && remaining.is_empty()
            {
                ready.push_back(child);
            }
        }
    }

    if order.len() != graph.len() {
        let unresolved = graph
            .iter()
            .map(|(id, _)| id)
            .filter(|id| parents.get(id).is_some_and(|p| !p.is_empty()))
            .cloned()
            .collect();
        return Err(KronosError::CyclicDependency { unresolved });
    }

    Ok(order)
}
