//! Service dependency graph
//!
//! Directed acyclic graph over service names. Topological layers define
//! startup order; reverse edges define cascade-stop order.

use crate::{MusterError, Result};
use std::collections::{HashMap, HashSet, VecDeque};

/// Dependency DAG over service names
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// service -> services it depends on
    deps: HashMap<String, HashSet<String>>,
    /// service -> services that depend on it
    dependents: HashMap<String, HashSet<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node with its declared dependencies, replacing prior edges.
    pub fn add_service(&mut self, name: &str, dependencies: &[String]) {
        self.remove_service(name);
        self.deps
            .insert(name.to_string(), dependencies.iter().cloned().collect());
        self.dependents.entry(name.to_string()).or_default();
        for dep in dependencies {
            self.dependents
                .entry(dep.clone())
                .or_default()
                .insert(name.to_string());
            self.deps.entry(dep.clone()).or_default();
        }
    }

    pub fn remove_service(&mut self, name: &str) {
        if let Some(deps) = self.deps.remove(name) {
            for dep in deps {
                if let Some(set) = self.dependents.get_mut(&dep) {
                    set.remove(name);
                }
            }
        }
        self.dependents.remove(name);
        for set in self.dependents.values_mut() {
            set.remove(name);
        }
        for set in self.deps.values_mut() {
            set.remove(name);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.deps.contains_key(name)
    }

    /// Direct dependencies of a service
    pub fn dependencies_of(&self, name: &str) -> Vec<String> {
        self.deps
            .get(name)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Direct dependents of a service
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        self.dependents
            .get(name)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// All services whose dependency closure includes `name`, ordered so that
    /// the most-dependent services come first (safe cascade-stop order).
    pub fn dependents_closure(&self, name: &str) -> Vec<String> {
        let mut closure = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(name.to_string());

        while let Some(current) = queue.pop_front() {
            if let Some(dependents) = self.dependents.get(&current) {
                for dep in dependents {
                    if closure.insert(dep.clone()) {
                        queue.push_back(dep.clone());
                    }
                }
            }
        }

        // Order the closure reverse-topologically: stop leaves-of-dependents
        // before the services they depend on.
        let mut ordered: Vec<String> = self
            .topological_order()
            .unwrap_or_default()
            .into_iter()
            .filter(|n| closure.contains(n))
            .collect();
        ordered.reverse();
        ordered
    }

    /// Kahn's algorithm; rejects cycles at definition time.
    pub fn topological_order(&self) -> Result<Vec<String>> {
        let mut in_degree: HashMap<&str, usize> = self
            .deps
            .iter()
            .map(|(name, deps)| (name.as_str(), deps.len()))
            .collect();

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(name, _)| *name)
            .collect();
        let mut sorted = Vec::with_capacity(self.deps.len());

        while let Some(current) = queue.pop_front() {
            sorted.push(current.to_string());
            if let Some(dependents) = self.dependents.get(current) {
                for dependent in dependents {
                    if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                        *degree -= 1;
                        if *degree == 0 {
                            queue.push_back(dependent.as_str());
                        }
                    }
                }
            }
        }

        if sorted.len() != self.deps.len() {
            let cyclic: Vec<&str> = in_degree
                .iter()
                .filter(|(name, _)| !sorted.iter().any(|s| s == *name))
                .map(|(name, _)| *name)
                .collect();
            return Err(MusterError::validation(format!(
                "dependency cycle involving: {}",
                cyclic.join(", ")
            )));
        }

        Ok(sorted)
    }

    /// Validate that the graph is acyclic and every referenced dependency has
    /// a node.
    pub fn validate(&self) -> Result<()> {
        for (name, deps) in &self.deps {
            for dep in deps {
                if !self.deps.contains_key(dep) {
                    return Err(MusterError::validation(format!(
                        "service '{}' depends on unknown service '{}'",
                        name, dep
                    )));
                }
            }
        }
        self.topological_order().map(|_| ())
    }

    /// True when every dependency of `name` satisfies `healthy`.
    pub fn dependencies_satisfied<F>(&self, name: &str, healthy: F) -> bool
    where
        F: Fn(&str) -> bool,
    {
        self.deps
            .get(name)
            .map(|deps| deps.iter().all(|d| healthy(d)))
            .unwrap_or(true)
    }

    /// First unhealthy dependency of `name`, if any.
    pub fn first_unsatisfied<F>(&self, name: &str, healthy: F) -> Option<String>
    where
        F: Fn(&str) -> bool,
    {
        self.deps
            .get(name)
            .and_then(|deps| deps.iter().find(|d| !healthy(d)).cloned())
    }
}
