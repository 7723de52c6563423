//! Step registry: holds the immutable step definitions and validates the
//! dependency graph.
//!
//! `dependency_order` returns a linear extension of the step DAG. Among
//! ready steps the registration order is preserved, so the output is
//! reproducible run over run.

use crate::errors::OrchestratorError;
use crate::step::Step;
use std::collections::HashMap;
use std::sync::Arc;

/// Registry of step definitions, shared read-only by every run.
#[derive(Default)]
pub struct StepRegistry {
    steps: Vec<Arc<dyn Step>>,
    index_map: HashMap<String, usize>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step definition. Ids must be unique.
    pub fn register(&mut self, step: Arc<dyn Step>) -> Result<(), OrchestratorError> {
        let id = step.id().to_string();
        if self.index_map.contains_key(&id) {
            return Err(OrchestratorError::DuplicateStep(id));
        }
        self.index_map.insert(id, self.steps.len());
        self.steps.push(step);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Step>> {
        self.index_map.get(id).map(|&i| Arc::clone(&self.steps[i]))
    }

    pub fn has(&self, id: &str) -> bool {
        self.index_map.contains_key(id)
    }

    /// All steps in registration order.
    pub fn list(&self) -> Vec<Arc<dyn Step>> {
        self.steps.iter().map(Arc::clone).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Topologically ordered step list (Kahn's algorithm). Among ready
    /// steps the one registered first wins, so ties are deterministic.
    pub fn dependency_order(&self) -> Result<Vec<Arc<dyn Step>>, OrchestratorError> {
        let n = self.steps.len();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut in_degree: Vec<usize> = vec![0; n];

        for (to_idx, step) in self.steps.iter().enumerate() {
            for dep in step.dependencies() {
                let from_idx =
                    *self
                        .index_map
                        .get(&dep)
                        .ok_or_else(|| OrchestratorError::UnknownDependency {
                            step: step.id().to_string(),
                            dependency: dep.clone(),
                        })?;
                dependents[from_idx].push(to_idx);
                in_degree[to_idx] += 1;
            }
        }

        let mut ordered = Vec::with_capacity(n);
        let mut placed = vec![false; n];

        while ordered.len() < n {
            // lowest registration index among ready steps
            let next = (0..n).find(|&i| !placed[i] && in_degree[i] == 0);
            let Some(idx) = next else {
                let cycle: Vec<String> = (0..n)
                    .filter(|&i| !placed[i])
                    .map(|i| self.steps[i].id().to_string())
                    .collect();
                return Err(OrchestratorError::CyclicDependency(cycle));
            };
            placed[idx] = true;
            ordered.push(Arc::clone(&self.steps[idx]));
            for &dependent in &dependents[idx] {
                in_degree[dependent] -= 1;
            }
        }

        Ok(ordered)
    }

    /// Ids of every step that transitively depends on `id`.
    pub fn transitive_dependents(&self, id: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut frontier = vec![id.to_string()];
        while let Some(current) = frontier.pop() {
            for step in &self.steps {
                let sid = step.id().to_string();
                if out.contains(&sid) || sid == id {
                    continue;
                }
                if step.dependencies().contains(&current) {
                    out.push(sid.clone());
                    frontier.push(sid);
                }
            }
        }
        out
    }
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids: Vec<&str> = self.steps.iter().map(|s| s.id()).collect();
        f.debug_struct("StepRegistry").field("steps", &ids).finish()
    }
}
