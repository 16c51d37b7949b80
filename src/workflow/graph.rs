//! Step graph and workflow validation.
//!
//! Steps sit in a flat arena linked by index adjacency lists in both
//! directions. The declared step order is never trusted; execution order is
//! derived from the edges after a cycle check.

use std::collections::{HashMap, VecDeque};

use crate::error::{EngineError, Result};
use crate::process::ProcessRegistry;

use super::definition::{StepInput, WorkflowDefinition};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

#[derive(Debug, Clone)]
pub struct StepGraph {
    ids: Vec<String>,
    index: HashMap<String, usize>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
}

impl StepGraph {
    /// Builds the arena. Fails on empty or duplicate ids and on edges that
    /// point at unknown steps.
    pub fn build(def: &WorkflowDefinition) -> Result<Self> {
        let mut index = HashMap::with_capacity(def.steps.len());
        let mut ids = Vec::with_capacity(def.steps.len());
        for (i, step) in def.steps.iter().enumerate() {
            if step.id.trim().is_empty() {
                return Err(EngineError::Validation(format!("step {i} has an empty id")));
            }
            if index.insert(step.id.clone(), i).is_some() {
                return Err(EngineError::Validation(format!(
                    "duplicate step id {}",
                    step.id
                )));
            }
            ids.push(step.id.clone());
        }

        let n = ids.len();
        let mut dependencies = vec![Vec::new(); n];
        let mut dependents = vec![Vec::new(); n];
        for (i, step) in def.steps.iter().enumerate() {
            for dep in step.dependencies() {
                let &d = index.get(dep).ok_or_else(|| {
                    EngineError::Validation(format!(
                        "step {} depends on unknown step {dep}",
                        step.id
                    ))
                })?;
                dependencies[i].push(d);
                dependents[d].push(i);
            }
        }

        Ok(Self {
            ids,
            index,
            dependencies,
            dependents,
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn id(&self, i: usize) -> &str {
        &self.ids[i]
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    pub fn dependencies(&self, i: usize) -> &[usize] {
        &self.dependencies[i]
    }

    pub fn dependents(&self, i: usize) -> &[usize] {
        &self.dependents[i]
    }

    /// Three-color DFS over an explicit stack, which doubles as the current
    /// path. Returns the step ids along the first cycle found, with the entry
    /// step repeated at the end.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut color = vec![Color::White; self.len()];
        for start in 0..self.len() {
            if color[start] != Color::White {
                continue;
            }
            color[start] = Color::Gray;
            // (step, position of the next dependent to look at)
            let mut stack = vec![(start, 0usize)];
            while let Some(top) = stack.last_mut() {
                let (node, cursor) = *top;
                let Some(&next) = self.dependents[node].get(cursor) else {
                    color[node] = Color::Black;
                    stack.pop();
                    continue;
                };
                top.1 += 1;
                match color[next] {
                    Color::Gray => {
                        let from = stack.iter().position(|&(p, _)| p == next).unwrap_or(0);
                        let mut cycle: Vec<String> =
                            stack[from..].iter().map(|&(p, _)| self.ids[p].clone()).collect();
                        cycle.push(self.ids[next].clone());
                        return Some(cycle);
                    }
                    Color::White => {
                        color[next] = Color::Gray;
                        stack.push((next, 0));
                    }
                    Color::Black => {}
                }
            }
        }
        None
    }

    /// Kahn's algorithm. Ties keep declaration order. Only meaningful on an
    /// acyclic graph; steps on a cycle are left out.
    pub fn topological_order(&self) -> Vec<usize> {
        let mut in_degree: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut ready: VecDeque<usize> = (0..self.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(self.len());
        while let Some(i) = ready.pop_front() {
            order.push(i);
            for &d in &self.dependents[i] {
                in_degree[d] -= 1;
                if in_degree[d] == 0 {
                    ready.push_back(d);
                }
            }
        }
        order
    }

    /// Every step reachable downstream of `i`, excluding `i`.
    pub fn transitive_dependents(&self, i: usize) -> Vec<usize> {
        let mut seen = vec![false; self.len()];
        let mut stack = self.dependents[i].clone();
        let mut out = Vec::new();
        while let Some(next) = stack.pop() {
            if std::mem::replace(&mut seen[next], true) {
                continue;
            }
            out.push(next);
            stack.extend(self.dependents[next].iter().copied());
        }
        out.sort_unstable();
        out
    }
}

/// Full admission check. Nothing is executed unless this passes.
pub fn validate(def: &WorkflowDefinition, registry: &dyn ProcessRegistry) -> Result<StepGraph> {
    if def.steps.is_empty() {
        return Err(EngineError::Validation("workflow has no steps".into()));
    }
    let graph = StepGraph::build(def)?;
    if let Some(cycle) = graph.find_cycle() {
        return Err(EngineError::Validation(format!(
            "dependency cycle: {}",
            cycle.join(" -> ")
        )));
    }

    for step in &def.steps {
        let process = registry.get(&step.process).ok_or_else(|| {
            EngineError::Validation(format!(
                "step {} uses unknown process {}",
                step.id, step.process
            ))
        })?;

        for (name, input) in &step.inputs {
            let spec = process.input(name).ok_or_else(|| {
                EngineError::Validation(format!(
                    "step {}: process {} has no input {name}",
                    step.id, process.id
                ))
            })?;
            match input {
                StepInput::Literal(value) if !spec.ty.accepts(value) => {
                    return Err(EngineError::Validation(format!(
                        "step {}: input {name} expects {}",
                        step.id, spec.ty
                    )));
                }
                StepInput::From(source) => {
                    let target = graph
                        .index_of(&source.step)
                        .map(|i| &def.steps[i])
                        .ok_or_else(|| {
                            EngineError::Validation(format!(
                                "step {}: input {name} points at unknown step {}",
                                step.id, source.step
                            ))
                        })?;
                    let declared = registry
                        .get(&target.process)
                        .is_some_and(|p| p.has_output(&source.output));
                    if !declared {
                        return Err(EngineError::Validation(format!(
                            "step {}: input {name} points at {}.{}, which is not a declared output",
                            step.id, source.step, source.output
                        )));
                    }
                }
                _ => {}
            }
        }

        if let Some(missing) = process
            .inputs()
            .find(|p| p.required && !step.inputs.contains_key(&p.name))
        {
            return Err(EngineError::Validation(format!(
                "step {}: required input {} is not bound",
                step.id, missing.name
            )));
        }

        if let Some(output) = &step.output
            && !process.has_output(&output.output)
        {
            return Err(EngineError::Validation(format!(
                "step {}: cannot publish undeclared output {}",
                step.id, output.output
            )));
        }
    }
    Ok(graph)
}
