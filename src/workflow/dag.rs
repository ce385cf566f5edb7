//! Dependency ordering for workflow steps.
//!
//! Steps are addressed by their position in the declaration list. The order is
//! a depth-first post-order: roots are visited in declaration order and each
//! step's dependencies in the order they are listed, so a given definition
//! always yields the same sequence.

use std::collections::HashMap;

use crate::error::WorkflowError;

use super::types::WorkflowStep;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

/// Reject duplicate step ids.
pub fn check_unique_ids(steps: &[WorkflowStep]) -> Result<(), WorkflowError> {
    let mut seen = HashMap::with_capacity(steps.len());
    for step in steps {
        if seen.insert(step.id.as_str(), ()).is_some() {
            return Err(WorkflowError::DuplicateStep(step.id.clone()));
        }
    }
    Ok(())
}

/// Indices of `steps` in an order where every step comes after all of its
/// dependencies.
///
/// Fails with [`WorkflowError::UnknownDependency`] when a step names a step
/// that does not exist and [`WorkflowError::CycleDetected`] when the
/// dependencies loop.
pub fn execution_order(steps: &[WorkflowStep]) -> Result<Vec<usize>, WorkflowError> {
    let index: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, step)| (step.id.as_str(), i))
        .collect();

    // Resolve every edge up front so unknown names fail before traversal.
    let mut edges: Vec<Vec<usize>> = Vec::with_capacity(steps.len());
    for step in steps {
        let mut deps = Vec::with_capacity(step.depends_on.len());
        for dep in &step.depends_on {
            match index.get(dep.as_str()) {
                Some(&i) => deps.push(i),
                None => {
                    return Err(WorkflowError::UnknownDependency {
                        step_id: step.id.clone(),
                        dependency: dep.clone(),
                    })
                }
            }
        }
        edges.push(deps);
    }

    let mut marks = vec![Mark::Unvisited; steps.len()];
    let mut order = Vec::with_capacity(steps.len());
    // (node, next edge to follow)
    let mut stack: Vec<(usize, usize)> = Vec::new();

    for root in 0..steps.len() {
        if marks[root] != Mark::Unvisited {
            continue;
        }
        marks[root] = Mark::InProgress;
        stack.push((root, 0));

        while let Some(frame) = stack.last_mut() {
            let (node, next) = *frame;
            if let Some(&dep) = edges[node].get(next) {
                frame.1 += 1;
                match marks[dep] {
                    Mark::Unvisited => {
                        marks[dep] = Mark::InProgress;
                        stack.push((dep, 0));
                    }
                    Mark::InProgress => {
                        return Err(WorkflowError::CycleDetected(steps[dep].id.clone()));
                    }
                    Mark::Done => {}
                }
            } else {
                marks[node] = Mark::Done;
                order.push(node);
                stack.pop();
            }
        }
    }

    Ok(order)
}
