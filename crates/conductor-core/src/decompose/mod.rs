//! Plan decomposition: parse an approved plan's JSON payload into a task
//! DAG with validation.
//!
//! Parses a plan payload into a [`PlanPayload`] and validates:
//! - Task type and complexity values are valid enum variants.
//! - `depends_on` references resolve to in-range task indices; entries that
//!   are numeric strings are parsed, while out-of-range, non-numeric, and
//!   self-referential entries are dropped with a logged warning.
//! - The dependency graph is acyclic (Kahn's algorithm), and each task is
//!   assigned its `wave`: the longest dependency chain ending at it.

pub mod materialize;

use std::collections::HashSet;
use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use conductor_db::models::{Complexity, TaskType};

/// Errors that can occur during plan parsing and validation.
#[derive(Debug, Error)]
pub enum DecomposeError {
    #[error("plan JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("plan must contain at least one task")]
    NoTasks,

    #[error("invalid task_type {value:?} on task {task:?} \
             (expected code, research, analysis, asset, integration, or documentation)")]
    InvalidTaskType { task: String, value: String },

    #[error("invalid complexity {value:?} on task {task:?} \
             (expected simple, medium, or complex)")]
    InvalidComplexity { task: String, value: String },

    #[error("dependency cycle detected involving tasks: {0}")]
    CycleDetected(String),
}

/// Top-level structure of an approved plan payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanPayload {
    /// One-paragraph summary of the plan.
    #[serde(default)]
    pub summary: String,
    /// Tasks within the plan; `depends_on` entries are indices into this
    /// list.
    #[serde(default)]
    pub tasks: Vec<PlanTaskSpec>,
}

/// A single task entry in a plan payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlanTaskSpec {
    pub title: String,
    pub description: String,
    pub task_type: String,
    pub complexity: String,
    #[serde(default)]
    pub depends_on: Vec<DepValue>,
    #[serde(default)]
    pub tools_needed: Vec<String>,
    #[serde(default)]
    pub priority: i64,
}

/// A raw `depends_on` entry as found in plan JSON. Planning models emit
/// both bare integers and stringified integers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum DepValue {
    Index(i64),
    Name(String),
}

/// A classified dependency reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DepRef {
    /// Resolved index into the plan's task list.
    Index(usize),
    /// A string that is not a number. Dropped with a warning.
    Named(String),
    /// Anything else that cannot be used: out of range, self-referential.
    Invalid { raw: String, reason: &'static str },
}

/// Classify one raw dependency entry for the task at `task_idx` in a plan
/// of `task_count` tasks.
pub fn classify_dep(value: &DepValue, task_idx: usize, task_count: usize) -> DepRef {
    let index = match value {
        DepValue::Index(i) => *i,
        DepValue::Name(s) => match s.trim().parse::<i64>() {
            Ok(i) => i,
            Err(_) => return DepRef::Named(s.clone()),
        },
    };

    if index < 0 || index as usize >= task_count {
        return DepRef::Invalid {
            raw: index.to_string(),
            reason: "out of range",
        };
    }
    if index as usize == task_idx {
        return DepRef::Invalid {
            raw: index.to_string(),
            reason: "self-referential",
        };
    }
    DepRef::Index(index as usize)
}

/// A task with resolved dependencies and computed wave, ready to be
/// materialized into rows.
#[derive(Debug, Clone, PartialEq)]
pub struct DecomposedTask {
    pub title: String,
    pub description: String,
    pub task_type: TaskType,
    pub complexity: Complexity,
    pub priority: i64,
    pub tools_needed: Vec<String>,
    /// Indices into the decomposition's task list.
    pub depends_on: Vec<usize>,
    /// Longest dependency chain ending at this task.
    pub wave: i64,
}

/// The validated output of decomposition.
#[derive(Debug, Clone, PartialEq)]
pub struct Decomposition {
    pub summary: String,
    pub tasks: Vec<DecomposedTask>,
}

/// Parse a plan payload JSON string.
pub fn parse_plan_payload(json: &str) -> Result<PlanPayload, DecomposeError> {
    let payload: PlanPayload = serde_json::from_str(json)?;
    Ok(payload)
}

/// Validate a plan payload and compute the task DAG.
///
/// Deterministic: the same payload always yields the same decomposition.
pub fn decompose(payload: &PlanPayload) -> Result<Decomposition, DecomposeError> {
    if payload.tasks.is_empty() {
        return Err(DecomposeError::NoTasks);
    }

    let n = payload.tasks.len();
    let mut tasks = Vec::with_capacity(n);

    for (idx, spec) in payload.tasks.iter().enumerate() {
        let task_type: TaskType =
            spec.task_type
                .parse()
                .map_err(|_| DecomposeError::InvalidTaskType {
                    task: spec.title.clone(),
                    value: spec.task_type.clone(),
                })?;

        let complexity: Complexity =
            spec.complexity
                .parse()
                .map_err(|_| DecomposeError::InvalidComplexity {
                    task: spec.title.clone(),
                    value: spec.complexity.clone(),
                })?;

        // Resolve dependencies, dropping anything unusable.
        let mut seen = HashSet::new();
        let mut depends_on = Vec::new();
        for raw in &spec.depends_on {
            match classify_dep(raw, idx, n) {
                DepRef::Index(dep) => {
                    if seen.insert(dep) {
                        depends_on.push(dep);
                    }
                }
                DepRef::Named(name) => {
                    tracing::warn!(
                        task = %spec.title,
                        dependency = %name,
                        "dropping non-numeric depends_on entry"
                    );
                }
                DepRef::Invalid { raw, reason } => {
                    tracing::warn!(
                        task = %spec.title,
                        dependency = %raw,
                        reason,
                        "dropping unusable depends_on entry"
                    );
                }
            }
        }

        tasks.push(DecomposedTask {
            title: spec.title.clone(),
            description: spec.description.clone(),
            task_type,
            complexity,
            priority: spec.priority,
            tools_needed: spec.tools_needed.clone(),
            depends_on,
            wave: 0,
        });
    }

    compute_waves(&mut tasks)?;

    Ok(Decomposition {
        summary: payload.summary.clone(),
        tasks,
    })
}

/// Assign waves in topological order using Kahn's algorithm.
///
/// `wave[t]` is the length of the longest dependency chain ending at `t`.
/// Any node left with positive in-degree after processing is part of a
/// cycle, which fails the decomposition.
fn compute_waves(tasks: &mut [DecomposedTask]) -> Result<(), DecomposeError> {
    let n = tasks.len();
    let mut in_degree = vec![0usize; n];
    let mut adj: Vec<Vec<usize>> = vec![vec![]; n];

    for (task_idx, task) in tasks.iter().enumerate() {
        for &dep_idx in &task.depends_on {
            // Edge: dep -> task (dep must complete before task).
            adj[dep_idx].push(task_idx);
            in_degree[task_idx] += 1;
        }
    }

    let mut queue: VecDeque<usize> = VecDeque::new();
    for (i, deg) in in_degree.iter().enumerate() {
        if *deg == 0 {
            queue.push_back(i);
        }
    }

    let mut sorted_count = 0usize;
    while let Some(node) = queue.pop_front() {
        sorted_count += 1;
        let node_wave = tasks[node].wave;
        for &neighbor in &adj[node] {
            if tasks[neighbor].wave < node_wave + 1 {
                tasks[neighbor].wave = node_wave + 1;
            }
            in_degree[neighbor] -= 1;
            if in_degree[neighbor] == 0 {
                queue.push_back(neighbor);
            }
        }
    }

    if sorted_count != n {
        let cycle_tasks: Vec<&str> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, deg)| **deg > 0)
            .map(|(i, _)| tasks[i].title.as_str())
            .collect();
        return Err(DecomposeError::CycleDetected(cycle_tasks.join(", ")));
    }

    Ok(())
}
