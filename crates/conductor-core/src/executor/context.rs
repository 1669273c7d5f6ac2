//! Build the context document handed to a task's agent.
//!
//! The document carries the task description, feedback from the previous
//! attempt when retrying, and the outputs of completed dependencies --
//! newest first, truncated to a byte budget so one verbose dependency
//! cannot crowd out the rest.

use anyhow::{Context, Result};

use conductor_db::Db;
use conductor_db::models::{Task, TaskStatus};
use conductor_db::queries::tasks as task_db;

/// Assemble the markdown context for one task attempt.
pub async fn build_task_context(db: &Db, task: &Task, budget_bytes: usize) -> Result<String> {
    let mut out = String::new();

    out.push_str(&format!("# Task: {}\n\n", task.title));
    out.push_str(task.description.trim());
    out.push_str("\n\n");

    if task.attempt > 0 {
        if let Some(error) = &task.error {
            out.push_str("## Previous Attempt\n\n");
            out.push_str(&format!(
                "Attempt {} failed with: {}\n\n",
                task.attempt - 1,
                error.trim()
            ));
        }
    }

    let dep_ids = task_db::get_task_dependencies(db.read(), task.id).await?;
    if dep_ids.is_empty() {
        return Ok(out);
    }

    let mut deps = Vec::with_capacity(dep_ids.len());
    for dep_id in dep_ids {
        let dep = task_db::get_task(db.read(), dep_id)
            .await?
            .with_context(|| format!("dependency task {} not found", dep_id))?;
        if dep.status == TaskStatus::Completed {
            deps.push(dep);
        }
    }
    // Newest output first; it is most likely to matter.
    deps.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));

    if deps.is_empty() {
        return Ok(out);
    }

    out.push_str("## Inputs from completed dependencies\n\n");
    let mut remaining = budget_bytes;
    for dep in &deps {
        if remaining < 64 {
            out.push_str("(further dependency outputs omitted)\n");
            break;
        }
        let output = dep.output.as_deref().unwrap_or("");
        let snippet = truncate_snippet(output, remaining);
        remaining = remaining.saturating_sub(snippet.len());
        out.push_str(&format!("### {}\n\n{}\n\n", dep.title, snippet.trim_end()));
    }

    Ok(out)
}

/// Truncate a string to at most `max_bytes` bytes at a char boundary,
/// appending "..." if truncated.
fn truncate_snippet(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_owned();
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    let mut truncated = s[..end].to_owned();
    truncated.push_str("...");
    truncated
}
