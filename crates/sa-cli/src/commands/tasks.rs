//! Task mutations. Each command is one Task Store operation followed by a
//! one-line summary of the task's new state.

use std::fmt::Write;
use std::path::Path;

use sa_core::types::{Level, NewTask, Task};

use super::open_store;

pub async fn add(
    repo: &Path,
    title: String,
    description: String,
    category: String,
    priority: i64,
) -> anyhow::Result<()> {
    let store = open_store(repo).await?;
    let task = store
        .add(
            NewTask::new(title)
                .with_description(description)
                .with_category(category)
                .with_priority(priority),
        )
        .await?;
    println!("added {}", describe(&task));
    Ok(())
}

pub async fn approve(repo: &Path, id: i64) -> anyhow::Result<()> {
    let task = open_store(repo).await?.approve(id).await?;
    println!("approved {}", describe(&task));
    Ok(())
}

pub async fn feedback(repo: &Path, id: i64, message: &str) -> anyhow::Result<()> {
    let task = open_store(repo).await?.request_feedback(id, message).await?;
    println!("sent back for replanning {}", describe(&task));
    Ok(())
}

pub async fn reenable(repo: &Path, id: i64, feedback: Option<&str>) -> anyhow::Result<()> {
    let task = open_store(repo).await?.reenable(id, feedback).await?;
    println!("re-enabled {}", describe(&task));
    Ok(())
}

pub async fn retry(repo: &Path, id: i64) -> anyhow::Result<()> {
    let task = open_store(repo).await?.retry(id).await?;
    println!("requeued {} (retry {})", describe(&task), task.retry_count);
    Ok(())
}

/// Run the `plan` subcommand: print every stored plan of one task.
pub async fn plan(repo: &Path, id: i64) -> anyhow::Result<()> {
    let task = open_store(repo).await?.require(id).await?;
    print!("{}", render_plans(&task)?);
    Ok(())
}

pub fn describe(task: &Task) -> String {
    format!(
        "#{} {:?} [{} @ {}]",
        task.id, task.title, task.status, task.current_level
    )
}

pub fn render_plans(task: &Task) -> anyhow::Result<String> {
    let mut out = String::new();
    writeln!(out, "{}", describe(task))?;
    if let Some(feedback) = &task.feedback {
        writeln!(out, "feedback: {feedback}")?;
    }
    let mut any = false;
    for level in Level::ALL {
        let Some(plan) = task.level(level).plan.as_deref() else {
            continue;
        };
        any = true;
        writeln!(out)?;
        writeln!(out, "== {level} plan ==")?;
        writeln!(out, "{}", plan.trim_end())?;
    }
    if !any {
        writeln!(out, "no plans stored")?;
    }
    Ok(out)
}
