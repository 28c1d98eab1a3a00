use std::fmt::Write;
use std::path::Path;

use chrono::Utc;
use sa_core::store::TaskStore;
use sa_core::types::{Level, TaskStatus};

use super::open_store;

/// Run the `status` subcommand: print task counts and level progress.
pub async fn run(repo: &Path) -> anyhow::Result<()> {
    let store = open_store(repo).await?;
    print!("{}", render(&store).await?);
    Ok(())
}

pub async fn render(store: &TaskStore) -> anyhow::Result<String> {
    let stats = store.stats().await?;
    let mut out = String::new();

    writeln!(out, "selfai status")?;
    writeln!(out, "{}", "-".repeat(40))?;
    writeln!(out, "Total tasks:    {}", stats.total)?;
    for status in TaskStatus::ALL {
        let n = stats.count(status);
        if n > 0 {
            writeln!(out, "  {:<14}{n}", format!("{status}:"))?;
        }
    }

    writeln!(out)?;
    writeln!(out, "Levels")?;
    for level in Level::ALL {
        let s = store.level_stats(level).await?;
        let gate = match level.previous() {
            None => "open".to_string(),
            Some(_) => {
                let p = store.unlock_progress(level).await?;
                if p.is_unlocked() {
                    "unlocked".to_string()
                } else {
                    format!("locked {}/{}", p.completed, p.threshold)
                }
            }
        };
        writeln!(
            out,
            "  {:<10}passed {:>3}  active {:>3}  pending {:>3}  [{gate}]",
            level.name(),
            s.passed,
            s.in_progress,
            s.pending
        )?;
    }

    let estimates = store.time_estimates(Utc::now()).await?;
    if !estimates.is_empty() {
        writeln!(out)?;
        writeln!(out, "Active")?;
        for e in estimates {
            let left = match e.remaining_secs {
                Some(secs) => format!("~{} left", clock(secs)),
                None => "no estimate yet".to_string(),
            };
            writeln!(
                out,
                "  #{:<4}{} [{} {}] {} elapsed, {left}",
                e.task_id,
                e.title,
                e.level.name(),
                e.status,
                clock(e.elapsed_secs)
            )?;
        }
    }
    Ok(out)
}

fn clock(secs: i64) -> String {
    let (h, m, s) = (secs / 3600, secs % 3600 / 60, secs % 60);
    if h > 0 {
        format!("{h}h{m:02}m")
    } else {
        format!("{m}m{s:02}s")
    }
}
