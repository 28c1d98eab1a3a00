use std::fmt::Write;
use std::path::Path;

use sa_daemon::healing::{KnowledgeBase, PatternStats};

use super::load_config;

/// Run the `monitor` subcommand: print self-healing history per pattern.
pub async fn run(repo: &Path) -> anyhow::Result<()> {
    let layout = load_config(repo)?.layout(repo);
    let path = layout.healing_db_path();
    if !path.exists() {
        println!("no healing history at {}", path.display());
        return Ok(());
    }
    let kb = KnowledgeBase::open(&path).await?;
    print!("{}", render(&kb.statistics().await?)?);
    Ok(())
}

pub fn render(stats: &[PatternStats]) -> anyhow::Result<String> {
    let mut out = String::new();
    if stats.is_empty() {
        writeln!(out, "no healing attempts recorded")?;
        return Ok(out);
    }
    writeln!(
        out,
        "{:<20}{:>9}{:>9}{:>8}  last seen",
        "pattern", "attempts", "healed", "rate"
    )?;
    for s in stats {
        let last = s
            .last_seen
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        writeln!(
            out,
            "{:<20}{:>9}{:>9}{:>7.0}%  {last}",
            s.pattern.as_str(),
            s.total_attempts,
            s.successful,
            s.success_rate * 100.0
        )?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use sa_daemon::healing::ErrorPattern;

    use super::*;

    #[test]
    fn empty_history() {
        assert_eq!(render(&[]).unwrap(), "no healing attempts recorded\n");
    }

    #[test]
    fn one_row_per_pattern() {
        let stats = vec![PatternStats {
            pattern: ErrorPattern::LockFileStuck,
            total_attempts: 4,
            successful: 3,
            success_rate: 0.75,
            last_seen: None,
        }];
        let out = render(&stats).unwrap();
        let row = out.lines().nth(1).unwrap();
        assert!(row.starts_with("lock_file_stuck"));
        assert!(row.contains("75%"));
        assert!(row.ends_with("-"));
    }
}
