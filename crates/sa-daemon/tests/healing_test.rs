//! Self-healing: knowledge base, remediation actions and the monitor loop.

use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use sa_core::config::HealingConfig;
use sa_core::git::{GitOutput, GitRunner};
use sa_core::layout::DataLayout;
use sa_core::worktree_manager::WorktreeManager;
use sa_daemon::healing::{
    Diagnosis, DetectedError, ErrorAnalyzer, ErrorPattern, Healer, HealingOutcome, HealingResult,
    KnowledgeBase, SelfHealingMonitor,
};
use sa_harness::shutdown::ShutdownSignal;

#[derive(Default)]
struct MockGitRunner {
    commands: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl GitRunner for MockGitRunner {
    async fn run_git(&self, _dir: &Path, args: &[&str]) -> Result<GitOutput, String> {
        self.commands.lock().unwrap().push(args.join(" "));
        Ok(GitOutput::ok(""))
    }
}

fn detected(pattern: ErrorPattern, line: &str) -> DetectedError {
    DetectedError {
        pattern,
        severity: pattern.severity(),
        line: line.to_string(),
        file: None,
        detected_at: Utc::now(),
    }
}

fn diagnosis(pattern: ErrorPattern) -> Diagnosis {
    Diagnosis {
        error: detected(pattern, "boom"),
        root_cause: pattern.root_cause().to_string(),
        recommended_action: pattern.recommended_action().to_string(),
        confidence: pattern.base_confidence(),
        similar_cases: 0,
    }
}

struct Fixture {
    dir: tempfile::TempDir,
    layout: DataLayout,
    git: Arc<MockGitRunner>,
    worktrees: Arc<WorktreeManager>,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let layout = DataLayout::new(dir.path());
    layout.ensure().unwrap();
    let git = Arc::new(MockGitRunner::default());
    let worktrees = Arc::new(WorktreeManager::new(
        layout.repo(),
        layout.worktrees_dir(),
        git.clone(),
    ));
    Fixture {
        dir,
        layout,
        git,
        worktrees,
    }
}

fn healer(f: &Fixture, stale_after: Duration) -> Healer {
    Healer::new(f.layout.clone(), f.worktrees.clone(), f.git.clone(), stale_after)
}

// ===========================================================================
// KnowledgeBase
// ===========================================================================

#[tokio::test]
async fn find_similar_returns_successes_newest_first() {
    let kb = KnowledgeBase::open_in_memory().await.unwrap();
    let d = diagnosis(ErrorPattern::GitError);
    let older = Utc::now() - chrono::Duration::minutes(5);
    kb.record_at(&d, &HealingResult::success("ok", "prune"), older)
        .await
        .unwrap();
    kb.record(&d, &HealingResult::failure("nope")).await.unwrap();
    let newest = kb
        .record(&d, &HealingResult::success("ok again", "prune"))
        .await
        .unwrap();
    kb.record(
        &diagnosis(ErrorPattern::Timeout),
        &HealingResult::success("ok", "x"),
    )
    .await
    .unwrap();

    let similar = kb.find_similar(ErrorPattern::GitError, 5).await.unwrap();
    assert_eq!(similar.len(), 2);
    assert_eq!(similar[0].id, newest);
    assert!(similar.iter().all(|r| r.success && r.pattern == ErrorPattern::GitError));
    assert_eq!(kb.count().await.unwrap(), 4);
}

#[tokio::test]
async fn statistics_are_grouped_per_pattern() {
    let kb = KnowledgeBase::open_in_memory().await.unwrap();
    let d = diagnosis(ErrorPattern::DatabaseLocked);
    kb.record(&d, &HealingResult::success("ok", "wal")).await.unwrap();
    kb.record(&d, &HealingResult::failure("still locked")).await.unwrap();

    let stats = kb.statistics().await.unwrap();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].pattern, ErrorPattern::DatabaseLocked);
    assert_eq!(stats[0].total_attempts, 2);
    assert_eq!(stats[0].successful, 1);
    assert!((stats[0].success_rate - 0.5).abs() < 1e-9);
    assert!(stats[0].last_seen.is_some());
}

#[tokio::test]
async fn cleanup_applies_retention_and_per_type_cap() {
    let kb = KnowledgeBase::open_in_memory().await.unwrap();
    let d = diagnosis(ErrorPattern::Timeout);
    let ancient = Utc::now() - chrono::Duration::days(45);
    kb.record_at(&d, &HealingResult::failure("old"), ancient)
        .await
        .unwrap();
    for _ in 0..3 {
        kb.record(&d, &HealingResult::failure("recent")).await.unwrap();
    }

    let removed = kb.cleanup(30, 2).await.unwrap();
    assert_eq!(removed, 2);
    assert_eq!(kb.count().await.unwrap(), 2);
}

#[tokio::test]
async fn long_lines_are_truncated() {
    let kb = KnowledgeBase::open_in_memory().await.unwrap();
    let mut d = diagnosis(ErrorPattern::GitError);
    d.error.line = "x".repeat(2000);
    kb.record(&d, &HealingResult::success("ok", "prune")).await.unwrap();
    let rec = &kb.find_similar(ErrorPattern::GitError, 1).await.unwrap()[0];
    assert_eq!(rec.error_line.len(), 500);
}

// ===========================================================================
// ErrorAnalyzer
// ===========================================================================

#[tokio::test]
async fn history_raises_confidence() {
    let kb = Arc::new(KnowledgeBase::open_in_memory().await.unwrap());
    let analyzer = ErrorAnalyzer::new(Some(kb.clone()));

    let first = analyzer
        .diagnose(detected(ErrorPattern::GitError, "fatal: git broke"))
        .await;
    assert_eq!(first.confidence, 0.5);
    assert_eq!(first.similar_cases, 0);

    kb.record(&first, &HealingResult::success("ok", "prune"))
        .await
        .unwrap();
    let second = analyzer
        .diagnose(detected(ErrorPattern::GitError, "fatal: git broke"))
        .await;
    assert!((second.confidence - 0.7).abs() < 1e-9);
    assert_eq!(second.similar_cases, 1);
}

// ===========================================================================
// Healer
// ===========================================================================

#[tokio::test]
async fn stale_lock_is_removed_but_live_lock_is_kept() {
    let f = fixture();
    let healer = healer(&f, Duration::ZERO);
    let lock = f.layout.lock_path();

    std::fs::write(&lock, std::process::id().to_string()).unwrap();
    let held = healer.execute(&diagnosis(ErrorPattern::LockFileStuck)).await;
    assert!(!held.success);
    assert!(held.message.contains("is running"));
    assert!(lock.exists());

    std::fs::write(&lock, "2147483646").unwrap();
    let stale = healer.execute(&diagnosis(ErrorPattern::LockFileStuck)).await;
    assert!(stale.success, "{}", stale.message);
    assert!(!lock.exists());

    let missing = healer.execute(&diagnosis(ErrorPattern::LockFileStuck)).await;
    assert!(!missing.success);
}

#[tokio::test]
async fn garbage_lock_is_removed() {
    let f = fixture();
    let lock = f.layout.lock_path();
    std::fs::write(&lock, "not a pid").unwrap();
    let result = healer(&f, Duration::ZERO)
        .execute(&diagnosis(ErrorPattern::LockFileStuck))
        .await;
    assert!(result.success);
    assert!(!lock.exists());
}

#[tokio::test]
async fn database_lock_enables_wal_and_drops_stale_journal() {
    let f = fixture();
    let db = f.layout.db_path();
    {
        let conn = rusqlite::Connection::open(&db).unwrap();
        conn.execute_batch("CREATE TABLE t (x INTEGER);").unwrap();
    }
    let journal = db.with_file_name("improvements.db-journal");
    std::fs::write(&journal, b"stale").unwrap();

    let result = healer(&f, Duration::ZERO)
        .execute(&diagnosis(ErrorPattern::DatabaseLocked))
        .await;
    assert!(result.success, "{}", result.message);
    assert_eq!(result.context["journal_mode"], "wal");
    assert!(!journal.exists());
}

#[tokio::test]
async fn database_lock_without_store_fails() {
    let f = fixture();
    let result = healer(&f, Duration::ZERO)
        .execute(&diagnosis(ErrorPattern::DatabaseLocked))
        .await;
    assert!(!result.success);
}

#[tokio::test]
async fn worktree_conflict_prunes_orphans() {
    let f = fixture();
    std::fs::create_dir_all(f.layout.worktrees_dir().join("task-99")).unwrap();

    let result = healer(&f, Duration::ZERO)
        .execute(&diagnosis(ErrorPattern::WorktreeConflict))
        .await;
    assert!(result.success);
    assert_eq!(result.context["orphans_removed"], 1);
    assert!(!f.layout.worktrees_dir().join("task-99").exists());
    assert!(f.git.commands.lock().unwrap().contains(&"worktree prune".to_string()));
}

#[tokio::test]
async fn git_error_removes_only_old_index_lock() {
    let f = fixture();
    let git_dir = f.dir.path().join(".git");
    std::fs::create_dir_all(&git_dir).unwrap();
    std::fs::write(git_dir.join("index.lock"), b"").unwrap();

    let fresh = healer(&f, Duration::from_secs(3600))
        .execute(&diagnosis(ErrorPattern::GitError))
        .await;
    assert!(fresh.success);
    assert!(git_dir.join("index.lock").exists());

    healer(&f, Duration::ZERO)
        .execute(&diagnosis(ErrorPattern::GitError))
        .await;
    assert!(!git_dir.join("index.lock").exists());
}

#[tokio::test]
async fn patterns_without_remediation_need_a_human() {
    let f = fixture();
    let h = healer(&f, Duration::ZERO);
    for pattern in [ErrorPattern::WorkerFailure, ErrorPattern::Timeout] {
        let result = h.execute(&diagnosis(pattern)).await;
        assert!(!result.success);
        assert!(result.message.contains("manual intervention required"));
    }
}

#[tokio::test]
async fn descriptor_exhaustion_reports_counts() {
    let f = fixture();
    let result = healer(&f, Duration::ZERO)
        .execute(&diagnosis(ErrorPattern::TooManyFiles))
        .await;
    assert!(result.context.get("open_before").is_some());
    assert!(result.context.get("open_after").is_some());
}

// ===========================================================================
// SelfHealingMonitor
// ===========================================================================

async fn monitor(f: &Fixture, config: HealingConfig) -> SelfHealingMonitor {
    let kb = Arc::new(KnowledgeBase::open_in_memory().await.unwrap());
    SelfHealingMonitor::new(&f.layout, config, kb, f.worktrees.clone(), f.git.clone())
}

#[tokio::test]
async fn disabled_auto_heal_only_detects() {
    let f = fixture();
    let config = HealingConfig {
        auto_heal: false,
        ..Default::default()
    };
    let m = monitor(&f, config).await;

    let outcome = m.process_line("sqlite3.OperationalError: database is locked", None).await;
    assert_eq!(outcome, Some(HealingOutcome::Disabled));
    let metrics = m.metrics();
    assert_eq!(metrics.errors_detected, 1);
    assert_eq!(metrics.healings_attempted, 0);
    assert_eq!(metrics.detections_by_type["database_locked"], 1);
}

#[tokio::test]
async fn repeats_inside_cooldown_are_suppressed() {
    let f = fixture();
    let config = HealingConfig {
        auto_heal: false,
        ..Default::default()
    };
    let m = monitor(&f, config).await;
    m.process_line("worker 2 failed", None).await;
    let again = m.process_line("worker 2 failed", None).await;
    assert_eq!(again, Some(HealingOutcome::Suppressed));
    assert_eq!(m.metrics().errors_detected, 2);
}

#[tokio::test]
async fn clean_and_self_emitted_lines_are_ignored() {
    let f = fixture();
    let m = monitor(&f, HealingConfig::default()).await;
    assert_eq!(m.process_line("INFO cycle complete", None).await, None);
    let own = "WARN sa_daemon::healing::healer: healing failed pattern=database_locked";
    assert_eq!(m.process_line(own, None).await, None);
    assert_eq!(m.metrics().errors_detected, 0);
}

#[tokio::test]
async fn low_confidence_skips_remediation() {
    let f = fixture();
    let config = HealingConfig {
        min_confidence: 0.99,
        ..Default::default()
    };
    let m = monitor(&f, config).await;
    let outcome = m.process_line("operation timed out", None).await;
    assert_eq!(outcome, Some(HealingOutcome::LowConfidence(0.5)));
    assert_eq!(m.knowledge().count().await.unwrap(), 0);
}

#[tokio::test]
async fn healing_attempts_are_recorded() {
    let f = fixture();
    std::fs::write(f.layout.lock_path(), "2147483646").unwrap();
    let m = monitor(&f, HealingConfig::default()).await;

    let outcome = m
        .process_line("Unable to create '/repo/.selfai_data/runner.lock'", None)
        .await;
    assert!(matches!(outcome, Some(HealingOutcome::Healed(_))));
    let metrics = m.metrics();
    assert_eq!(metrics.healings_attempted, 1);
    assert_eq!(metrics.healings_successful, 1);
    assert_eq!(metrics.success_rate, 1.0);
    assert_eq!(m.knowledge().count().await.unwrap(), 1);

    m.reset_metrics();
    assert_eq!(m.metrics().errors_detected, 0);
    assert!(m.metrics().detections_by_type.is_empty());
}

#[tokio::test]
async fn failed_healing_is_recorded_too() {
    let f = fixture();
    let m = monitor(&f, HealingConfig::default()).await;
    let outcome = m.process_line("worker pool: worker 4 failed", None).await;
    assert!(matches!(outcome, Some(HealingOutcome::Failed(_))));
    assert_eq!(m.knowledge().count().await.unwrap(), 1);
    assert_eq!(m.metrics().healings_successful, 0);
}

#[tokio::test]
async fn monitor_loop_tails_new_log_lines_until_stopped() {
    let f = fixture();
    let config = HealingConfig {
        auto_heal: false,
        ..Default::default()
    };
    let m = Arc::new(monitor(&f, config).await);
    let stop = ShutdownSignal::new();
    let handle = m.spawn(stop.clone());

    let log = f.layout.logs_dir().join("runner.log");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(15);
    while m.metrics().errors_detected == 0 {
        assert!(tokio::time::Instant::now() < deadline, "no detection from log file");
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log)
            .unwrap();
        writeln!(file, "ERROR sa_core::store: database is locked").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    assert!(m.metrics().running);

    stop.trigger();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(!m.metrics().running);
}
