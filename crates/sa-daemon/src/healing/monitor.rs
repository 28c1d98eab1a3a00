//! The MAPE-K loop: tail runner logs, detect known failures, diagnose them,
//! remediate, and record the outcome.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use sa_core::config::HealingConfig;
use sa_core::file_watcher::{LogTailer, LogWatcher};
use sa_core::git::GitRunner;
use sa_core::layout::DataLayout;
use sa_core::worktree_manager::WorktreeManager;
use sa_harness::shutdown::ShutdownSignal;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::analyzer::ErrorAnalyzer;
use super::detector::{Deduplicator, DetectedError, ErrorDetector};
use super::healer::{Healer, HealingResult};
use super::knowledge::{KnowledgeBase, KnowledgeError};
use super::HEALING_TARGET;

const WATCH_POLL: Duration = Duration::from_secs(1);

/// What the monitor did with one detected error.
#[derive(Debug, Clone, PartialEq)]
pub enum HealingOutcome {
    /// Same pattern seen within the cooldown window.
    Suppressed,
    /// Healing is switched off in config.
    Disabled,
    /// Diagnosis confidence was below `min_confidence`.
    LowConfidence(f64),
    Healed(HealingResult),
    Failed(HealingResult),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorMetrics {
    pub errors_detected: u64,
    pub healings_attempted: u64,
    pub healings_successful: u64,
    pub success_rate: f64,
    pub running: bool,
    pub detections_by_type: BTreeMap<String, u64>,
}

pub struct SelfHealingMonitor {
    logs_dir: PathBuf,
    config: HealingConfig,
    detector: Mutex<ErrorDetector>,
    dedup: Mutex<Deduplicator>,
    analyzer: ErrorAnalyzer,
    healer: Healer,
    knowledge: Arc<KnowledgeBase>,
    errors_detected: AtomicU64,
    healings_attempted: AtomicU64,
    healings_successful: AtomicU64,
    running: AtomicBool,
}

impl SelfHealingMonitor {
    /// Open the knowledge base under `layout` and wire up the loop.
    pub async fn open(
        layout: &DataLayout,
        config: HealingConfig,
        worktrees: Arc<WorktreeManager>,
        git: Arc<dyn GitRunner>,
    ) -> Result<Self, KnowledgeError> {
        let knowledge = Arc::new(KnowledgeBase::open(layout.healing_db_path()).await?);
        Ok(Self::new(layout, config, knowledge, worktrees, git))
    }

    pub fn new(
        layout: &DataLayout,
        config: HealingConfig,
        knowledge: Arc<KnowledgeBase>,
        worktrees: Arc<WorktreeManager>,
        git: Arc<dyn GitRunner>,
    ) -> Self {
        let stale_after = Duration::from_secs(config.stale_artifact_secs);
        Self {
            logs_dir: layout.logs_dir(),
            dedup: Mutex::new(Deduplicator::new(Duration::from_secs(config.cooldown_secs))),
            detector: Mutex::new(ErrorDetector::new()),
            analyzer: ErrorAnalyzer::new(Some(Arc::clone(&knowledge))),
            healer: Healer::new(layout.clone(), worktrees, git, stale_after),
            knowledge,
            config,
            errors_detected: AtomicU64::new(0),
            healings_attempted: AtomicU64::new(0),
            healings_successful: AtomicU64::new(0),
            running: AtomicBool::new(false),
        }
    }

    pub fn knowledge(&self) -> &Arc<KnowledgeBase> {
        &self.knowledge
    }

    pub fn logs_dir(&self) -> &Path {
        &self.logs_dir
    }

    /// Run one log line through detection and, on a match, healing.
    /// Lines emitted by the monitor itself are ignored.
    pub async fn process_line(&self, line: &str, file: Option<&Path>) -> Option<HealingOutcome> {
        if line.contains(HEALING_TARGET) {
            return None;
        }
        let detected = self
            .detector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .analyze_line(line, file)?;
        Some(self.process_error(detected).await)
    }

    pub async fn process_error(&self, error: DetectedError) -> HealingOutcome {
        self.errors_detected.fetch_add(1, Ordering::Relaxed);
        let pattern = error.pattern;

        let admitted = self
            .dedup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .admit(pattern, Instant::now());
        if !admitted {
            debug!(pattern = %pattern, "duplicate error within cooldown, skipping");
            return HealingOutcome::Suppressed;
        }

        warn!(pattern = %pattern, severity = %error.severity, "error detected");
        let diagnosis = self.analyzer.diagnose(error).await;

        if !self.config.enabled || !self.config.auto_heal {
            info!(pattern = %pattern, "auto-heal disabled, not remediating");
            return HealingOutcome::Disabled;
        }
        if diagnosis.confidence < self.config.min_confidence {
            info!(
                pattern = %pattern,
                confidence = diagnosis.confidence,
                threshold = self.config.min_confidence,
                "confidence below threshold, not remediating"
            );
            return HealingOutcome::LowConfidence(diagnosis.confidence);
        }

        self.healings_attempted.fetch_add(1, Ordering::Relaxed);
        let result = self.healer.execute(&diagnosis).await;
        if result.success {
            self.healings_successful.fetch_add(1, Ordering::Relaxed);
        }
        if let Err(e) = self.knowledge.record(&diagnosis, &result).await {
            warn!(pattern = %pattern, error = %e, "failed to record healing attempt");
        }

        if result.success {
            HealingOutcome::Healed(result)
        } else {
            HealingOutcome::Failed(result)
        }
    }

    /// Periodic maintenance: make sure the log directory exists and prune
    /// the healing history.
    pub async fn health_check(&self) {
        if let Err(e) = tokio::fs::create_dir_all(&self.logs_dir).await {
            warn!(dir = %self.logs_dir.display(), error = %e, "failed to create logs directory");
        }
        match self
            .knowledge
            .cleanup(self.config.retention_days, self.config.max_records_per_type)
            .await
        {
            Ok(removed) => debug!(removed, "healing history maintenance done"),
            Err(e) => warn!(error = %e, "healing history cleanup failed"),
        }
        let m = self.metrics();
        debug!(
            detected = m.errors_detected,
            attempted = m.healings_attempted,
            successful = m.healings_successful,
            "health check"
        );
    }

    pub fn metrics(&self) -> MonitorMetrics {
        let attempted = self.healings_attempted.load(Ordering::Relaxed);
        let successful = self.healings_successful.load(Ordering::Relaxed);
        MonitorMetrics {
            errors_detected: self.errors_detected.load(Ordering::Relaxed),
            healings_attempted: attempted,
            healings_successful: successful,
            success_rate: if attempted > 0 {
                successful as f64 / attempted as f64
            } else {
                0.0
            },
            running: self.running.load(Ordering::Relaxed),
            detections_by_type: self
                .detector
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .statistics(),
        }
    }

    pub fn reset_metrics(&self) {
        self.errors_detected.store(0, Ordering::Relaxed);
        self.healings_attempted.store(0, Ordering::Relaxed);
        self.healings_successful.store(0, Ordering::Relaxed);
        self.detector
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset_statistics();
        self.dedup.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    pub fn spawn(self: &Arc<Self>, stop: ShutdownSignal) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run(stop))
    }

    /// Watch and heal until `stop` fires. Never returns an error: every
    /// failure inside the loop is logged and the loop carries on.
    pub async fn run(self: Arc<Self>, stop: ShutdownSignal) {
        let _guard = stop.guard();
        self.running.store(true, Ordering::Relaxed);
        if let Err(e) = tokio::fs::create_dir_all(&self.logs_dir).await {
            warn!(dir = %self.logs_dir.display(), error = %e, "failed to create logs directory");
        }
        info!(dir = %self.logs_dir.display(), "self-healing monitor started");

        let (tx, rx) = flume::unbounded::<(String, PathBuf)>();
        let dir = self.logs_dir.clone();
        let watch_stop = stop.clone();
        let watcher = tokio::task::spawn_blocking(move || watch_logs(&dir, &tx, &watch_stop));

        let period = Duration::from_secs(self.config.health_check_interval_secs.max(1));
        let mut health = tokio::time::interval(period);
        health.tick().await;

        let mut watching = true;
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                msg = rx.recv_async(), if watching => match msg {
                    Ok((line, path)) => {
                        self.process_line(&line, Some(&path)).await;
                    }
                    Err(_) => {
                        warn!("log watcher stopped, continuing with health checks only");
                        watching = false;
                    }
                },
                _ = health.tick() => self.health_check().await,
            }
        }

        self.running.store(false, Ordering::Relaxed);
        if let Err(e) = watcher.await {
            warn!(error = %e, "log watcher thread panicked");
        }
        info!("self-healing monitor stopped");
    }
}

/// Blocking half of the monitor: forward every newly appended log line.
fn watch_logs(dir: &Path, tx: &flume::Sender<(String, PathBuf)>, stop: &ShutdownSignal) {
    let watcher = match LogWatcher::new(dir) {
        Ok(w) => w,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "failed to watch logs directory");
            return;
        }
    };
    let mut tailer = LogTailer::new();
    if let Err(e) = tailer.prime(dir) {
        warn!(dir = %dir.display(), error = %e, "failed to read existing logs");
    }

    while !stop.is_shutting_down() {
        for path in watcher.recv_changed(WATCH_POLL) {
            match tailer.read_new(&path) {
                Ok(lines) => {
                    for line in lines {
                        if tx.send((line, path.clone())).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "log file unreadable");
                    tailer.forget(&path);
                }
            }
        }
    }
}
