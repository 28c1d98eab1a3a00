use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use regex::{Regex, RegexBuilder};
use tracing::{debug, warn};

use super::patterns::{ErrorPattern, Severity};

/// Default window in which repeats of one pattern are suppressed.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60);

/// A log line that matched one of the known patterns.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedError {
    pub pattern: ErrorPattern,
    pub severity: Severity,
    pub line: String,
    pub file: Option<PathBuf>,
    pub detected_at: DateTime<Utc>,
}

/// Matches log lines against the [`ErrorPattern`] table and counts hits.
pub struct ErrorDetector {
    patterns: Vec<(ErrorPattern, Regex)>,
    counts: HashMap<ErrorPattern, u64>,
}

impl ErrorDetector {
    pub fn new() -> Self {
        let patterns = ErrorPattern::ALL
            .into_iter()
            .filter_map(|pattern| {
                match RegexBuilder::new(pattern.regex()).case_insensitive(true).build() {
                    Ok(re) => Some((pattern, re)),
                    Err(e) => {
                        warn!(pattern = %pattern, error = %e, "invalid error pattern, skipping");
                        None
                    }
                }
            })
            .collect();
        Self {
            patterns,
            counts: HashMap::new(),
        }
    }

    /// First pattern matching `line`, if any.
    pub fn analyze_line(&mut self, line: &str, file: Option<&Path>) -> Option<DetectedError> {
        let pattern = self
            .patterns
            .iter()
            .find(|(_, re)| re.is_match(line))
            .map(|(p, _)| *p)?;

        *self.counts.entry(pattern).or_insert(0) += 1;
        let preview: String = line.chars().take(100).collect();
        debug!(pattern = %pattern, line = %preview, "error pattern detected");

        Some(DetectedError {
            pattern,
            severity: pattern.severity(),
            line: line.to_string(),
            file: file.map(Path::to_path_buf),
            detected_at: Utc::now(),
        })
    }

    /// Detections per pattern name since the last reset.
    pub fn statistics(&self) -> BTreeMap<String, u64> {
        self.counts
            .iter()
            .map(|(p, n)| (p.as_str().to_string(), *n))
            .collect()
    }

    pub fn reset_statistics(&mut self) {
        self.counts.clear();
    }
}

impl Default for ErrorDetector {
    fn default() -> Self {
        Self::new()
    }
}

/// Suppresses repeats of a pattern inside the cooldown window.
#[derive(Debug)]
pub struct Deduplicator {
    cooldown: Duration,
    last_seen: HashMap<ErrorPattern, Instant>,
}

impl Deduplicator {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_seen: HashMap::new(),
        }
    }

    /// `true` when `pattern` should be processed at `now`; the window
    /// restarts only on admitted detections.
    pub fn admit(&mut self, pattern: ErrorPattern, now: Instant) -> bool {
        if let Some(last) = self.last_seen.get(&pattern) {
            if now.saturating_duration_since(*last) < self.cooldown {
                return false;
            }
        }
        self.last_seen.insert(pattern, now);
        true
    }

    pub fn clear(&mut self) {
        self.last_seen.clear();
    }
}

impl Default for Deduplicator {
    fn default() -> Self {
        Self::new(DEFAULT_COOLDOWN)
    }
}
