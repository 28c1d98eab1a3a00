use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use super::detector::DetectedError;
use super::knowledge::{HealingRecord, KnowledgeBase};
use super::patterns::ErrorPattern;

/// Past healings considered when scoring a diagnosis.
const HISTORY_WINDOW: usize = 5;
const HISTORY_WEIGHT: f64 = 0.2;
const MAX_CONFIDENCE: f64 = 0.95;

/// Root cause and remediation chosen for one detected error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnosis {
    #[serde(skip)]
    pub error: DetectedError,
    pub root_cause: String,
    pub recommended_action: String,
    pub confidence: f64,
    pub similar_cases: usize,
}

impl Diagnosis {
    pub fn pattern(&self) -> ErrorPattern {
        self.error.pattern
    }
}

pub struct ErrorAnalyzer {
    knowledge: Option<Arc<KnowledgeBase>>,
}

impl ErrorAnalyzer {
    pub fn new(knowledge: Option<Arc<KnowledgeBase>>) -> Self {
        Self { knowledge }
    }

    pub async fn diagnose(&self, error: DetectedError) -> Diagnosis {
        let pattern = error.pattern;
        let similar = match &self.knowledge {
            Some(kb) => kb
                .find_similar(pattern, HISTORY_WINDOW)
                .await
                .unwrap_or_else(|e| {
                    warn!(pattern = %pattern, error = %e, "healing history lookup failed");
                    Vec::new()
                }),
            None => Vec::new(),
        };

        let confidence = confidence(pattern, &similar);
        debug!(pattern = %pattern, confidence, similar = similar.len(), "error diagnosed");
        Diagnosis {
            error,
            root_cause: pattern.root_cause().to_string(),
            recommended_action: pattern.recommended_action().to_string(),
            confidence,
            similar_cases: similar.len(),
        }
    }
}

/// Base confidence for `pattern`, raised by the success rate of `similar`
/// past healings and capped at 0.95.
pub fn confidence(pattern: ErrorPattern, similar: &[HealingRecord]) -> f64 {
    let base = pattern.base_confidence();
    if similar.is_empty() {
        return base;
    }
    let successes = similar.iter().filter(|r| r.success).count();
    let rate = successes as f64 / similar.len() as f64;
    (base + rate * HISTORY_WEIGHT).min(MAX_CONFIDENCE)
}
