//! Self-healing: a Monitor / Analyze / Plan / Execute loop over the runner
//! logs with a Knowledge base of past remediations.

pub mod analyzer;
pub mod detector;
pub mod healer;
pub mod knowledge;
pub mod monitor;
pub mod patterns;

pub use analyzer::{Diagnosis, ErrorAnalyzer};
pub use detector::{Deduplicator, DetectedError, ErrorDetector};
pub use healer::{Healer, HealingResult};
pub use knowledge::{HealingRecord, KnowledgeBase, KnowledgeError, PatternStats};
pub use monitor::{HealingOutcome, MonitorMetrics, SelfHealingMonitor};
pub use patterns::{ErrorPattern, Severity};

/// Log target prefix of this module; lines carrying it are the monitor's own
/// output and are never fed back into detection.
pub(crate) const HEALING_TARGET: &str = module_path!();
