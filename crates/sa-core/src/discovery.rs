//! Backlog intake from agent-reported findings.
//!
//! A discovery pass asks the agent to review the repository for one
//! [`DiscoveryCategory`] and answer with a JSON array of findings. This
//! module decodes that answer, scores each finding, and files the survivors
//! as `Pending` tasks.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::store::{StoreError, TaskStore};
use crate::types::{NewTask, Task};

/// `source` recorded on tasks filed by discovery.
pub const DISCOVERY_SOURCE: &str = "discovery";

const UNTITLED: &str = "Untitled improvement";
const DEFAULT_CONFIDENCE: f64 = 0.7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryCategory {
    Security,
    TestCoverage,
    Refactoring,
    Documentation,
    Performance,
    CodeQuality,
}

impl DiscoveryCategory {
    pub const ALL: [DiscoveryCategory; 6] = [
        DiscoveryCategory::Security,
        DiscoveryCategory::TestCoverage,
        DiscoveryCategory::Refactoring,
        DiscoveryCategory::Documentation,
        DiscoveryCategory::Performance,
        DiscoveryCategory::CodeQuality,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DiscoveryCategory::Security => "security",
            DiscoveryCategory::TestCoverage => "test_coverage",
            DiscoveryCategory::Refactoring => "refactoring",
            DiscoveryCategory::Documentation => "documentation",
            DiscoveryCategory::Performance => "performance",
            DiscoveryCategory::CodeQuality => "code_quality",
        }
    }

    pub fn parse(s: &str) -> Option<DiscoveryCategory> {
        let s = s.trim().to_ascii_lowercase().replace('-', "_");
        DiscoveryCategory::ALL.into_iter().find(|c| c.as_str() == s)
    }

    /// Priority of a medium-severity finding in this category.
    pub fn base_priority(self) -> i64 {
        match self {
            DiscoveryCategory::Security => 80,
            DiscoveryCategory::TestCoverage => 60,
            DiscoveryCategory::Performance => 50,
            DiscoveryCategory::CodeQuality => 45,
            DiscoveryCategory::Refactoring => 40,
            DiscoveryCategory::Documentation => 30,
        }
    }

    /// What the agent is asked to look for.
    pub fn focus(self) -> &'static str {
        match self {
            DiscoveryCategory::Security => {
                "security vulnerabilities: injection, unsafe input handling, hardcoded secrets, \
                 missing authorization checks, insecure defaults"
            }
            DiscoveryCategory::TestCoverage => {
                "missing or weak tests: untested public functions, untested error paths, \
                 modules without any tests"
            }
            DiscoveryCategory::Refactoring => {
                "refactoring opportunities: duplicated code, overly long functions, tangled \
                 dependencies, dead code"
            }
            DiscoveryCategory::Documentation => {
                "documentation gaps: undocumented public APIs, stale README sections, missing \
                 usage examples"
            }
            DiscoveryCategory::Performance => {
                "performance problems: needless allocation or copying, quadratic loops, \
                 blocking calls on hot paths, missing caching"
            }
            DiscoveryCategory::CodeQuality => {
                "code quality issues: unclear naming, swallowed errors, inconsistent style, \
                 fragile logic"
            }
        }
    }
}

impl fmt::Display for DiscoveryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Adjustment applied to the category base. A missing severity counts as
/// medium; an unrecognised one adds nothing.
pub fn severity_modifier(severity: Option<&str>) -> i64 {
    match severity.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
        Some("critical") => 20,
        Some("high") => 10,
        Some("low") => -10,
        _ => 0,
    }
}

/// Category base plus severity modifier, clamped to `1..=100`.
pub fn priority(category: DiscoveryCategory, severity: Option<&str>) -> i64 {
    (category.base_priority() + severity_modifier(severity)).clamp(1, 100)
}

/// One improvement the agent reported.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Finding {
    pub title: String,
    pub description: String,
    pub category: DiscoveryCategory,
    pub priority: i64,
    pub confidence: f64,
    pub file_paths: Vec<String>,
    /// The raw finding object as reported.
    pub metadata: Value,
}

impl Finding {
    fn from_value(value: Value, category: DiscoveryCategory) -> Option<Finding> {
        let obj = value.as_object()?;
        let text = |key: &str| obj.get(key).and_then(Value::as_str).map(str::trim);

        let title = text("title")
            .filter(|t| !t.is_empty())
            .unwrap_or(UNTITLED)
            .to_string();
        let description = text("description").unwrap_or_default().to_string();
        let confidence = obj
            .get("confidence")
            .and_then(Value::as_f64)
            .unwrap_or(DEFAULT_CONFIDENCE);
        let file_paths = match obj.get("file_path") {
            Some(Value::String(p)) if !p.trim().is_empty() => vec![p.trim().to_string()],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
            _ => Vec::new(),
        };
        let score = priority(category, text("severity"));

        Some(Finding {
            title,
            description,
            category,
            priority: score,
            confidence,
            file_paths,
            metadata: value,
        })
    }

    /// The task this finding becomes. File paths are appended to the
    /// description so the planner sees them.
    pub fn to_new_task(&self) -> NewTask {
        let mut description = self.description.clone();
        if !self.file_paths.is_empty() {
            if !description.is_empty() {
                description.push_str("\n\n");
            }
            description.push_str("Files: ");
            description.push_str(&self.file_paths.join(", "));
        }
        NewTask::new(self.title.clone())
            .with_description(description)
            .with_category(self.category.as_str())
            .with_priority(self.priority)
            .with_source(DISCOVERY_SOURCE)
    }
}

/// Decode the findings array from an agent answer. Tries each ```json
/// fenced block, then the outermost `[...]` span. Anything undecodable
/// yields no findings; non-object entries are skipped.
pub fn parse_findings(output: &str, category: DiscoveryCategory) -> Vec<Finding> {
    let mut candidates = Vec::new();
    let mut rest = output;
    while let Some(start) = rest.find("```json") {
        let body = &rest[start + "```json".len()..];
        let Some(end) = body.find("```") else { break };
        candidates.push(body[..end].trim());
        rest = &body[end + 3..];
    }
    if let (Some(start), Some(end)) = (output.find('['), output.rfind(']')) {
        if start < end {
            candidates.push(&output[start..=end]);
        }
    }

    let items = candidates
        .into_iter()
        .find_map(|c| match serde_json::from_str::<Value>(c) {
            Ok(Value::Array(items)) => Some(items),
            _ => None,
        })
        .unwrap_or_default();

    let findings: Vec<Finding> = items
        .into_iter()
        .filter_map(|item| Finding::from_value(item, category))
        .collect();
    debug!(category = %category, count = findings.len(), "findings decoded");
    findings
}

/// Drop repeats (same title ignoring case and surrounding space, first one
/// wins) and order by priority, highest first. Equal priorities keep their
/// reported order.
pub fn prioritize(findings: Vec<Finding>) -> Vec<Finding> {
    let mut seen = HashSet::new();
    let mut unique: Vec<Finding> = findings
        .into_iter()
        .filter(|f| seen.insert(f.title.trim().to_lowercase()))
        .collect();
    unique.sort_by(|a, b| b.priority.cmp(&a.priority));
    unique
}

/// Outcome of filing findings into the store.
#[derive(Debug, Default, Clone, Serialize)]
pub struct IntakeReport {
    pub added: Vec<Task>,
    /// Titles already present in the store.
    pub skipped: Vec<String>,
}

/// File `findings` as pending tasks, skipping titles the store already
/// holds. Other store errors abort the intake.
pub async fn intake(store: &TaskStore, findings: &[Finding]) -> Result<IntakeReport, StoreError> {
    let mut report = IntakeReport::default();
    for finding in findings {
        match store.add(finding.to_new_task()).await {
            Ok(task) => report.added.push(task),
            Err(StoreError::Duplicate(title)) => {
                debug!(title = %title, "finding already queued");
                report.skipped.push(title);
            }
            Err(e) => return Err(e),
        }
    }
    info!(
        added = report.added.len(),
        skipped = report.skipped.len(),
        "discovery intake finished"
    );
    Ok(report)
}
