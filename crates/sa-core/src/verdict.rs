use serde::{Deserialize, Serialize};

const FAIL_INDICATORS: [&str; 5] = ["failed", "error", "exception", "not working", "broken"];
const PASS_INDICATORS: [&str; 5] = ["passed", "success", "working", "verified", "complete"];

/// Outcome of interpreting a tester agent's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestVerdict {
    Passed,
    Failed,
    /// Nothing decisive in the output. Treated as a failure.
    Indeterminate,
}

impl TestVerdict {
    /// Shorthand for `evaluate(text).verdict`.
    pub fn parse(text: &str) -> TestVerdict {
        evaluate(text).verdict
    }

    pub fn is_pass(self) -> bool {
        self == TestVerdict::Passed
    }
}

/// The JSON block the test prompt asks for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestReport {
    pub test_passed: bool,
    #[serde(default)]
    pub tests_run: Vec<String>,
    #[serde(default)]
    pub issues_fixed: Vec<String>,
    #[serde(default, alias = "issues_found")]
    pub remaining_issues: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerdictSource {
    /// A well-formed report was decoded.
    Report(TestReport),
    /// A bare `"test_passed": <bool>` was found in otherwise malformed JSON.
    Flag,
    /// Keyword counts; each indicator counts once.
    Heuristic { pass_hits: usize, fail_hits: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub verdict: TestVerdict,
    pub source: VerdictSource,
}

/// Decide pass/fail from raw agent output. A structured report wins; the
/// keyword heuristic is only a fallback.
pub fn evaluate(output: &str) -> Verdict {
    if let Some(report) = decode_report(output) {
        return Verdict {
            verdict: if report.test_passed {
                TestVerdict::Passed
            } else {
                TestVerdict::Failed
            },
            source: VerdictSource::Report(report),
        };
    }

    let lower = output.to_lowercase();
    let compact: String = lower.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.contains("\"test_passed\":true") {
        return Verdict {
            verdict: TestVerdict::Passed,
            source: VerdictSource::Flag,
        };
    }
    if compact.contains("\"test_passed\":false") {
        return Verdict {
            verdict: TestVerdict::Failed,
            source: VerdictSource::Flag,
        };
    }

    let fail_hits = FAIL_INDICATORS.iter().filter(|i| lower.contains(*i)).count();
    let pass_hits = PASS_INDICATORS.iter().filter(|i| lower.contains(*i)).count();
    let verdict = match pass_hits.cmp(&fail_hits) {
        std::cmp::Ordering::Greater => TestVerdict::Passed,
        std::cmp::Ordering::Less => TestVerdict::Failed,
        std::cmp::Ordering::Equal => TestVerdict::Indeterminate,
    };
    Verdict {
        verdict,
        source: VerdictSource::Heuristic {
            pass_hits,
            fail_hits,
        },
    }
}

/// Decode the first ```json fenced block, or failing that the outermost
/// `{...}` span that mentions `test_passed`.
pub fn decode_report(output: &str) -> Option<TestReport> {
    let mut rest = output;
    while let Some(start) = rest.find("```json") {
        let body = &rest[start + "```json".len()..];
        let Some(end) = body.find("```") else { break };
        if let Ok(report) = serde_json::from_str::<TestReport>(body[..end].trim()) {
            return Some(report);
        }
        rest = &body[end + 3..];
    }

    let start = output.find('{')?;
    let end = output.rfind('}')?;
    if end <= start {
        return None;
    }
    let candidate = &output[start..=end];
    if !candidate.contains("test_passed") {
        return None;
    }
    serde_json::from_str::<TestReport>(candidate).ok()
}
