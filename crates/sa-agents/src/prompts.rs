//! Prompt templates for the agent phases.
//!
//! Each phase has a built-in template with `{variable}` placeholders. A
//! repository can override any of them with `<data_dir>/prompts/<phase>.md`.
//! Unknown placeholders are left as-is so literal braces (the JSON report
//! format in the test prompt) survive rendering.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use sa_core::discovery::DiscoveryCategory;
use sa_core::types::{Level, Task};
use sa_core::verdict::TestReport;
use sa_core::worktree_manager::{ConflictedFile, CONFLICTS_RESOLVED_MARKER};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Previous-level output passed to the planner is capped to this many chars.
const PREVIOUS_OUTPUT_LIMIT: usize = 2000;

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Plan,
    Execute,
    Test,
    ResolveConflicts,
    Discover,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Plan,
        Phase::Execute,
        Phase::Test,
        Phase::ResolveConflicts,
        Phase::Discover,
    ];

    /// File stem used for overrides.
    pub fn file_stem(self) -> &'static str {
        match self {
            Phase::Plan => "plan",
            Phase::Execute => "execute",
            Phase::Test => "test",
            Phase::ResolveConflicts => "resolve_conflicts",
            Phase::Discover => "discover",
        }
    }

    fn from_file_stem(stem: &str) -> Option<Phase> {
        Phase::ALL.into_iter().find(|p| p.file_stem() == stem)
    }
}

// ---------------------------------------------------------------------------
// PromptTemplate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptSource {
    BuiltIn,
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub phase: Phase,
    /// Raw text with `{variable}` placeholders.
    pub template: String,
    pub source: PromptSource,
}

impl PromptTemplate {
    pub fn render(&self, vars: &HashMap<&str, String>) -> String {
        let mut output = self.template.clone();
        for (key, value) in vars {
            output = output.replace(&format!("{{{key}}}"), value);
        }
        output
    }
}

// ---------------------------------------------------------------------------
// PromptRegistry
// ---------------------------------------------------------------------------

/// Templates for every phase plus the builders that fill them in.
#[derive(Debug, Clone)]
pub struct PromptRegistry {
    templates: HashMap<Phase, PromptTemplate>,
}

impl PromptRegistry {
    /// A registry with the built-in templates.
    pub fn new() -> Self {
        let templates = Phase::ALL
            .into_iter()
            .map(|phase| {
                (
                    phase,
                    PromptTemplate {
                        phase,
                        template: built_in(phase).to_string(),
                        source: PromptSource::BuiltIn,
                    },
                )
            })
            .collect();
        Self { templates }
    }

    pub fn get(&self, phase: Phase) -> Option<&PromptTemplate> {
        self.templates.get(&phase)
    }

    fn render(&self, phase: Phase, vars: &HashMap<&str, String>) -> String {
        match self.templates.get(&phase) {
            Some(template) => template.render(vars),
            None => PromptTemplate {
                phase,
                template: built_in(phase).to_string(),
                source: PromptSource::BuiltIn,
            }
            .render(vars),
        }
    }

    pub fn set(&mut self, template: PromptTemplate) {
        self.templates.insert(template.phase, template);
    }

    /// Load `<dir>/<phase>.md` overrides. Missing directories and unknown
    /// files are ignored. Returns the number of templates overridden.
    pub fn load_overrides(&mut self, dir: &Path) -> usize {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return 0;
        };
        let mut loaded = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_none_or(|e| e != "md") {
                continue;
            }
            let Some(phase) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(Phase::from_file_stem)
            else {
                continue;
            };
            match std::fs::read_to_string(&path) {
                Ok(template) => {
                    debug!(phase = phase.file_stem(), path = %path.display(), "prompt override loaded");
                    self.set(PromptTemplate {
                        phase,
                        template,
                        source: PromptSource::File(path),
                    });
                    loaded += 1;
                }
                Err(e) => warn!(path = %path.display(), error = %e, "failed to read prompt override"),
            }
        }
        loaded
    }

    // -----------------------------------------------------------------------
    // Builders
    // -----------------------------------------------------------------------

    /// Planning prompt for the task's current level. Carries the previous
    /// level's output and any pending user feedback.
    pub fn plan(&self, task: &Task, repo: &Path) -> String {
        let level = task.current_level;
        let mut vars = level_vars(task, repo);
        vars.insert("guidance", level_guidance(level).to_string());

        let previous = level
            .previous()
            .and_then(|prev| task.level(prev).output.as_deref())
            .filter(|o| !o.trim().is_empty())
            .map(|o| {
                let clipped: String = o.chars().take(PREVIOUS_OUTPUT_LIMIT).collect();
                format!("\nPREVIOUS LEVEL OUTPUT:\n{clipped}\n")
            })
            .unwrap_or_default();
        vars.insert("previous_output", previous);

        let feedback = task
            .feedback
            .as_deref()
            .filter(|f| !f.trim().is_empty())
            .map(|f| format!("\nUSER FEEDBACK ON THE LAST PLAN (address it):\n{f}\n"))
            .unwrap_or_default();
        vars.insert("feedback", feedback);

        self.render(Phase::Plan, &vars)
    }

    /// Execution prompt: carry out `plan` inside `work_dir`.
    pub fn execute(&self, task: &Task, plan: &str, work_dir: &Path) -> String {
        let mut vars = level_vars(task, work_dir);
        vars.insert("plan", plan.to_string());
        self.render(Phase::Execute, &vars)
    }

    /// Test prompt: verify (and repair) the current level and report in
    /// the JSON shape [`TestReport`] decodes.
    pub fn test(&self, task: &Task, work_dir: &Path) -> String {
        let mut vars = level_vars(task, work_dir);
        vars.insert("criteria", test_criteria(task.current_level).to_string());
        vars.insert("report_fields", report_fields());
        self.render(Phase::Test, &vars)
    }

    /// Conflict-resolution prompt with each conflicted file inlined.
    pub fn resolve_conflicts(&self, task_id: i64, title: &str, files: &[ConflictedFile]) -> String {
        let mut listing = String::new();
        for file in files {
            listing.push_str(&format!("--- {} ---\n{}\n", file.path, file.content));
        }
        let vars = HashMap::from([
            ("task_id", task_id.to_string()),
            ("title", title.to_string()),
            ("files", listing),
            ("marker", CONFLICTS_RESOLVED_MARKER.to_string()),
        ]);
        self.render(Phase::ResolveConflicts, &vars)
    }

    /// Discovery prompt: review `repo` for one category of improvement and
    /// answer with a findings array.
    pub fn discover(&self, category: DiscoveryCategory, repo: &Path) -> String {
        let vars = HashMap::from([
            ("category", category.as_str().to_string()),
            ("focus", category.focus().to_string()),
            ("repo", repo.display().to_string()),
        ]);
        self.render(Phase::Discover, &vars)
    }
}

impl Default for PromptRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn level_vars(task: &Task, dir: &Path) -> HashMap<&'static str, String> {
    let level = task.current_level;
    HashMap::from([
        ("title", task.title.clone()),
        ("description", task.description.clone()),
        ("level_name", level.name().to_string()),
        ("level_number", level.number().to_string()),
        ("repo", dir.display().to_string()),
    ])
}

fn report_fields() -> String {
    let example = TestReport {
        test_passed: true,
        tests_run: vec!["what you verified".into()],
        issues_fixed: vec!["what you fixed".into()],
        remaining_issues: vec!["what you could not fix".into()],
    };
    serde_json::to_string_pretty(&example).unwrap_or_default()
}

/// What each level should and should not attempt.
pub fn level_guidance(level: Level) -> &'static str {
    match level {
        Level::Mvp => {
            "MVP LEVEL - minimal viable implementation.\n\
             Goal: get the basic functionality working.\n\
             Do: implement the core feature with minimal code, handle errors on critical paths, \
             follow existing patterns.\n\
             Don't: add abstractions, chase every edge case, or create new files unless required.\n\
             Success: the feature works for the basic use case."
        }
        Level::Enhanced => {
            "ENHANCED LEVEL - robust implementation.\n\
             Goal: make the MVP production-worthy.\n\
             Do: validate inputs of public entry points, handle edge cases, improve error messages, \
             write focused unit tests.\n\
             Don't: rewrite the feature or grow its scope.\n\
             Success: the feature handles unexpected input gracefully."
        }
        Level::Advanced => {
            "ADVANCED LEVEL - production excellence.\n\
             Goal: make it dependable and maintainable.\n\
             Do: fix performance bottlenecks, add logging and retries where they matter, document \
             public APIs, add integration tests.\n\
             Don't: make breaking API changes.\n\
             Success: the feature is production-ready with full coverage."
        }
    }
}

/// Pass criteria for a level's test phase.
pub fn test_criteria(level: Level) -> &'static str {
    match level {
        Level::Mvp => {
            "- Code builds and runs without errors\n\
             - Basic functionality works\n\
             - Imports and module wiring are correct"
        }
        Level::Enhanced => {
            "- All MVP criteria pass\n\
             - Edge cases are handled\n\
             - Error messages are helpful\n\
             - Input validation works\n\
             - Tests cover the main scenarios"
        }
        Level::Advanced => {
            "- All Enhanced criteria pass\n\
             - Performance is acceptable\n\
             - Security considerations are addressed\n\
             - Documentation is complete\n\
             - Full test coverage"
        }
    }
}

fn built_in(phase: Phase) -> &'static str {
    match phase {
        Phase::Plan => PLAN_TEMPLATE,
        Phase::Execute => EXECUTE_TEMPLATE,
        Phase::Test => TEST_TEMPLATE,
        Phase::ResolveConflicts => CONFLICT_TEMPLATE,
        Phase::Discover => DISCOVER_TEMPLATE,
    }
}

const PLAN_TEMPLATE: &str = "\
=== PLANNING: {title} ===
Level: {level_name} ({level_number}/3)
Repository: {repo}
Description: {description}
{previous_output}{feedback}
{guidance}

Create a specific, actionable plan for this level:
1. Read the relevant code and find where the change belongs.
2. List the exact files to modify and the concrete change in each.

End the plan with a JSON summary:
```json
{\"description\": \"one line\", \"files_to_modify\": [\"relative/path\"], \"dependencies\": []}
```
Paths must be relative to the repository root.";

const EXECUTE_TEMPLATE: &str = "\
=== EXECUTING: {title} ===
Level: {level_name} ({level_number}/3)
Working directory: {repo}

PLAN TO EXECUTE:
{plan}

Rules:
- Make real code changes with the edit tools; no placeholder code.
- Follow the plan step by step and keep changes focused.
- Do not create files the plan does not call for.

When done, summarize the files modified and any issues encountered.";

const TEST_TEMPLATE: &str = "\
=== TESTING: {title} ===
Level: {level_name} ({level_number}/3)
Working directory: {repo}
Description: {description}

Pass criteria:
{criteria}

Find the implementation, verify it against the criteria, fix what is broken, and run the \
project's tests. A level only passes if it actually works.

Finish with ONLY this JSON block:
```json
{report_fields}
```";

const CONFLICT_TEMPLATE: &str = "\
Resolve the git merge conflicts for task #{task_id}: {title}

The merge is in progress in the current directory. Conflicted files:

{files}
Edit each file so that it keeps the intent of both sides and contains no conflict markers \
(<<<<<<<, =======, >>>>>>>). Do not commit.

When every file is resolved, print {marker} on its own line.";

const DISCOVER_TEMPLATE: &str = "\
=== DISCOVERY: {category} ===
Repository: {repo}

Review the code base and look for {focus}.

Report only concrete, actionable improvements you found in the code. Do not edit anything.
Answer with ONLY a JSON array; use [] when there is nothing worth doing:
```json
[{\"title\": \"short imperative title\", \"description\": \"what to change and why\", \"severity\": \"critical|high|medium|low\", \"file_path\": \"relative/path\", \"confidence\": 0.8}]
```";

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use sa_core::types::NewTask;

    fn task() -> Task {
        Task::from_new(
            4,
            NewTask::new("Add dark mode").with_description("Toggle in settings"),
            Utc::now(),
        )
    }

    #[test]
    fn placeholders_are_filled() {
        let prompts = PromptRegistry::new();
        let text = prompts.plan(&task(), Path::new("/repo"));
        assert!(text.contains("=== PLANNING: Add dark mode ==="));
        assert!(text.contains("Level: MVP (1/3)"));
        assert!(text.contains("Repository: /repo"));
        assert!(text.contains("MVP LEVEL"));
        assert!(!text.contains("{guidance}"));
        assert!(!text.contains("{feedback}"));
    }

    #[test]
    fn plan_includes_feedback_and_previous_output() {
        let mut t = task();
        t.current_level = Level::Enhanced;
        t.level_mut(Level::Mvp).output = Some("added the toggle".into());
        t.feedback = Some("keep it in one file".into());
        let text = PromptRegistry::new().plan(&t, Path::new("/repo"));
        assert!(text.contains("PREVIOUS LEVEL OUTPUT:\nadded the toggle"));
        assert!(text.contains("keep it in one file"));
        assert!(text.contains("ENHANCED LEVEL"));
    }

    #[test]
    fn test_prompt_shows_report_shape() {
        let text = PromptRegistry::new().test(&task(), Path::new("/wt"));
        assert!(text.contains("\"test_passed\": true"));
        assert!(text.contains("\"remaining_issues\""));
        assert!(text.contains("Code builds and runs"));
    }

    #[test]
    fn conflict_prompt_inlines_files_and_marker() {
        let files = vec![ConflictedFile {
            path: "src/lib.rs".into(),
            content: "<<<<<<< HEAD\na\n=======\nb\n>>>>>>> x\n".into(),
        }];
        let text = PromptRegistry::new().resolve_conflicts(9, "Fix login", &files);
        assert!(text.contains("--- src/lib.rs ---\n<<<<<<< HEAD"));
        assert!(text.contains(CONFLICTS_RESOLVED_MARKER));
        assert!(text.contains("task #9: Fix login"));
    }

    #[test]
    fn discover_prompt_names_category_and_answer_shape() {
        let text = PromptRegistry::new().discover(DiscoveryCategory::Security, Path::new("/repo"));
        assert!(text.contains("=== DISCOVERY: security ==="));
        assert!(text.contains("Repository: /repo"));
        assert!(text.contains("hardcoded secrets"));
        assert!(text.contains("\"severity\""));
        assert!(!text.contains("{focus}"));
    }
}
