use std::path::{Component, Path};

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("plan is empty")]
    Empty,
    #[error("plan summary: {0}")]
    Invalid(String),
}

/// Structured summary a plan may embed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanSummary {
    pub description: String,
    pub files_to_modify: Vec<String>,
    pub dependencies: Vec<Value>,
}

/// Check a plan before execution. Plans are free-form text; when one carries
/// a JSON object with a `files_to_modify` key (bare or in a ```json fence),
/// that summary is validated against `repo` and returned.
pub fn validate_plan(plan: &str, repo: &Path) -> Result<Option<PlanSummary>, PlanError> {
    if plan.trim().is_empty() {
        return Err(PlanError::Empty);
    }
    let Some(obj) = find_summary(plan) else {
        return Ok(None);
    };

    let description = match obj.get("description") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
        Some(Value::String(_)) | None => {
            return Err(PlanError::Invalid("description is empty".into()))
        }
        Some(_) => return Err(PlanError::Invalid("description must be a string".into())),
    };

    let files = match obj.get("files_to_modify") {
        Some(Value::Array(items)) => items,
        _ => return Err(PlanError::Invalid("files_to_modify must be a list".into())),
    };
    let mut files_to_modify = Vec::with_capacity(files.len());
    for item in files {
        let Value::String(path) = item else {
            return Err(PlanError::Invalid(format!("file path must be a string: {item}")));
        };
        check_path(path, repo)?;
        files_to_modify.push(path.clone());
    }

    let dependencies = match obj.get("dependencies") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(deps)) => deps.clone(),
        Some(_) => return Err(PlanError::Invalid("dependencies must be a list".into())),
    };

    Ok(Some(PlanSummary {
        description,
        files_to_modify,
        dependencies,
    }))
}

fn check_path(raw: &str, repo: &Path) -> Result<(), PlanError> {
    let path = Path::new(raw);
    if path.components().any(|c| c == Component::ParentDir) {
        return Err(PlanError::Invalid(format!("path traversal detected: {raw}")));
    }
    if path.is_absolute() && !path.starts_with(repo) {
        return Err(PlanError::Invalid(format!("file path outside repository: {raw}")));
    }
    Ok(())
}

fn find_summary(plan: &str) -> Option<serde_json::Map<String, Value>> {
    let mut candidates = Vec::new();
    let mut rest = plan;
    while let Some(start) = rest.find("```json") {
        let body = &rest[start + "```json".len()..];
        let Some(end) = body.find("```") else { break };
        candidates.push(body[..end].trim());
        rest = &body[end + 3..];
    }
    if let (Some(start), Some(end)) = (plan.find('{'), plan.rfind('}')) {
        if start < end {
            candidates.push(&plan[start..=end]);
        }
    }

    candidates.into_iter().find_map(|c| match serde_json::from_str::<Value>(c) {
        Ok(Value::Object(obj)) if obj.contains_key("files_to_modify") => Some(obj),
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn repo() -> &'static Path {
        Path::new("/work/repo")
    }

    #[test]
    fn free_text_plan_is_accepted() {
        assert_eq!(validate_plan("1. Add a flag\n2. Wire it up", repo()), Ok(None));
    }

    #[test]
    fn empty_plan_is_rejected() {
        assert_eq!(validate_plan("   \n", repo()), Err(PlanError::Empty));
    }

    #[test]
    fn fenced_summary_is_validated() {
        let plan = "Plan:\n```json\n{\"description\": \"add cache\", \"files_to_modify\": [\"src/cache.rs\"], \"dependencies\": [\"lru\"]}\n```";
        let summary = validate_plan(plan, repo()).unwrap().unwrap();
        assert_eq!(summary.files_to_modify, vec!["src/cache.rs".to_string()]);
        assert_eq!(summary.dependencies.len(), 1);
    }

    #[test]
    fn traversal_is_rejected() {
        let plan = r#"{"description": "x", "files_to_modify": ["src/../../etc/passwd"]}"#;
        assert!(matches!(validate_plan(plan, repo()), Err(PlanError::Invalid(_))));
    }

    #[test]
    fn absolute_path_outside_repo_is_rejected() {
        let plan = r#"{"description": "x", "files_to_modify": ["/etc/hosts"]}"#;
        assert!(matches!(validate_plan(plan, repo()), Err(PlanError::Invalid(_))));

        let inside = r#"{"description": "x", "files_to_modify": ["/work/repo/src/a.rs"]}"#;
        assert!(validate_plan(inside, repo()).is_ok());
    }

    #[test]
    fn malformed_fields_are_rejected() {
        let no_desc = r#"{"description": "", "files_to_modify": []}"#;
        assert!(validate_plan(no_desc, repo()).is_err());

        let bad_files = r#"{"description": "x", "files_to_modify": "src/a.rs"}"#;
        assert!(validate_plan(bad_files, repo()).is_err());

        let bad_deps = r#"{"description": "x", "files_to_modify": [], "dependencies": "serde"}"#;
        assert!(validate_plan(bad_deps, repo()).is_err());
    }
}
