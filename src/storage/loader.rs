//! Batch configuration loading.
//!
//! A batch YAML names its tasks and conditions by relative file reference:
//!
//! ```yaml
//! name: pilot
//! model: sonnet
//! runs_per_condition: 3
//! iteration:
//!   strategy: self-review
//!   max_iterations: 3
//! conditions:
//!   - conditions/baseline.md
//! tasks:
//!   - tasks/demo-1.yaml
//! ```
//!
//! Condition files are text with a YAML frontmatter header; task files are
//! YAML (SWE-bench field aliases accepted) or frontmatter markdown.
//! Any parse error or missing referenced file is fatal at load time.

use std::path::Path;

use serde_yaml::Value;
use tracing::debug;

use crate::model::{
    Batch, Condition, ConditionType, IterationConfig, IterationStrategy, Task,
};

use super::StorageError;

fn referenced_file_error(path: &Path, message: impl Into<String>) -> StorageError {
    StorageError::ReferencedFile {
        path: path.display().to_string(),
        message: message.into(),
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(|v| v.as_str()).map(String::from)
}

fn str_list(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(|v| v.as_sequence())
        .map(|seq| {
            seq.iter()
                .filter_map(|v| v.as_str())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "unnamed".to_string())
}

/// Loads a batch configuration and resolves referenced condition/task files.
pub fn load_batch(batch_path: &Path) -> Result<Batch, StorageError> {
    let content = std::fs::read_to_string(batch_path).map_err(|e| {
        StorageError::BatchConfig(format!("Failed to read {}: {}", batch_path.display(), e))
    })?;
    let data: Value = serde_yaml::from_str(&content)?;

    // Experiment root: the parent of a batches/ or scenarios/ directory,
    // otherwise the batch file's own directory.
    let batch_dir = batch_path.parent().unwrap_or_else(|| Path::new("."));
    let base_dir = match batch_dir.file_name().and_then(|n| n.to_str()) {
        Some("batches") | Some("scenarios") => batch_dir.parent().unwrap_or(batch_dir),
        _ => batch_dir,
    };

    let mut conditions = Vec::new();
    for reference in str_list(&data, "conditions") {
        let path = base_dir.join(&reference);
        conditions.push(load_condition(&path)?);
    }

    let mut tasks = Vec::new();
    for reference in str_list(&data, "tasks") {
        let path = base_dir.join(&reference);
        tasks.push(load_task(&path)?);
    }

    let iteration = parse_iteration(&data)?;

    let runs_per_condition = data
        .get("runs_per_condition")
        .and_then(|v| v.as_u64())
        .unwrap_or(5) as u32;
    if runs_per_condition < 1 {
        return Err(StorageError::BatchConfig(
            "runs_per_condition must be at least 1".to_string(),
        ));
    }

    let batch = Batch {
        name: str_field(&data, "name").unwrap_or_else(|| file_stem(batch_path)),
        tasks,
        conditions,
        runs_per_condition,
        model: str_field(&data, "model").unwrap_or_else(|| "sonnet".to_string()),
        iteration,
        description: str_field(&data, "description").unwrap_or_default(),
        hypothesis: str_field(&data, "hypothesis").unwrap_or_default(),
    };

    debug!(
        batch = %batch.name,
        tasks = batch.tasks.len(),
        conditions = batch.conditions.len(),
        total_runs = batch.total_runs(),
        "Loaded batch configuration"
    );

    Ok(batch)
}

fn parse_iteration(data: &Value) -> Result<IterationConfig, StorageError> {
    let Some(section) = data.get("iteration") else {
        return Ok(IterationConfig::default());
    };

    let strategy = match str_field(section, "strategy") {
        Some(name) => name
            .parse::<IterationStrategy>()
            .map_err(StorageError::BatchConfig)?,
        None => IterationStrategy::None,
    };

    let max_iterations = section
        .get("max_iterations")
        .and_then(|v| v.as_u64())
        .unwrap_or(1) as u32;
    if max_iterations < 1 {
        return Err(StorageError::BatchConfig(
            "iteration.max_iterations must be at least 1".to_string(),
        ));
    }

    let review_prompt = str_field(section, "review_prompt")
        .unwrap_or_else(|| IterationConfig::default().review_prompt);

    Ok(IterationConfig {
        strategy,
        max_iterations,
        review_prompt,
    })
}

/// Splits `---\nfrontmatter\n---\nbody` into (frontmatter, body).
fn split_frontmatter(content: &str) -> Option<(Value, String)> {
    if !content.starts_with("---") {
        return None;
    }
    let mut parts = content.splitn(3, "---");
    parts.next()?; // leading empty segment
    let header = parts.next()?;
    let body = parts.next()?;
    let frontmatter: Value = serde_yaml::from_str(header).ok()?;
    Some((frontmatter, body.trim().to_string()))
}

/// Loads a condition from a text file with a frontmatter header.
pub fn load_condition(path: &Path) -> Result<Condition, StorageError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| referenced_file_error(path, e.to_string()))?;

    let (frontmatter, prompt) = split_frontmatter(&content)
        .unwrap_or_else(|| (Value::Null, content.trim().to_string()));

    let condition_type = match str_field(&frontmatter, "type") {
        Some(name) => name
            .parse::<ConditionType>()
            .map_err(|e| referenced_file_error(path, e))?,
        None => ConditionType::Baseline,
    };

    Ok(Condition {
        name: str_field(&frontmatter, "name").unwrap_or_else(|| file_stem(path)),
        condition_type,
        prompt,
        description: str_field(&frontmatter, "description").unwrap_or_default(),
        style: str_field(&frontmatter, "style"),
    })
}

/// Loads a task from a YAML file or frontmatter markdown.
///
/// Accepts both the native field names and the SWE-bench dataset aliases
/// (`problem_statement`, `hints_text`, `instance_id`).
pub fn load_task(path: &Path) -> Result<Task, StorageError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| referenced_file_error(path, e.to_string()))?;

    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );

    let (data, prompt) = if is_yaml {
        let data: Value =
            serde_yaml::from_str(&content).map_err(|e| referenced_file_error(path, e.to_string()))?;
        let prompt = str_field(&data, "prompt")
            .or_else(|| str_field(&data, "problem_statement"))
            .unwrap_or_default();
        (data, prompt)
    } else {
        match split_frontmatter(&content) {
            Some((frontmatter, body)) => (frontmatter, body),
            None => (Value::Null, content.trim().to_string()),
        }
    };

    let id = str_field(&data, "id")
        .or_else(|| str_field(&data, "instance_id"))
        .unwrap_or_else(|| file_stem(path));
    let hints = str_field(&data, "hints")
        .or_else(|| str_field(&data, "hints_text"))
        .unwrap_or_default();

    Ok(Task {
        id,
        prompt,
        repo: str_field(&data, "repo").unwrap_or_default(),
        base_commit: str_field(&data, "base_commit").unwrap_or_default(),
        fail_to_pass: str_list(&data, "fail_to_pass"),
        pass_to_pass: str_list(&data, "pass_to_pass"),
        difficulty: str_field(&data, "difficulty").unwrap_or_else(|| "medium".to_string()),
        hints,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        path
    }

    fn write_fixture(root: &Path) -> PathBuf {
        write(
            root,
            "conditions/baseline.md",
            "---\nname: baseline\ntype: baseline\ndescription: control\n---\nSolve the task.",
        );
        write(
            root,
            "conditions/mandate.md",
            "---\nname: strict-mandate\ntype: mandate\nstyle: structure\n---\nFollow these exact steps.",
        );
        write(
            root,
            "tasks/demo-1.yaml",
            "id: demo-1\nprompt: Fix the bug\nrepo: acme/widgets\nbase_commit: abc123\nfail_to_pass:\n  - tests/test_a.py::test_x\npass_to_pass:\n  - tests/test_b.py::test_y\ndifficulty: hard\nhints: check bounds\n",
        );
        write(
            root,
            "scenarios/pilot.yaml",
            "name: pilot\nmodel: sonnet\nruns_per_condition: 3\niteration:\n  strategy: self-review\n  max_iterations: 3\n  review_prompt: Review carefully.\nconditions:\n  - conditions/baseline.md\n  - conditions/mandate.md\ntasks:\n  - tasks/demo-1.yaml\n",
        )
    }

    #[test]
    fn test_load_batch_resolves_references() {
        let dir = TempDir::new().unwrap();
        let batch_path = write_fixture(dir.path());

        let batch = load_batch(&batch_path).unwrap();

        assert_eq!(batch.name, "pilot");
        assert_eq!(batch.runs_per_condition, 3);
        assert_eq!(batch.conditions.len(), 2);
        assert_eq!(batch.tasks.len(), 1);
        assert_eq!(batch.total_runs(), 6);

        assert_eq!(batch.iteration.strategy, IterationStrategy::SelfReview);
        assert_eq!(batch.iteration.max_iterations, 3);
        assert_eq!(batch.iteration.review_prompt, "Review carefully.");
    }

    #[test]
    fn test_scenarios_dir_resolves_to_experiment_root() {
        let dir = TempDir::new().unwrap();
        let batch_path = write_fixture(dir.path());

        // References are relative to the experiment root (parent of
        // scenarios/), not the batch file's directory.
        let batch = load_batch(&batch_path).unwrap();
        assert_eq!(batch.conditions[0].name, "baseline");
    }

    #[test]
    fn test_condition_frontmatter() {
        let dir = TempDir::new().unwrap();
        write_fixture(dir.path());

        let condition = load_condition(&dir.path().join("conditions/mandate.md")).unwrap();
        assert_eq!(condition.name, "strict-mandate");
        assert!(condition.is_mandate());
        assert_eq!(condition.style.as_deref(), Some("structure"));
        assert_eq!(condition.prompt, "Follow these exact steps.");
    }

    #[test]
    fn test_condition_without_frontmatter_defaults() {
        let dir = TempDir::new().unwrap();
        let path = write(dir.path(), "bare.md", "Just a prompt body.");

        let condition = load_condition(&path).unwrap();
        assert_eq!(condition.name, "bare");
        assert!(condition.is_baseline());
        assert_eq!(condition.prompt, "Just a prompt body.");
    }

    #[test]
    fn test_task_yaml_fields() {
        let dir = TempDir::new().unwrap();
        write_fixture(dir.path());

        let task = load_task(&dir.path().join("tasks/demo-1.yaml")).unwrap();
        assert_eq!(task.id, "demo-1");
        assert_eq!(task.repo, "acme/widgets");
        assert_eq!(task.fail_to_pass, vec!["tests/test_a.py::test_x".to_string()]);
        assert_eq!(task.difficulty, "hard");
        assert_eq!(task.hints, "check bounds");
    }

    #[test]
    fn test_task_swebench_aliases() {
        let dir = TempDir::new().unwrap();
        let path = write(
            dir.path(),
            "task.yaml",
            "instance_id: astropy__astropy-123\nproblem_statement: Something is wrong\nhints_text: a hint\n",
        );

        let task = load_task(&path).unwrap();
        assert_eq!(task.id, "astropy__astropy-123");
        assert_eq!(task.prompt, "Something is wrong");
        assert_eq!(task.hints, "a hint");
    }

    #[test]
    fn test_task_markdown_frontmatter() {
        let dir = TempDir::new().unwrap();
        let path = write(
            dir.path(),
            "task.md",
            "---\nid: md-task\ndifficulty: easy\n---\nImplement the function.",
        );

        let task = load_task(&path).unwrap();
        assert_eq!(task.id, "md-task");
        assert_eq!(task.prompt, "Implement the function.");
        assert_eq!(task.difficulty, "easy");
    }

    #[test]
    fn test_missing_reference_is_fatal() {
        let dir = TempDir::new().unwrap();
        let batch_path = write(
            dir.path(),
            "batch.yaml",
            "name: broken\nconditions:\n  - conditions/missing.md\ntasks: []\n",
        );

        let result = load_batch(&batch_path);
        assert!(matches!(
            result,
            Err(StorageError::ReferencedFile { .. })
        ));
    }

    #[test]
    fn test_bad_yaml_is_fatal() {
        let dir = TempDir::new().unwrap();
        let batch_path = write(dir.path(), "batch.yaml", "name: [unclosed\n");

        assert!(load_batch(&batch_path).is_err());
    }

    #[test]
    fn test_invalid_strategy_is_fatal() {
        let dir = TempDir::new().unwrap();
        let batch_path = write(
            dir.path(),
            "batch.yaml",
            "name: b\nconditions: []\ntasks: []\niteration:\n  strategy: telepathy\n",
        );

        assert!(matches!(
            load_batch(&batch_path),
            Err(StorageError::BatchConfig(_))
        ));
    }

    #[test]
    fn test_zero_iterations_rejected() {
        let dir = TempDir::new().unwrap();
        let batch_path = write(
            dir.path(),
            "batch.yaml",
            "name: b\nconditions: []\ntasks: []\niteration:\n  strategy: none\n  max_iterations: 0\n",
        );

        assert!(matches!(
            load_batch(&batch_path),
            Err(StorageError::BatchConfig(_))
        ));
    }

    #[test]
    fn test_batch_name_defaults_to_stem() {
        let dir = TempDir::new().unwrap();
        let batch_path = write(dir.path(), "nightly.yaml", "conditions: []\ntasks: []\n");

        let batch = load_batch(&batch_path).unwrap();
        assert_eq!(batch.name, "nightly");
    }
}
