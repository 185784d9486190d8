//! Prompt assembly for experiment runs.
//!
//! The condition prompt becomes the agent's system prompt (framing); these
//! builders produce the user-facing prompts: the task statement, the
//! self-review follow-up, and the file-persistence iteration prompt.

use std::path::Path;

use crate::model::Task;

/// Builds the task prompt (the user message).
pub fn build_task_prompt(task: &Task) -> String {
    let mut parts = Vec::new();

    parts.push("## Issue to Resolve\n".to_string());

    if !task.repo.is_empty() {
        parts.push(format!("**Repository:** {}\n", task.repo));
    }

    parts.push(format!("**Issue ID:** {}\n", task.id));
    parts.push(String::new());
    parts.push(task.prompt.clone());

    if !task.hints.is_empty() {
        parts.push("\n\n## Additional Context\n".to_string());
        parts.push(task.hints.clone());
    }

    parts.join("")
}

/// Builds the self-review follow-up, embedding the previous candidate so a
/// stateless agent adapter still sees the conversational context.
pub fn build_review_prompt(previous: &str, review_prompt: &str) -> String {
    format!(
        "Previous solution:\n{previous}\n\n{review_prompt}\n\n\
         If improvements are needed, provide the improved solution.\n\
         If the solution is correct, respond with \"SOLUTION VERIFIED\"."
    )
}

/// Builds the prompt for one file-persistence iteration.
///
/// Each iteration is a fresh agent session; continuity comes from the
/// solution file on disk and the harness-supplied test feedback, not from
/// conversation history.
pub fn build_file_iteration_prompt(task: &Task, solution_file: &Path, feedback: &str) -> String {
    let mut prompt = format!(
        "{}\n\nWrite your solution to: {}\n\n\
         If the file already exists, read it first to see your previous attempt, then improve it.\n",
        build_task_prompt(task),
        solution_file.display()
    );

    if !feedback.is_empty() {
        prompt.push_str(&format!(
            "\n## Test Results From Your Previous Attempt\n\n{}\n",
            feedback
        ));
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn make_task() -> Task {
        Task {
            id: "demo-1".to_string(),
            prompt: "Fix the off-by-one error.".to_string(),
            repo: "acme/widgets".to_string(),
            base_commit: "abc123".to_string(),
            fail_to_pass: Vec::new(),
            pass_to_pass: Vec::new(),
            difficulty: "easy".to_string(),
            hints: "Look at the loop bounds.".to_string(),
        }
    }

    #[test]
    fn test_task_prompt_sections() {
        let prompt = build_task_prompt(&make_task());
        assert!(prompt.contains("## Issue to Resolve"));
        assert!(prompt.contains("**Repository:** acme/widgets"));
        assert!(prompt.contains("**Issue ID:** demo-1"));
        assert!(prompt.contains("Fix the off-by-one error."));
        assert!(prompt.contains("## Additional Context"));
        assert!(prompt.contains("Look at the loop bounds."));
    }

    #[test]
    fn test_task_prompt_omits_empty_sections() {
        let mut task = make_task();
        task.repo = String::new();
        task.hints = String::new();

        let prompt = build_task_prompt(&task);
        assert!(!prompt.contains("**Repository:**"));
        assert!(!prompt.contains("## Additional Context"));
    }

    #[test]
    fn test_review_prompt_embeds_previous() {
        let prompt = build_review_prompt("def f(): pass", "Check edge cases.");
        assert!(prompt.contains("def f(): pass"));
        assert!(prompt.contains("Check edge cases."));
        assert!(prompt.contains("SOLUTION VERIFIED"));
    }

    #[test]
    fn test_file_iteration_prompt_feedback() {
        let file = PathBuf::from("/tmp/work/solution.py");

        let without = build_file_iteration_prompt(&make_task(), &file, "");
        assert!(without.contains("solution.py"));
        assert!(!without.contains("Test Results"));

        let with = build_file_iteration_prompt(&make_task(), &file, "2 tests failed");
        assert!(with.contains("Test Results From Your Previous Attempt"));
        assert!(with.contains("2 tests failed"));
    }
}
