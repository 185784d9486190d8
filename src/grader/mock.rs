//! Mock grader for testing the harness without real evaluation.

use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use regex::Regex;

use crate::model::Task;

use super::{GradeResult, Grader, GraderError};

/// How the mock grader decides pass/fail.
pub enum MockStrategy {
    /// All solutions pass.
    AlwaysPass,
    /// All solutions fail.
    AlwaysFail,
    /// Random pass/fail with the given pass rate.
    Random(f64),
    /// Pass if the solution matches the pattern.
    Pattern(Regex),
}

/// Configurable grader for tests and `--mock` runs.
pub struct MockGrader {
    strategy: MockStrategy,
    /// Number of grade calls made, for assertions in tests.
    grades: Mutex<u64>,
}

impl MockGrader {
    pub fn new(strategy: MockStrategy) -> Self {
        Self {
            strategy,
            grades: Mutex::new(0),
        }
    }

    pub fn always_pass() -> Self {
        Self::new(MockStrategy::AlwaysPass)
    }

    pub fn always_fail() -> Self {
        Self::new(MockStrategy::AlwaysFail)
    }

    pub fn random(pass_rate: f64) -> Self {
        Self::new(MockStrategy::Random(pass_rate))
    }

    /// Passes solutions matching the pattern.
    pub fn pattern(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self::new(MockStrategy::Pattern(Regex::new(pattern)?)))
    }

    pub fn grade_calls(&self) -> u64 {
        *self.grades.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Grader for MockGrader {
    async fn setup(&self, _task: &Task) -> Result<Option<PathBuf>, GraderError> {
        Ok(None)
    }

    async fn grade(&self, solution: &str, _task: &Task) -> GradeResult {
        *self.grades.lock().unwrap_or_else(|e| e.into_inner()) += 1;

        let (passed, message) = match &self.strategy {
            MockStrategy::AlwaysPass => (true, "mock grader: always_pass".to_string()),
            MockStrategy::AlwaysFail => (false, "mock grader: always_fail".to_string()),
            MockStrategy::Random(rate) => {
                let passed = rand::random::<f64>() < *rate;
                (passed, format!("mock grader: random (rate={})", rate))
            }
            MockStrategy::Pattern(pattern) => {
                let passed = pattern.is_match(solution);
                (passed, format!("mock grader: pattern ({})", pattern.as_str()))
            }
        };

        GradeResult {
            passed,
            score: Some(if passed { 1.0 } else { 0.0 }),
            message,
            ..Default::default()
        }
    }

    async fn teardown(&self, _task: &Task) {}
}
