//! Online statistics for streaming experiments.
//!
//! Uses Welford's algorithm for running mean/variance of token usage.
//! O(1) memory regardless of the number of results, and mergeable via
//! Chan's parallel combination so partial aggregates from a future worker
//! pool can be combined without replaying raw data.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::model::RunResult;

/// Welford-style running mean/variance plus accumulated totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OnlineStatistics {
    /// Number of results observed.
    pub n: u64,
    /// Running mean of total tokens per run.
    pub mean_tokens: f64,
    /// Sum of squared deviations from the running mean.
    pub m2_tokens: f64,

    pub passed: u64,
    pub failed: u64,

    pub total_tokens: u64,
    pub total_iterations: u64,
    pub total_duration_ms: u64,
}

impl OnlineStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Updates statistics with one result.
    pub fn update(&mut self, result: &RunResult) {
        self.n += 1;

        if result.passed {
            self.passed += 1;
        } else {
            self.failed += 1;
        }

        let tokens = result.total_tokens();
        self.total_tokens += tokens;
        self.total_iterations += result.iterations_used as u64;
        self.total_duration_ms += result.duration_ms;

        // Welford's online update for mean and variance.
        let x = tokens as f64;
        let delta = x - self.mean_tokens;
        self.mean_tokens += delta / self.n as f64;
        let delta2 = x - self.mean_tokens;
        self.m2_tokens += delta * delta2;
    }

    /// Proportion of runs that passed.
    pub fn pass_rate(&self) -> f64 {
        if self.n > 0 {
            self.passed as f64 / self.n as f64
        } else {
            0.0
        }
    }

    /// Proportion of runs that failed.
    pub fn fail_rate(&self) -> f64 {
        if self.n > 0 {
            self.failed as f64 / self.n as f64
        } else {
            0.0
        }
    }

    /// Mean tokens per run.
    pub fn avg_tokens(&self) -> f64 {
        self.mean_tokens
    }

    /// Sample variance of tokens (Bessel's correction); 0 for n < 2.
    pub fn var_tokens(&self) -> f64 {
        if self.n < 2 {
            0.0
        } else {
            self.m2_tokens / (self.n - 1) as f64
        }
    }

    /// Sample standard deviation of tokens.
    pub fn std_tokens(&self) -> f64 {
        self.var_tokens().sqrt()
    }

    /// Mean iterations per run.
    pub fn avg_iterations(&self) -> f64 {
        if self.n > 0 {
            self.total_iterations as f64 / self.n as f64
        } else {
            0.0
        }
    }

    /// Mean duration per run in milliseconds.
    pub fn avg_duration_ms(&self) -> f64 {
        if self.n > 0 {
            self.total_duration_ms as f64 / self.n as f64
        } else {
            0.0
        }
    }

    /// Merges two independently accumulated instances without replay.
    ///
    /// Chan's parallel combination: associative and equivalent (within
    /// floating-point tolerance) to ingesting all observations into a
    /// single instance in any order.
    pub fn merge(&self, other: &OnlineStatistics) -> OnlineStatistics {
        if self.n == 0 {
            return other.clone();
        }
        if other.n == 0 {
            return self.clone();
        }

        let n = self.n + other.n;
        let delta = other.mean_tokens - self.mean_tokens;
        let mean_tokens = self.mean_tokens + delta * other.n as f64 / n as f64;
        let m2_tokens = self.m2_tokens
            + other.m2_tokens
            + delta * delta * (self.n as f64 * other.n as f64) / n as f64;

        OnlineStatistics {
            n,
            mean_tokens,
            m2_tokens,
            passed: self.passed + other.passed,
            failed: self.failed + other.failed,
            total_tokens: self.total_tokens + other.total_tokens,
            total_iterations: self.total_iterations + other.total_iterations,
            total_duration_ms: self.total_duration_ms + other.total_duration_ms,
        }
    }
}

/// Per-condition statistics: one `OnlineStatistics` per condition name,
/// plus an overall aggregate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerConditionStatistics {
    pub by_condition: HashMap<String, OnlineStatistics>,
    pub overall: OnlineStatistics,
}

impl PerConditionStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, result: &RunResult) {
        self.by_condition
            .entry(result.condition_name.clone())
            .or_default()
            .update(result);
        self.overall.update(result);
    }

    /// Statistics for a specific condition; empty statistics if unseen.
    pub fn condition(&self, name: &str) -> OnlineStatistics {
        self.by_condition.get(name).cloned().unwrap_or_default()
    }
}

/// Per-task statistics, useful for spotting which tasks are harder.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskStatistics {
    pub by_task: HashMap<String, OnlineStatistics>,
}

impl TaskStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, result: &RunResult) {
        self.by_task
            .entry(result.task_id.clone())
            .or_default()
            .update(result);
    }

    /// The n tasks with the lowest pass rates.
    pub fn hardest_tasks(&self, n: usize) -> Vec<(String, f64)> {
        let mut tasks: Vec<(String, f64)> = self
            .by_task
            .iter()
            .filter(|(_, stats)| stats.n > 0)
            .map(|(id, stats)| (id.clone(), stats.pass_rate()))
            .collect();
        tasks.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        tasks.truncate(n);
        tasks
    }

    /// The n tasks with the highest pass rates.
    pub fn easiest_tasks(&self, n: usize) -> Vec<(String, f64)> {
        let mut tasks: Vec<(String, f64)> = self
            .by_task
            .iter()
            .filter(|(_, stats)| stats.n > 0)
            .map(|(id, stats)| (id.clone(), stats.pass_rate()))
            .collect();
        tasks.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        tasks.truncate(n);
        tasks
    }
}
