//! condforge: batch experiment execution engine for prompting-condition
//! studies against coding agents.
//!
//! Executes the cross-product of (task x condition x attempt) runs, grades
//! each attempt with subprocess-driven graders, persists results as an
//! append-only stream so a crashed batch resumes without duplicating work,
//! and maintains online statistics per condition.

// Core modules
pub mod agent;
pub mod cli;
pub mod executor;
pub mod grader;
pub mod model;
pub mod prompt;
pub mod stats;
pub mod storage;
pub mod trace;

// Re-export commonly used types
pub use agent::{AgentConfig, AgentError, AgentPort, AgentResponse};
pub use executor::{BatchExecutor, CancelFlag, ExecutorConfig, ExecutorError};
pub use grader::{GradeResult, Grader, GraderError};
pub use model::{Batch, BatchResults, Condition, Run, RunIdentity, RunResult, Task};
pub use stats::{OnlineStatistics, PerConditionStatistics};
pub use storage::{Storage, StorageError, StreamingFileAdapter};
pub use trace::{NoopTracer, Tracer};
