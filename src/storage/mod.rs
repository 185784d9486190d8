//! Storage port for experiment results.
//!
//! The engine streams results out as they complete and reads them back
//! for resumption and summary rebuilding. Adapters decide where records
//! live; the contract is append-only, durable, and lazily readable.

pub mod loader;
pub mod streaming;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use thiserror::Error;

use crate::model::{Batch, BatchResults, RunIdentity, RunResult};

pub use streaming::StreamingFileAdapter;

/// Errors from storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Failed to read or write the filesystem.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to serialize or deserialize a record.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Failed to parse a YAML configuration file.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The batch configuration is invalid.
    #[error("Batch configuration error: {0}")]
    BatchConfig(String),

    /// A referenced condition or task file could not be loaded.
    #[error("Referenced file error: {path}: {message}")]
    ReferencedFile { path: String, message: String },
}

/// Port for experiment result persistence.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Appends a single result.
    ///
    /// Called after each run completes; must be durable (flushed and
    /// synced) before returning. This is what makes resumption correct.
    async fn append_result(&self, batch_name: &str, result: &RunResult)
        -> Result<(), StorageError>;

    /// Streams results back lazily, in write order. Restartable.
    fn stream_results(
        &self,
        batch_name: &str,
    ) -> BoxStream<'static, Result<RunResult, StorageError>>;

    /// Identities of completed runs, for resumption. Only the identity
    /// set is materialized, never the full results.
    async fn get_completed_runs(
        &self,
        batch_name: &str,
    ) -> Result<HashSet<RunIdentity>, StorageError> {
        let mut completed = HashSet::new();
        let mut stream = self.stream_results(batch_name);
        while let Some(result) = stream.next().await {
            completed.insert(result?.identity());
        }
        Ok(completed)
    }

    /// Saves the final summary. Overwrites; used once at the end.
    async fn save_summary(
        &self,
        batch_name: &str,
        summary: &BatchResults,
    ) -> Result<PathBuf, StorageError>;

    /// Loads a batch configuration, resolving referenced condition and
    /// task files. Errors here are fatal: no partial batch is started.
    fn load_batch(&self, batch_path: &Path) -> Result<Batch, StorageError>;

    /// True when results already exist for the batch.
    fn batch_exists(&self, batch_name: &str) -> bool;
}
