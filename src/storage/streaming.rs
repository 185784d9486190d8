//! Streaming file adapter: JSONL results + JSON summaries.
//!
//! File layout:
//!
//! ```text
//! results/
//!     {batch_name}/
//!         results.jsonl    # append-only run results, one per line
//!         summary.json     # final aggregated summary
//! ```
//!
//! Each appended record is flushed and synced before the call returns, so
//! a crashed batch can resume from exactly what is on disk.

use std::path::{Path, PathBuf};

use async_stream::try_stream;
use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

use crate::model::{Batch, BatchResults, RunResult};

use super::{loader, Storage, StorageError};

/// Storage adapter using JSONL for streaming results.
pub struct StreamingFileAdapter {
    results_dir: PathBuf,
}

impl StreamingFileAdapter {
    /// Creates an adapter rooted at the given results directory.
    pub fn new(results_dir: impl Into<PathBuf>) -> Self {
        Self {
            results_dir: results_dir.into(),
        }
    }

    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    fn batch_dir(&self, batch_name: &str) -> PathBuf {
        self.results_dir.join(batch_name)
    }

    /// Path of the append-only results file for a batch.
    pub fn results_path(&self, batch_name: &str) -> PathBuf {
        self.batch_dir(batch_name).join("results.jsonl")
    }

    /// Path of the summary file for a batch.
    pub fn summary_path(&self, batch_name: &str) -> PathBuf {
        self.batch_dir(batch_name).join("summary.json")
    }
}

#[async_trait]
impl Storage for StreamingFileAdapter {
    async fn append_result(
        &self,
        batch_name: &str,
        result: &RunResult,
    ) -> Result<(), StorageError> {
        let batch_dir = self.batch_dir(batch_name);
        fs::create_dir_all(&batch_dir).await?;

        let mut line = serde_json::to_string(result)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.results_path(batch_name))
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        // One sync per record: durability over throughput, crash-safe
        // resumption depends on it.
        file.sync_all().await?;

        debug!(batch = %batch_name, run = %result.identity(), "Appended result");
        Ok(())
    }

    fn stream_results(
        &self,
        batch_name: &str,
    ) -> BoxStream<'static, Result<RunResult, StorageError>> {
        let path = self.results_path(batch_name);

        Box::pin(try_stream! {
            // A batch with no results yet streams nothing.
            if path.exists() {
                let file = fs::File::open(&path).await?;
                let mut lines = BufReader::new(file).lines();

                while let Some(line) = lines.next_line().await? {
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let result: RunResult = serde_json::from_str(line)?;
                    yield result;
                }
            }
        })
    }

    async fn save_summary(
        &self,
        batch_name: &str,
        summary: &BatchResults,
    ) -> Result<PathBuf, StorageError> {
        let batch_dir = self.batch_dir(batch_name);
        fs::create_dir_all(&batch_dir).await?;

        let path = self.summary_path(batch_name);
        let json = serde_json::to_string_pretty(summary)?;

        let mut file = fs::File::create(&path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        Ok(path)
    }

    fn load_batch(&self, batch_path: &Path) -> Result<Batch, StorageError> {
        loader::load_batch(batch_path)
    }

    fn batch_exists(&self, batch_name: &str) -> bool {
        self.results_path(batch_name).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RunIdentity;
    use chrono::Utc;
    use futures::StreamExt;
    use tempfile::TempDir;

    fn make_result(task: &str, attempt: u32, passed: bool) -> RunResult {
        RunResult {
            task_id: task.to_string(),
            condition_name: "baseline".to_string(),
            attempt,
            passed,
            score: Some(if passed { 1.0 } else { 0.0 }),
            iterations_used: 1,
            tokens_input: 120,
            tokens_output: 30,
            duration_ms: 900,
            error: None,
            trace_id: None,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    #[tokio::test]
    async fn test_append_and_stream_in_order() {
        let dir = TempDir::new().unwrap();
        let storage = StreamingFileAdapter::new(dir.path());

        for attempt in 1..=3 {
            storage
                .append_result("batch", &make_result("t1", attempt, true))
                .await
                .unwrap();
        }

        let results: Vec<RunResult> = storage
            .stream_results("batch")
            .map(|r| r.unwrap())
            .collect()
            .await;

        assert_eq!(results.len(), 3);
        let attempts: Vec<u32> = results.iter().map(|r| r.attempt).collect();
        assert_eq!(attempts, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_stream_missing_batch_is_empty() {
        let dir = TempDir::new().unwrap();
        let storage = StreamingFileAdapter::new(dir.path());

        let count = storage.stream_results("nope").count().await;
        assert_eq!(count, 0);
        assert!(!storage.batch_exists("nope"));
    }

    #[tokio::test]
    async fn test_one_line_per_result() {
        let dir = TempDir::new().unwrap();
        let storage = StreamingFileAdapter::new(dir.path());

        storage
            .append_result("batch", &make_result("t1", 1, true))
            .await
            .unwrap();
        storage
            .append_result("batch", &make_result("t1", 2, false))
            .await
            .unwrap();

        let content = std::fs::read_to_string(storage.results_path("batch")).unwrap();
        assert_eq!(content.lines().count(), 2);
        for line in content.lines() {
            let _: RunResult = serde_json::from_str(line).unwrap();
        }
    }

    #[tokio::test]
    async fn test_get_completed_runs() {
        let dir = TempDir::new().unwrap();
        let storage = StreamingFileAdapter::new(dir.path());

        storage
            .append_result("batch", &make_result("t1", 1, true))
            .await
            .unwrap();
        storage
            .append_result("batch", &make_result("t2", 1, false))
            .await
            .unwrap();

        let completed = storage.get_completed_runs("batch").await.unwrap();
        assert_eq!(completed.len(), 2);
        assert!(completed.contains(&RunIdentity {
            task_id: "t1".to_string(),
            condition_name: "baseline".to_string(),
            attempt: 1,
        }));
        // Failed runs still count as completed: they have a result.
        assert!(completed.contains(&RunIdentity {
            task_id: "t2".to_string(),
            condition_name: "baseline".to_string(),
            attempt: 1,
        }));
    }

    #[tokio::test]
    async fn test_corrupt_line_surfaces_error() {
        let dir = TempDir::new().unwrap();
        let storage = StreamingFileAdapter::new(dir.path());

        storage
            .append_result("batch", &make_result("t1", 1, true))
            .await
            .unwrap();
        let path = storage.results_path("batch");
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{not json\n");
        std::fs::write(&path, content).unwrap();

        let results: Vec<Result<RunResult, StorageError>> =
            storage.stream_results("batch").collect().await;
        assert_eq!(results.len(), 2);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
    }

    #[tokio::test]
    async fn test_save_summary_overwrites() {
        let dir = TempDir::new().unwrap();
        let storage = StreamingFileAdapter::new(dir.path());

        let mut summary = BatchResults::new("batch");
        summary.add_result(&make_result("t1", 1, true));

        let path = storage.save_summary("batch", &summary).await.unwrap();
        assert!(path.exists());

        summary.add_result(&make_result("t1", 2, false));
        storage.save_summary("batch", &summary).await.unwrap();

        let loaded: BatchResults =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(loaded.completed_runs, 2);
        assert_eq!(loaded.passed_runs, 1);
        assert_eq!(loaded.batch_name, "batch");
    }

    #[tokio::test]
    async fn test_summary_roundtrip_by_condition() {
        let dir = TempDir::new().unwrap();
        let storage = StreamingFileAdapter::new(dir.path());

        let mut summary = BatchResults::new("batch");
        summary.add_result(&make_result("t1", 1, true));
        storage.save_summary("batch", &summary).await.unwrap();

        let loaded: BatchResults = serde_json::from_str(
            &std::fs::read_to_string(storage.summary_path("batch")).unwrap(),
        )
        .unwrap();
        let condition = &loaded.by_condition["baseline"];
        assert_eq!(condition.total_runs, 1);
        assert_eq!(condition.total_tokens, 150);
    }
}
