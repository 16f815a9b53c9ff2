//! In-memory checkpoint backend.
//!
//! The reference [`Checkpointer`] implementation: suitable for tests,
//! development, and single-process deployments. Checkpoints are stored as
//! serialized blobs: a `save` swaps a fully encoded snapshot in, so a
//! concurrent `load` deserializes either the previous checkpoint or the
//! new one, never a partial write.
//!
//! Retention follows the default policy: every step of the latest
//! execution on a thread is kept; when a new execution begins on the same
//! thread, the older execution's chain is compacted down to its terminal
//! checkpoint.
//!
//! All data is lost on process exit. For durability, implement
//! [`Checkpointer`] over a database and swap it in; the engine does not
//! change.

use crate::checkpoint::{Checkpoint, StepRecord};
use crate::error::{CheckpointError, Result};
use crate::serializer::{JsonSerializer, Serializer};
use crate::traits::Checkpointer;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::sync::{Mutex, RwLock};

/// Checkpoint chain for a single thread.
#[derive(Default)]
struct ThreadChain {
    /// Encoded checkpoints, oldest first.
    entries: Vec<Vec<u8>>,
    /// `(execution_id, step_index)` of the newest entry.
    head: Option<(String, u64)>,
    /// Every execution id that has written to this thread.
    executions: HashSet<String>,
}

/// Thread-safe in-memory checkpoint storage.
pub struct MemoryCheckpointer<S: Serializer = JsonSerializer> {
    serializer: S,
    threads: RwLock<HashMap<String, ThreadChain>>,
    steps: RwLock<HashMap<String, Vec<StepRecord>>>,
    /// Per-thread save locks; saves for one thread are serialized, saves
    /// for different threads proceed concurrently.
    write_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MemoryCheckpointer {
    pub fn new() -> Self {
        Self::with_serializer(JsonSerializer)
    }
}

impl Default for MemoryCheckpointer {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Serializer> MemoryCheckpointer<S> {
    pub fn with_serializer(serializer: S) -> Self {
        Self {
            serializer,
            threads: RwLock::new(HashMap::new()),
            steps: RwLock::new(HashMap::new()),
            write_locks: StdMutex::new(HashMap::new()),
        }
    }

    fn thread_lock(&self, thread_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.write_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(thread_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Number of distinct threads with at least one checkpoint.
    pub async fn thread_count(&self) -> usize {
        self.threads.read().await.len()
    }

    /// Total number of stored checkpoints across all threads.
    pub async fn checkpoint_count(&self) -> usize {
        self.threads
            .read()
            .await
            .values()
            .map(|chain| chain.entries.len())
            .sum()
    }

    /// Drop everything. Intended for test isolation.
    pub async fn clear(&self) {
        self.threads.write().await.clear();
        self.steps.write().await.clear();
        self.write_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[async_trait]
impl<S: Serializer> Checkpointer for MemoryCheckpointer<S> {
    async fn save(&self, checkpoint: Checkpoint) -> Result<()> {
        let lock = self.thread_lock(&checkpoint.thread_id);
        let _guard = lock.lock().await;

        // Encode outside the map lock; the swap below is the atomic part.
        let encoded = self.serializer.to_bytes(&checkpoint)?;

        let mut threads = self.threads.write().await;
        let chain = threads.entry(checkpoint.thread_id.clone()).or_default();

        match &chain.head {
            Some((exec, step)) if *exec == checkpoint.execution_id => {
                if checkpoint.step_index <= *step {
                    return Err(CheckpointError::NonMonotonicStep {
                        thread_id: checkpoint.thread_id.clone(),
                        existing: *step,
                        attempted: checkpoint.step_index,
                    });
                }
            }
            Some(_) => {
                // New execution on an existing thread: retain only the
                // terminal checkpoint of the previous execution.
                if chain.entries.len() > 1 {
                    chain.entries.drain(..chain.entries.len() - 1);
                }
            }
            None => {}
        }

        tracing::debug!(
            thread_id = %checkpoint.thread_id,
            step_index = checkpoint.step_index,
            "checkpoint saved"
        );

        chain.head = Some((checkpoint.execution_id.clone(), checkpoint.step_index));
        chain.executions.insert(checkpoint.execution_id.clone());
        chain.entries.push(encoded);
        Ok(())
    }

    async fn load(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        let threads = self.threads.read().await;
        match threads.get(thread_id).and_then(|c| c.entries.last()) {
            Some(bytes) => Ok(Some(self.serializer.from_bytes(bytes)?)),
            None => Ok(None),
        }
    }

    async fn append_step(&self, step: StepRecord) -> Result<()> {
        let mut steps = self.steps.write().await;
        steps
            .entry(step.execution_id.clone())
            .or_default()
            .push(step);
        Ok(())
    }

    async fn list_steps(&self, execution_id: &str) -> Result<Vec<StepRecord>> {
        let steps = self.steps.read().await;
        let mut records = steps.get(execution_id).cloned().unwrap_or_default();
        records.sort_by(|a, b| {
            a.step_index
                .cmp(&b.step_index)
                .then_with(|| a.node_id.cmp(&b.node_id))
        });
        Ok(records)
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let chain = self.threads.write().await.remove(thread_id);
        if let Some(chain) = chain {
            let mut steps = self.steps.write().await;
            for execution_id in &chain.executions {
                steps.remove(execution_id);
            }
        }
        self.write_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(thread_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::ExecutionStatus;
    use serde_json::json;

    fn checkpoint(thread: &str, exec: &str, step: u64) -> Checkpoint {
        Checkpoint::new(thread, exec, json!({"step": step})).with_step_index(step)
    }

    #[tokio::test]
    async fn load_returns_newest() {
        let saver = MemoryCheckpointer::new();
        saver.save(checkpoint("t1", "e1", 0)).await.unwrap();
        saver.save(checkpoint("t1", "e1", 1)).await.unwrap();
        saver.save(checkpoint("t1", "e1", 2)).await.unwrap();

        let loaded = saver.load("t1").await.unwrap().unwrap();
        assert_eq!(loaded.step_index, 2);
        assert_eq!(saver.checkpoint_count().await, 3);
    }

    #[tokio::test]
    async fn rejects_step_regression() {
        let saver = MemoryCheckpointer::new();
        saver.save(checkpoint("t1", "e1", 5)).await.unwrap();

        let err = saver.save(checkpoint("t1", "e1", 5)).await.unwrap_err();
        assert!(matches!(err, CheckpointError::NonMonotonicStep { .. }));
    }

    #[tokio::test]
    async fn new_execution_compacts_previous_chain() {
        let saver = MemoryCheckpointer::new();
        saver.save(checkpoint("t1", "e1", 0)).await.unwrap();
        saver.save(checkpoint("t1", "e1", 1)).await.unwrap();

        // A second execution on the same thread keeps only e1's terminal
        // checkpoint plus its own chain.
        saver.save(checkpoint("t1", "e2", 2)).await.unwrap();
        assert_eq!(saver.checkpoint_count().await, 2);

        let loaded = saver.load("t1").await.unwrap().unwrap();
        assert_eq!(loaded.execution_id, "e2");
    }

    #[tokio::test]
    async fn unknown_thread_loads_none() {
        let saver = MemoryCheckpointer::new();
        assert!(saver.load("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn saves_for_different_threads_are_independent() {
        let saver = Arc::new(MemoryCheckpointer::new());
        let mut handles = Vec::new();
        for thread in ["a", "b", "c", "d"] {
            let saver = saver.clone();
            handles.push(tokio::spawn(async move {
                for step in 0..10u64 {
                    saver
                        .save(checkpoint(thread, &format!("e-{thread}"), step))
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(saver.thread_count().await, 4);
        assert_eq!(saver.checkpoint_count().await, 40);
    }

    #[tokio::test]
    async fn step_history_sorted_by_index_then_node() {
        let saver = MemoryCheckpointer::new();
        saver
            .append_step(StepRecord::begin("e1", 1, "b", json!({})))
            .await
            .unwrap();
        saver
            .append_step(StepRecord::begin("e1", 1, "a", json!({})))
            .await
            .unwrap();
        saver
            .append_step(StepRecord::begin("e1", 0, "start", json!({})))
            .await
            .unwrap();

        let steps = saver.list_steps("e1").await.unwrap();
        let order: Vec<_> = steps.iter().map(|s| s.node_id.as_str()).collect();
        assert_eq!(order, vec!["start", "a", "b"]);
    }

    #[tokio::test]
    async fn delete_thread_removes_steps_too() {
        let saver = MemoryCheckpointer::new();
        let mut cp = checkpoint("t1", "e1", 0);
        cp.status = ExecutionStatus::AwaitingInput;
        saver.save(cp).await.unwrap();
        saver
            .append_step(StepRecord::begin("e1", 0, "n", json!({})))
            .await
            .unwrap();

        saver.delete_thread("t1").await.unwrap();
        assert!(saver.load("t1").await.unwrap().is_none());
        assert!(saver.list_steps("e1").await.unwrap().is_empty());
    }
}
