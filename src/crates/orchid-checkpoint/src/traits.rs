//! The [`Checkpointer`] trait: the persistence seam of the engine.
//!
//! The scheduler owns the live state and frontier of a running execution;
//! a `Checkpointer` implementation owns the durable copy. The trait is
//! deliberately small so any storage system (Postgres, SQLite, Redis, an
//! object store) can back it while the in-memory implementation stays the
//! reference for tests and single-process deployments.
//!
//! # Contract
//!
//! - `save` is atomic per super-step: a concurrent `load` observes either
//!   the previous checkpoint or the new one, never a blend.
//! - Saves for one `thread_id` are serialized; saves for different threads
//!   may proceed concurrently.
//! - `step_index` is strictly increasing per thread; implementations must
//!   reject regressions with [`CheckpointError::NonMonotonicStep`].
//! - `load` returns the newest checkpoint for the thread by `step_index`.
//!
//! # Implementing a custom backend
//!
//! ```rust,ignore
//! use orchid_checkpoint::{Checkpoint, Checkpointer, StepRecord, Result};
//! use async_trait::async_trait;
//!
//! struct PostgresCheckpointer { pool: sqlx::PgPool }
//!
//! #[async_trait]
//! impl Checkpointer for PostgresCheckpointer {
//!     async fn save(&self, checkpoint: Checkpoint) -> Result<()> {
//!         // INSERT ... ON CONFLICT (thread_id, step_index) DO NOTHING,
//!         // guarded by an advisory lock on thread_id
//!         todo!()
//!     }
//!
//!     async fn load(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
//!         // SELECT ... ORDER BY step_index DESC LIMIT 1
//!         todo!()
//!     }
//!
//!     async fn append_step(&self, step: StepRecord) -> Result<()> {
//!         todo!()
//!     }
//!
//!     async fn list_steps(&self, execution_id: &str) -> Result<Vec<StepRecord>> {
//!         todo!()
//!     }
//!
//!     async fn delete_thread(&self, thread_id: &str) -> Result<()> {
//!         todo!()
//!     }
//! }
//! ```

use crate::checkpoint::{Checkpoint, StepRecord};
use crate::error::Result;
use async_trait::async_trait;

/// Storage backend for checkpoints and step history.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// Durably write a checkpoint. Atomic per super-step; serialized per
    /// thread; rejects non-monotonic step indices.
    async fn save(&self, checkpoint: Checkpoint) -> Result<()>;

    /// Newest checkpoint for the thread, or `None` if the thread is unknown.
    async fn load(&self, thread_id: &str) -> Result<Option<Checkpoint>>;

    /// Append one node-completion record to the execution's durable history.
    async fn append_step(&self, step: StepRecord) -> Result<()>;

    /// Step history for an execution, ordered by `(step_index, node_id)`.
    async fn list_steps(&self, execution_id: &str) -> Result<Vec<StepRecord>>;

    /// Drop every checkpoint and step record tied to the thread. Called when
    /// the parent execution is deleted.
    async fn delete_thread(&self, thread_id: &str) -> Result<()>;
}
