//! # orchid-checkpoint: durable pause/resume for graph executions
//!
//! Checkpoint abstractions for the orchid engine: the data model for
//! per-super-step snapshots, the [`Checkpointer`] storage trait, and an
//! in-memory reference backend.
//!
//! ## Model
//!
//! After every completed super-step the scheduler writes a [`Checkpoint`]:
//! the merged state, the frontier of node ids eligible for the next
//! super-step, and the join ledger of partially satisfied fan-ins. That
//! triple is the *entire* resume context: resuming an execution after an
//! arbitrary pause (for example, waiting for a user to confirm a plan)
//! reconstructs the scheduler from it and nothing else.
//!
//! Alongside checkpoints, one [`StepRecord`] per node completion forms the
//! durable execution history: input snapshot, output delta, observed
//! events, and any error.
//!
//! ## Guarantees
//!
//! - **Atomicity**: a save is visible all-or-nothing; readers never see a
//!   partially written state.
//! - **Monotonicity**: `step_index` strictly increases per thread; the
//!   backend rejects regressions.
//! - **Thread isolation**: checkpoint chains are keyed by `thread_id`;
//!   saves on one thread serialize, saves across threads run concurrently.
//!
//! ## Example
//!
//! ```rust
//! use orchid_checkpoint::{Checkpoint, Checkpointer, MemoryCheckpointer};
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), orchid_checkpoint::CheckpointError> {
//! let saver = MemoryCheckpointer::new();
//!
//! let checkpoint = Checkpoint::new("thread-1", "exec-1", json!({"count": 1}))
//!     .with_frontier(vec!["summarize".into()]);
//! saver.save(checkpoint).await?;
//!
//! let restored = saver.load("thread-1").await?.unwrap();
//! assert_eq!(restored.frontier, vec!["summarize".to_string()]);
//! # Ok(())
//! # }
//! ```

pub mod checkpoint;
pub mod error;
pub mod memory;
pub mod serializer;
pub mod traits;

pub use checkpoint::{
    Checkpoint, ExecutionStatus, JoinLedgerState, JoinProgress, StepError, StepRecord,
};
pub use error::{CheckpointError, Result};
pub use memory::MemoryCheckpointer;
pub use serializer::{BincodeSerializer, JsonSerializer, Serializer};
pub use traits::Checkpointer;
