pub mod in_memory;

pub use in_memory::InMemoryDispatchStore;

use crate::models::call_request::CallRequestId;
use crate::models::error::DispatchError;
use crate::models::snapshot::{ArchivedCallSnapshot, QueuedCallSnapshot};

pub type PersistenceResult<T> = Result<T, DispatchError>;

/// Durable store behind the task queue: queued-call snapshots so a restart
/// can rebuild the waiting set, and archived-call snapshots for history.
///
/// Implementations are synchronous; the queue hops blocking calls onto a
/// blocking-capable thread itself.
pub trait DispatchStore: Send + Sync {
    /// Insert or replace the snapshot for a queued call. Called at enqueue
    /// time and again when the call starts running.
    fn save_queued(&self, snapshot: &QueuedCallSnapshot) -> PersistenceResult<()>;

    /// Remove a queued-call snapshot. Removing an id that is not present is
    /// not an error.
    fn remove_queued(&self, id: CallRequestId) -> PersistenceResult<()>;

    fn load_queued(&self) -> PersistenceResult<Vec<QueuedCallSnapshot>>;

    fn save_archived(&self, snapshot: &ArchivedCallSnapshot) -> PersistenceResult<()>;

    /// Most recently finished calls first.
    fn list_archived(&self, limit: usize) -> PersistenceResult<Vec<ArchivedCallSnapshot>>;
}

/// Schema bookkeeping for stores that need explicit migration, mirroring the
/// queued/archived table lifecycle.
pub trait MigrationStore: Send + Sync {
    fn current_version(&self) -> PersistenceResult<i64>;

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()>;
}
