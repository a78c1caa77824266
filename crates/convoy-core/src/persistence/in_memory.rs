use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use crate::models::call_request::CallRequestId;
use crate::models::error::DispatchError;
use crate::models::snapshot::{ArchivedCallSnapshot, QueuedCallSnapshot};
use crate::persistence::{DispatchStore, PersistenceResult};

/// Volatile store for tests and single-process deployments that do not need
/// restart recovery.
#[derive(Default)]
pub struct InMemoryDispatchStore {
    state: Mutex<StoreState>,
}

#[derive(Default)]
struct StoreState {
    queued: BTreeMap<CallRequestId, QueuedCallSnapshot>,
    archived: Vec<ArchivedCallSnapshot>,
}

impl InMemoryDispatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_state(&self) -> PersistenceResult<MutexGuard<'_, StoreState>> {
        self.state
            .lock()
            .map_err(|_| DispatchError::internal("dispatch store mutex poisoned"))
    }
}

impl DispatchStore for InMemoryDispatchStore {
    fn save_queued(&self, snapshot: &QueuedCallSnapshot) -> PersistenceResult<()> {
        let mut state = self.lock_state()?;
        state.queued.insert(snapshot.id, snapshot.clone());
        Ok(())
    }

    fn remove_queued(&self, id: CallRequestId) -> PersistenceResult<()> {
        let mut state = self.lock_state()?;
        state.queued.remove(&id);
        Ok(())
    }

    fn load_queued(&self) -> PersistenceResult<Vec<QueuedCallSnapshot>> {
        let state = self.lock_state()?;
        Ok(state.queued.values().cloned().collect())
    }

    fn save_archived(&self, snapshot: &ArchivedCallSnapshot) -> PersistenceResult<()> {
        let mut state = self.lock_state()?;
        state.archived.push(snapshot.clone());
        Ok(())
    }

    fn list_archived(&self, limit: usize) -> PersistenceResult<Vec<ArchivedCallSnapshot>> {
        let state = self.lock_state()?;
        Ok(state.archived.iter().rev().take(limit).cloned().collect())
    }
}
