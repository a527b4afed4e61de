use std::{collections::HashMap, sync::Arc};

use appforge_process::ProjectId;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One mutex per tracked project. Lifecycle calls, single-project status
/// refreshes and reconcile passes all write status under it.
///
/// Callers only take a lock for an id they have already found in the
/// registry, so the table is bounded by the number of tracked projects.
#[derive(Clone, Default)]
pub struct ProjectLocks {
    table: Arc<Mutex<HashMap<ProjectId, Arc<Mutex<()>>>>>,
}

impl std::fmt::Debug for ProjectLocks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectLocks").finish_non_exhaustive()
    }
}

impl ProjectLocks {
    pub async fn acquire(&self, id: &ProjectId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut table = self.table.lock().await;
            table.entry(id.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Take every lock in `ids` in ascending order. Any two holders of
    /// several locks agree on the order, so they cannot deadlock.
    pub async fn acquire_all<'a>(
        &self,
        ids: impl IntoIterator<Item = &'a ProjectId>,
    ) -> Vec<OwnedMutexGuard<()>> {
        let mut ids: Vec<&ProjectId> = ids.into_iter().collect();
        ids.sort();
        ids.dedup();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            guards.push(self.acquire(id).await);
        }
        guards
    }

    /// Number of ids with a lock entry.
    pub async fn tracked(&self) -> usize {
        self.table.lock().await.len()
    }
}
