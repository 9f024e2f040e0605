//! Per-job mutual exclusion.

use flowline_core::ResourceId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;

type Slot = Arc<tokio::sync::Mutex<()>>;

/// Map of job id to async mutex. Entries exist only while someone holds or
/// waits for the lock, so unrelated jobs never contend.
#[derive(Debug, Default)]
pub struct JobLocks {
    slots: Mutex<HashMap<ResourceId, Slot>>,
}

impl JobLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, job_id: ResourceId) -> JobLockGuard<'_> {
        let slot = self.slots.lock().entry(job_id).or_default().clone();
        let guard = slot.lock_owned().await;
        JobLockGuard {
            locks: self,
            job_id,
            guard: Some(guard),
        }
    }

    /// Number of jobs with a live lock entry.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct JobLockGuard<'a> {
    locks: &'a JobLocks,
    job_id: ResourceId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for JobLockGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut slots = self.locks.slots.lock();
        // Only the map still references the slot: nobody holds or awaits it.
        if slots
            .get(&self.job_id)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            slots.remove(&self.job_id);
        }
    }
}
