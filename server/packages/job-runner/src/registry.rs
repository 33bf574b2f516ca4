//! Process registry - the only state shared between a job's driver and stop requests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Mutex};

use crate::job::{JobId, JobInfo};

/// Handle a stop request needs to end a live job.
///
/// The `Child` itself stays with the job's driver, which is the only task that
/// waits on it; the handle carries what is needed to signal the process tree
/// and to observe its exit.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: u32,
    cancel_requested: Arc<AtomicBool>,
    exited: watch::Receiver<bool>,
}

impl ProcessHandle {
    pub fn new(pid: u32, cancel_requested: Arc<AtomicBool>, exited: watch::Receiver<bool>) -> Self {
        Self {
            pid,
            cancel_requested,
            exited,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    pub fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    /// Resolves once the driver has reaped the process (or gone away).
    pub async fn wait_exited(&mut self) {
        while !*self.exited.borrow_and_update() {
            if self.exited.changed().await.is_err() {
                return;
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub info: JobInfo,
    pub handle: ProcessHandle,
}

#[derive(Debug, Default)]
pub struct ProcessRegistry {
    entries: Mutex<HashMap<JobId, RegistryEntry>>,
    next_id: AtomicU64,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_job_id(&self) -> JobId {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        JobId::new(format!("job-{n}"))
    }

    /// Returns false, leaving the existing entry untouched, if the id is taken.
    pub async fn register(&self, entry: RegistryEntry) -> bool {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&entry.info.id) {
            tracing::warn!(job_id = %entry.info.id, "job id already registered");
            return false;
        }
        entries.insert(entry.info.id.clone(), entry);
        true
    }

    pub async fn lookup_and_remove(&self, id: &JobId) -> Option<RegistryEntry> {
        self.entries.lock().await.remove(id)
    }

    pub async fn remove_all(&self) -> Vec<RegistryEntry> {
        let mut drained: Vec<RegistryEntry> = self.entries.lock().await.drain().map(|(_, entry)| entry).collect();
        drained.sort_by(|a, b| a.info.id.cmp(&b.info.id));
        drained
    }

    pub async fn contains(&self, id: &JobId) -> bool {
        self.entries.lock().await.contains_key(id)
    }

    pub async fn snapshot(&self) -> Vec<JobInfo> {
        let mut list: Vec<JobInfo> = self
            .entries
            .lock()
            .await
            .values()
            .map(|entry| entry.info.clone())
            .collect();
        list.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        list
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}
