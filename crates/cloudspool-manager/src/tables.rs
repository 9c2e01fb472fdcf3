// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Printer and job tables shared by the manager loops.
//
// These are the only shared mutable state in the manager. Writers go through
// the methods here; readers get cloned snapshots. The job table also holds the
// claim set that guarantees at most one worker per job ID.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, instrument};

use cloudspool_core::error::{CloudspoolError, Result};
use cloudspool_core::types::{JobCounters, JobId, JobRecord, JobState, PrinterRecord};

/// How long a reported job ID is remembered so stale polls cannot re-admit it.
pub const FINISHED_TTL: Duration = Duration::from_secs(600);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Printers
// ---------------------------------------------------------------------------

/// Printers known to the proxy, keyed by local queue name.
#[derive(Debug, Default)]
pub struct PrinterTable {
    records: Mutex<BTreeMap<String, PrinterRecord>>,
}

impl PrinterTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, record: PrinterRecord) {
        lock(&self.records).insert(record.name.clone(), record);
    }

    pub fn remove(&self, name: &str) -> Option<PrinterRecord> {
        lock(&self.records).remove(name)
    }

    /// Drop every record whose name is not in `keep`.
    pub fn retain_names(&self, keep: &HashSet<String>) {
        lock(&self.records).retain(|name, _| keep.contains(name));
    }

    pub fn get(&self, name: &str) -> Option<PrinterRecord> {
        lock(&self.records).get(name).cloned()
    }

    pub fn by_cloud_id(&self, cloud_id: &str) -> Option<PrinterRecord> {
        lock(&self.records)
            .values()
            .find(|r| r.cloud_id.as_deref() == Some(cloud_id))
            .cloned()
    }

    /// Cloud IDs of every registered printer.
    pub fn cloud_ids(&self) -> Vec<String> {
        lock(&self.records)
            .values()
            .filter_map(|r| r.cloud_id.clone())
            .collect()
    }

    pub fn snapshot(&self) -> BTreeMap<String, PrinterRecord> {
        lock(&self.records).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct JobTableInner {
    jobs: BTreeMap<JobId, JobRecord>,
    claimed: HashSet<JobId>,
    finished: HashMap<JobId, Instant>,
    counters: JobCounters,
}

/// Live job records, the claim set, and running counters.
#[derive(Debug, Default)]
pub struct JobTable {
    inner: Mutex<JobTableInner>,
}

/// Exclusive right to process one job ID. Released on drop.
#[derive(Debug)]
pub struct ClaimGuard {
    table: Arc<JobTable>,
    id: JobId,
}

impl ClaimGuard {
    pub fn id(&self) -> &JobId {
        &self.id
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        lock(&self.table.inner).claimed.remove(&self.id);
    }
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `id` for processing, creating its record if needed.
    ///
    /// Returns `None` when another worker holds the claim or the job was
    /// finished within [`FINISHED_TTL`].
    #[instrument(skip(self), fields(job_id = %id))]
    pub fn try_claim(self: &Arc<Self>, id: &JobId, printer_id: &str) -> Option<ClaimGuard> {
        let now = Instant::now();
        let mut inner = lock(&self.inner);
        inner
            .finished
            .retain(|_, at| now.duration_since(*at) < FINISHED_TTL);

        if inner.finished.contains_key(id) || !inner.claimed.insert(id.clone()) {
            debug!("job already claimed or recently finished");
            return None;
        }
        inner
            .jobs
            .entry(id.clone())
            .or_insert_with(|| JobRecord::new(id.clone(), printer_id));

        Some(ClaimGuard {
            table: Arc::clone(self),
            id: id.clone(),
        })
    }

    pub fn get(&self, id: &JobId) -> Option<JobRecord> {
        lock(&self.inner).jobs.get(id).cloned()
    }

    /// Apply `f` to the record under the table lock.
    pub fn update<T>(&self, id: &JobId, f: impl FnOnce(&mut JobRecord) -> Result<T>) -> Result<T> {
        let mut inner = lock(&self.inner);
        let record = inner
            .jobs
            .get_mut(id)
            .ok_or_else(|| CloudspoolError::Protocol(format!("job {id} is not tracked")))?;
        f(record)
    }

    pub fn transition(&self, id: &JobId, next: JobState) -> Result<()> {
        self.update(id, |job| job.transition(next))
    }

    /// The terminal state was reported: forget the record, remember the ID.
    pub fn finish(&self, id: &JobId) {
        let mut inner = lock(&self.inner);
        inner.jobs.remove(id);
        inner.finished.insert(id.clone(), Instant::now());
    }

    pub fn job_submitted(&self) {
        lock(&self.inner).counters.in_progress += 1;
    }

    /// Count a job reaching a terminal state.
    pub fn job_terminal(&self, was_submitted: bool, success: bool) {
        let mut inner = lock(&self.inner);
        if was_submitted {
            inner.counters.in_progress = inner.counters.in_progress.saturating_sub(1);
        }
        if success {
            inner.counters.done += 1;
        } else {
            inner.counters.error += 1;
        }
    }

    pub fn counters(&self) -> JobCounters {
        lock(&self.inner).counters
    }

    pub fn snapshot(&self) -> Vec<JobRecord> {
        lock(&self.inner).jobs.values().cloned().collect()
    }

    pub fn is_claimed(&self, id: &JobId) -> bool {
        lock(&self.inner).claimed.contains(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn printer(name: &str, cloud_id: Option<&str>) -> PrinterRecord {
        PrinterRecord {
            name: name.into(),
            cloud_id: cloud_id.map(str::to_string),
            display_name: name.into(),
            info: String::new(),
            attributes: BTreeMap::new(),
            share_scope: None,
            raw: false,
            synced_at: None,
        }
    }

    #[test]
    fn printer_lookup_by_cloud_id() {
        let table = PrinterTable::new();
        table.upsert(printer("a", Some("c-a")));
        table.upsert(printer("b", None));
        assert_eq!(table.by_cloud_id("c-a").unwrap().name, "a");
        assert_eq!(table.cloud_ids(), vec!["c-a".to_string()]);

        table.retain_names(&HashSet::from(["b".to_string()]));
        assert!(table.get("a").is_none());
        assert_eq!(table.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn claim_is_exclusive_until_dropped() {
        let table = Arc::new(JobTable::new());
        let id = JobId::from("J1");

        let guard = table.try_claim(&id, "c-a").unwrap();
        assert!(table.try_claim(&id, "c-a").is_none());
        assert!(table.is_claimed(&id));

        drop(guard);
        assert!(!table.is_claimed(&id));
        assert!(table.try_claim(&id, "c-a").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn finished_ids_are_remembered_for_ttl() {
        let table = Arc::new(JobTable::new());
        let id = JobId::from("J1");

        drop(table.try_claim(&id, "c-a").unwrap());
        table.finish(&id);
        assert!(table.get(&id).is_none());
        assert!(table.try_claim(&id, "c-a").is_none());

        tokio::time::advance(FINISHED_TTL + Duration::from_secs(1)).await;
        assert!(table.try_claim(&id, "c-a").is_some());
    }

    #[test]
    fn counters_follow_terminal_states() {
        let table = JobTable::new();
        table.job_submitted();
        table.job_submitted();
        table.job_terminal(true, true);
        table.job_terminal(true, false);
        table.job_terminal(false, false);
        assert_eq!(
            table.counters(),
            JobCounters {
                done: 1,
                error: 2,
                in_progress: 0
            }
        );
    }
}
