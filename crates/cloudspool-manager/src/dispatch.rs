// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Job dispatch pipeline.
//
// Every job runs download -> local submission -> status polling -> cloud
// status report inside one worker. Admission claims the job ID first, so the
// push notification path and the poll fallback can both feed `admit` without
// a job ever being processed twice. Downloads are bounded by a shared
// semaphore; local submission is bounded per printer by the queue-size cap.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use cloudspool_cloud::CloudPrint;
use cloudspool_core::ConnectorConfig;
use cloudspool_core::error::{CloudspoolError, Result};
use cloudspool_core::types::{
    CloudJobStatus, JobId, JobState, JobTicket, LocalJobStatus, PrinterRecord,
};
use cloudspool_cups::{LocalPrintService, LocalSubmission};

use crate::payload::{StagedPayload, stage_payload};
use crate::retry::{RetryDecision, RetryPolicy, retry_with_backoff, should_retry};
use crate::tables::{ClaimGuard, JobTable, PrinterTable};

/// Consecutive status-poll errors after which a submitted job is failed.
const MAX_POLL_FAILURES: u32 = 5;

/// Grace period for abandoned workers to record their state after a drain
/// timeout, before they are aborted.
const ABANDON_GRACE: Duration = Duration::from_secs(2);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Resolves once `flag` is set.
async fn flagged(flag: &watch::Sender<bool>) {
    let mut rx = flag.subscribe();
    let _ = rx.wait_for(|set| *set).await;
}

/// Dispatch tuning, taken from the connector configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub max_concurrent_downloads: usize,
    /// Jobs allowed in the local spooler per printer.
    pub queue_size: usize,
    pub full_username: bool,
    pub download_retry: RetryPolicy,
    pub status_retry: RetryPolicy,
    pub local_timeout: Duration,
    pub status_poll_interval: Duration,
}

impl DispatchConfig {
    pub fn from_config(config: &ConnectorConfig) -> Self {
        Self {
            max_concurrent_downloads: config.max_concurrent_downloads.max(1),
            queue_size: config.cups_job_queue_size.max(1),
            full_username: config.cups_job_full_username,
            download_retry: RetryPolicy::downloads(config),
            status_retry: RetryPolicy::status_updates(config),
            local_timeout: config.local_call_timeout(),
            status_poll_interval: config.job_status_poll_interval(),
        }
    }
}

/// Result of offering a job ID to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// A worker now owns the job.
    Started,
    /// Already in flight, or finished recently.
    Duplicate,
    ShuttingDown,
}

/// How a worker left a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed(String),
    /// Interrupted by shutdown; the record is left `Failed` and unreported.
    Abandoned,
    Duplicate,
}

/// `requesting-user-name` for a job owner.
pub fn requesting_user(owner: &str, full_username: bool) -> String {
    let name = if full_username {
        owner
    } else {
        owner.split('@').next().unwrap_or_default()
    };
    if name.trim().is_empty() {
        "anonymous".to_string()
    } else {
        name.to_string()
    }
}

struct Inner {
    cloud: Arc<dyn CloudPrint>,
    local: Arc<dyn LocalPrintService>,
    printers: Arc<PrinterTable>,
    jobs: Arc<JobTable>,
    config: DispatchConfig,
    downloads: Arc<Semaphore>,
    slots: Mutex<HashMap<String, Arc<Semaphore>>>,
    stopping: watch::Sender<bool>,
    abandon: watch::Sender<bool>,
    workers: Mutex<JoinSet<()>>,
}

/// The bounded worker pool. Cheap to clone.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(
        config: DispatchConfig,
        cloud: Arc<dyn CloudPrint>,
        local: Arc<dyn LocalPrintService>,
        printers: Arc<PrinterTable>,
        jobs: Arc<JobTable>,
    ) -> Self {
        let (stopping, _) = watch::channel(false);
        let (abandon, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                cloud,
                local,
                printers,
                jobs,
                downloads: Arc::new(Semaphore::new(config.max_concurrent_downloads)),
                config,
                slots: Mutex::new(HashMap::new()),
                stopping,
                abandon,
                workers: Mutex::new(JoinSet::new()),
            }),
        }
    }

    pub fn is_stopping(&self) -> bool {
        *self.inner.stopping.borrow()
    }

    /// Refuse further admissions. In-flight jobs keep running.
    pub fn stop_admitting(&self) {
        self.inner.stopping.send_replace(true);
    }

    /// Offer a job to the pool.
    ///
    /// Waits for a download slot when the pool is saturated; the job is never
    /// dropped, only delayed. Returns once a worker owns the job.
    #[instrument(skip(self), fields(job_id = %job_id))]
    pub async fn admit(&self, job_id: JobId, printer_id: &str) -> Admission {
        if self.is_stopping() {
            return Admission::ShuttingDown;
        }
        let Some(claim) = self.inner.jobs.try_claim(&job_id, printer_id) else {
            return Admission::Duplicate;
        };

        let permit = tokio::select! {
            permit = Arc::clone(&self.inner.downloads).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return Admission::ShuttingDown,
            },
            _ = flagged(&self.inner.stopping) => return Admission::ShuttingDown,
        };

        let mut workers = lock(&self.inner.workers);
        if self.is_stopping() {
            return Admission::ShuttingDown;
        }
        while workers.try_join_next().is_some() {}

        let this = self.clone();
        workers.spawn(async move {
            let outcome = this.run_claimed(claim, Some(permit)).await;
            debug!(job_id = %job_id, ?outcome, "worker finished");
        });
        Admission::Started
    }

    /// Run one job to its end on the calling task.
    pub async fn process_job(&self, job_id: JobId, printer_id: &str) -> JobOutcome {
        match self.inner.jobs.try_claim(&job_id, printer_id) {
            Some(claim) => self.run_claimed(claim, None).await,
            None => JobOutcome::Duplicate,
        }
    }

    /// Stop admitting, wait up to `timeout` for in-flight workers, then
    /// abandon whatever is still running.
    pub async fn drain(&self, timeout: Duration) {
        self.stop_admitting();
        let mut workers = std::mem::take(&mut *lock(&self.inner.workers));
        info!(in_flight = workers.len(), "draining job workers");

        let finished = tokio::time::timeout(timeout, async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if finished.is_ok() {
            return;
        }

        warn!(remaining = workers.len(), "drain timed out, abandoning in-flight jobs");
        self.inner.abandon.send_replace(true);
        let settled = tokio::time::timeout(ABANDON_GRACE, async {
            while workers.join_next().await.is_some() {}
        })
        .await;
        if settled.is_err() {
            workers.abort_all();
        }
    }

    async fn run_claimed(&self, claim: ClaimGuard, permit: Option<OwnedSemaphorePermit>) -> JobOutcome {
        let id = claim.id().clone();
        let outcome = tokio::select! {
            outcome = self.execute(&id, permit) => outcome,
            _ = flagged(&self.inner.abandon) => {
                self.abandon(&id);
                JobOutcome::Abandoned
            }
        };
        drop(claim);
        outcome
    }

    fn abandon(&self, id: &JobId) {
        let was_submitted = self
            .inner
            .jobs
            .update(id, |job| match job.state {
                JobState::Completed | JobState::Failed => Ok(false),
                state => {
                    job.fail("abandoned at shutdown")?;
                    Ok(state == JobState::Submitted)
                }
            })
            .unwrap_or(false);
        if was_submitted {
            self.inner.jobs.job_terminal(true, false);
        }
        warn!(job_id = %id, "job abandoned at shutdown");
    }

    async fn execute(&self, id: &JobId, permit: Option<OwnedSemaphorePermit>) -> JobOutcome {
        let Some(record) = self.inner.jobs.get(id) else {
            return JobOutcome::Failed(format!("job {id} is not tracked"));
        };

        // A terminal record still in the table was never reported.
        match record.state {
            JobState::Completed => {
                drop(permit);
                self.report(id, None).await;
                return JobOutcome::Completed;
            }
            JobState::Failed => {
                drop(permit);
                let detail = record.last_error.unwrap_or_else(|| "job failed".into());
                self.report(id, Some(&detail)).await;
                return JobOutcome::Failed(detail);
            }
            _ => {}
        }

        let Some(printer) = self.inner.printers.by_cloud_id(&record.printer_id) else {
            drop(permit);
            let err = CloudspoolError::PrinterGone(record.printer_id.clone());
            warn!(job_id = %id, error = %err, "rejecting job without download");
            return self.conclude(id, Some(err.to_string()), false).await;
        };

        let mut submitted = false;
        match self.print(id, &printer, permit, &mut submitted).await {
            Ok(None) => self.conclude(id, None, submitted).await,
            Ok(Some(detail)) => self.conclude(id, Some(detail), submitted).await,
            Err(e) => self.conclude(id, Some(e.to_string()), submitted).await,
        }
    }

    /// Download, submit, and wait for the spooler. `Ok(Some(detail))` is a
    /// spooler-reported failure.
    async fn print(
        &self,
        id: &JobId,
        printer: &PrinterRecord,
        permit: Option<OwnedSemaphorePermit>,
        submitted: &mut bool,
    ) -> Result<Option<String>> {
        self.inner.jobs.update(id, |job| {
            job.printer_name = Some(printer.name.clone());
            Ok(())
        })?;

        let (ticket, staged) = self.download(id, permit).await?;

        let slot = self.slot(&printer.name);
        let _slot = slot
            .acquire_owned()
            .await
            .map_err(|_| CloudspoolError::ShuttingDown)?;
        self.wait_for_capacity(&printer.name).await;

        let submission = LocalSubmission {
            title: ticket.title.clone(),
            user_name: requesting_user(&ticket.owner, self.inner.config.full_username),
            content_type: ticket.content_type.clone(),
            options: ticket.options.clone(),
            path: staged.path().to_path_buf(),
        };
        let handle = self
            .local_call("job submission", self.inner.local.submit_job(&printer.name, &submission))
            .await?;

        self.inner.jobs.update(id, |job| {
            job.local_handle = Some(handle.clone());
            job.transition(JobState::Submitted)
        })?;
        self.inner.jobs.job_submitted();
        *submitted = true;
        info!(job_id = %id, printer = %printer.name, local_job = handle.job_id, "job submitted locally");

        if let Err(e) = self
            .inner
            .cloud
            .update_job_status(id, CloudJobStatus::InProgress, None)
            .await
        {
            warn!(job_id = %id, error = %e, "could not mark job in progress");
        }

        let mut failures = 0;
        loop {
            tokio::time::sleep(self.inner.config.status_poll_interval).await;
            match self
                .local_call("job status poll", self.inner.local.poll_job_status(&handle))
                .await
            {
                Ok(LocalJobStatus::Pending) => failures = 0,
                Ok(LocalJobStatus::Completed) => return Ok(None),
                Ok(LocalJobStatus::Failed(detail)) => return Ok(Some(detail)),
                Err(e) => {
                    failures += 1;
                    warn!(job_id = %id, failures, error = %e, "job status poll failed");
                    if failures >= MAX_POLL_FAILURES {
                        return Err(e);
                    }
                }
            }
        }
    }

    /// Fetch ticket and payload under a download permit, retrying transient
    /// failures with backoff. The permit is released while backing off.
    async fn download(
        &self,
        id: &JobId,
        mut permit: Option<OwnedSemaphorePermit>,
    ) -> Result<(JobTicket, StagedPayload)> {
        let policy = self.inner.config.download_retry;
        let mut attempts = 0;
        loop {
            let _permit = match permit.take() {
                Some(permit) => permit,
                None => Arc::clone(&self.inner.downloads)
                    .acquire_owned()
                    .await
                    .map_err(|_| CloudspoolError::ShuttingDown)?,
            };
            attempts += 1;
            self.inner.jobs.transition(id, JobState::Downloading)?;

            let err = match self.fetch(id).await {
                Ok((ticket, staged)) => {
                    self.inner.jobs.update(id, |job| {
                        job.title = Some(ticket.title.clone());
                        job.payload = staged.payload_ref();
                        job.transition(JobState::Downloaded)
                    })?;
                    debug!(job_id = %id, size = staged.size(), "job downloaded");
                    return Ok((ticket, staged));
                }
                Err(err) => err,
            };

            self.inner.jobs.update(id, |job| {
                job.retry_count += 1;
                Ok(())
            })?;
            match should_retry(&err, attempts, &policy) {
                RetryDecision::RetryAfter(delay) => {
                    warn!(job_id = %id, attempts, error = %err, "download failed, re-queueing");
                    self.inner.jobs.update(id, |job| {
                        job.fail(err.to_string())?;
                        job.transition(JobState::Queued)
                    })?;
                    drop(_permit);
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp(_) | RetryDecision::Exhausted => return Err(err),
            }
        }
    }

    async fn fetch(&self, id: &JobId) -> Result<(JobTicket, StagedPayload)> {
        let ticket = self.inner.cloud.fetch_job_ticket(id).await?;
        ticket.options.validate()?;
        let staged = stage_payload(self.inner.cloud.as_ref(), &ticket).await?;
        Ok((ticket, staged))
    }

    fn slot(&self, printer: &str) -> Arc<Semaphore> {
        let mut slots = lock(&self.inner.slots);
        Arc::clone(
            slots
                .entry(printer.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.inner.config.queue_size))),
        )
    }

    /// Wait while the spooler already holds a full queue for `printer`.
    async fn wait_for_capacity(&self, printer: &str) {
        loop {
            match self
                .local_call("pending job count", self.inner.local.pending_job_count(printer))
                .await
            {
                Ok(pending) if pending < self.inner.config.queue_size => return,
                Ok(pending) => debug!(printer, pending, "local queue full, deferring submission"),
                Err(e) => {
                    warn!(printer, error = %e, "pending job count unavailable");
                    return;
                }
            }
            tokio::time::sleep(self.inner.config.status_poll_interval).await;
        }
    }

    async fn local_call<T>(&self, what: &str, call: impl Future<Output = Result<T>>) -> Result<T> {
        let timeout = self.inner.config.local_timeout;
        tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| CloudspoolError::Timeout(format!("{what} exceeded {timeout:?}")))?
    }

    /// Record the terminal state, count it, and report it to the cloud.
    async fn conclude(&self, id: &JobId, failure: Option<String>, was_submitted: bool) -> JobOutcome {
        let recorded = self.inner.jobs.update(id, |job| match &failure {
            None => job.transition(JobState::Completed),
            Some(detail) => job.fail(detail.clone()),
        });
        if let Err(e) = recorded {
            warn!(job_id = %id, error = %e, "could not record terminal state");
        }
        self.inner.jobs.job_terminal(was_submitted, failure.is_none());

        match &failure {
            None => info!(job_id = %id, "job completed"),
            Some(detail) => warn!(job_id = %id, %detail, "job failed"),
        }
        self.report(id, failure.as_deref()).await;

        match failure {
            None => JobOutcome::Completed,
            Some(detail) => JobOutcome::Failed(detail),
        }
    }

    /// Send the terminal status. On success the record is retired; otherwise
    /// it stays so the next admission of the same ID re-reports it.
    async fn report(&self, id: &JobId, failure: Option<&str>) {
        let status = if failure.is_some() {
            CloudJobStatus::Error
        } else {
            CloudJobStatus::Done
        };
        let cloud = &self.inner.cloud;
        let result = retry_with_backoff(&self.inner.config.status_retry, "job status update", move || {
            cloud.update_job_status(id, status, failure)
        })
        .await;

        match result {
            Ok(()) => {
                debug!(job_id = %id, status = status.as_str(), "status reported");
                self.inner.jobs.finish(id);
            }
            Err(e) => warn!(job_id = %id, error = %e, "status report failed, will re-report"),
        }
    }
}
