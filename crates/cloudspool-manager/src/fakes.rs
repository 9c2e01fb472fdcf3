// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// In-memory cloud and spooler used by the manager tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use cloudspool_cloud::{CloudPrint, CloudPrinter, QueuedJob};
use cloudspool_core::error::{CloudspoolError, Result};
use cloudspool_core::types::{
    CloudJobStatus, Identity, JobId, JobOptions, JobTicket, LocalJobHandle, LocalJobStatus,
    LocalPrinter, PrinterRecord,
};
use cloudspool_cups::{LocalPrintService, LocalSubmission};

pub const FAKE_PAYLOAD: &[u8] = b"%PDF-1.4 cloudspool test page";

pub fn local_printer(name: &str) -> LocalPrinter {
    LocalPrinter {
        name: name.into(),
        info: format!("{name} at the front desk"),
        make_and_model: Some("Generic PDF Printer".into()),
        attributes: BTreeMap::from([(
            "document-format-supported".to_string(),
            "application/pdf".to_string(),
        )]),
    }
}

/// Decrement `counter` if positive; true when it was.
fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

// ---------------------------------------------------------------------------
// Cloud
// ---------------------------------------------------------------------------

#[derive(Default)]
struct CloudState {
    next_id: u32,
    printers: Vec<CloudPrinter>,
    queued: Vec<QueuedJob>,
    tickets: HashMap<JobId, JobTicket>,
    downloads: Vec<String>,
    updates: Vec<PrinterRecord>,
    statuses: Vec<(JobId, CloudJobStatus, Option<String>)>,
}

#[derive(Default)]
pub struct FakeCloud {
    state: Mutex<CloudState>,
    pub fail_next_registrations: AtomicU32,
    pub failing_updates: AtomicU32,
    pub reject_shares: AtomicBool,
    pub share_attempts: AtomicU32,
    pub failing_downloads: AtomicU32,
    pub download_delay_ms: AtomicU64,
    pub reject_status_updates: AtomicBool,
}

impl FakeCloud {
    fn state(&self) -> std::sync::MutexGuard<'_, CloudState> {
        self.state.lock().unwrap()
    }

    pub fn registered(&self) -> Vec<CloudPrinter> {
        self.state().printers.clone()
    }

    /// Add a registration directly, bypassing `register_printer`.
    pub fn add_printer(&self, id: &str, name: &str) {
        self.state().printers.push(CloudPrinter {
            id: id.into(),
            name: name.into(),
            display_name: name.into(),
        });
    }

    pub fn queue_job(&self, id: &str, printer_id: &str, options: BTreeMap<String, String>) {
        let job_id = JobId::from(id);
        let mut state = self.state();
        state.queued.push(QueuedJob {
            id: job_id.clone(),
            printer_id: printer_id.into(),
            title: format!("{id}.pdf"),
        });
        state.tickets.insert(
            job_id.clone(),
            JobTicket {
                job_id,
                printer_id: printer_id.into(),
                title: format!("{id}.pdf"),
                owner: "alice@example.com".into(),
                content_type: "application/pdf".into(),
                file_url: format!("https://cloud.test/download/{id}"),
                options: JobOptions(options),
            },
        );
    }

    /// Records passed to `update_printer`, failed attempts included.
    pub fn updates(&self) -> Vec<PrinterRecord> {
        self.state().updates.clone()
    }

    pub fn download_log(&self) -> Vec<String> {
        self.state().downloads.clone()
    }

    pub fn status_reports(&self) -> Vec<(JobId, CloudJobStatus, Option<String>)> {
        self.state().statuses.clone()
    }

    pub fn statuses_for(&self, id: &str) -> Vec<CloudJobStatus> {
        self.state()
            .statuses
            .iter()
            .filter(|(job, _, _)| job.0 == id)
            .map(|(_, status, _)| *status)
            .collect()
    }
}

#[async_trait]
impl CloudPrint for FakeCloud {
    async fn list_printers(&self) -> Result<Vec<CloudPrinter>> {
        Ok(self.registered())
    }

    async fn register_printer(&self, printer: &PrinterRecord) -> Result<String> {
        if take_one(&self.fail_next_registrations) {
            return Err(CloudspoolError::HttpStatus {
                status: 500,
                body: "backend error".into(),
            });
        }
        let mut state = self.state();
        state.next_id += 1;
        let id = format!("cloud-{}", state.next_id);
        state.printers.push(CloudPrinter {
            id: id.clone(),
            name: printer.name.clone(),
            display_name: printer.display_name.clone(),
        });
        Ok(id)
    }

    async fn update_printer(&self, printer: &PrinterRecord) -> Result<()> {
        let mut state = self.state();
        state.updates.push(printer.clone());
        if take_one(&self.failing_updates) {
            return Err(CloudspoolError::HttpStatus {
                status: 503,
                body: "backend busy".into(),
            });
        }
        let existing = state
            .printers
            .iter_mut()
            .find(|p| Some(p.id.as_str()) == printer.cloud_id.as_deref())
            .ok_or_else(|| CloudspoolError::CloudRejected("unknown printer".into()))?;
        existing.display_name = printer.display_name.clone();
        Ok(())
    }

    async fn delete_printer(&self, cloud_id: &str) -> Result<()> {
        self.state().printers.retain(|p| p.id != cloud_id);
        Ok(())
    }

    async fn share_printer(&self, _cloud_id: &str, _scope: &str) -> Result<()> {
        self.share_attempts.fetch_add(1, Ordering::SeqCst);
        if self.reject_shares.load(Ordering::SeqCst) {
            return Err(CloudspoolError::Authentication {
                identity: Identity::User,
                detail: "invalid_grant".into(),
            });
        }
        Ok(())
    }

    async fn list_queued_jobs(&self, printer_id: &str) -> Result<Vec<QueuedJob>> {
        Ok(self
            .state()
            .queued
            .iter()
            .filter(|j| j.printer_id == printer_id)
            .cloned()
            .collect())
    }

    async fn fetch_job_ticket(&self, job_id: &JobId) -> Result<JobTicket> {
        self.state()
            .tickets
            .get(job_id)
            .cloned()
            .ok_or_else(|| CloudspoolError::CloudRejected(format!("unknown job {job_id}")))
    }

    async fn download_payload(
        &self,
        ticket: &JobTicket,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64> {
        self.state().downloads.push(format!("start {}", ticket.job_id));
        let delay = self.download_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let result = if take_one(&self.failing_downloads) {
            Err(CloudspoolError::Network("connection reset by peer".into()))
        } else {
            sink.write_all(FAKE_PAYLOAD).await?;
            sink.flush().await?;
            Ok(FAKE_PAYLOAD.len() as u64)
        };
        self.state().downloads.push(format!("end {}", ticket.job_id));
        result
    }

    async fn update_job_status(
        &self,
        job_id: &JobId,
        status: CloudJobStatus,
        message: Option<&str>,
    ) -> Result<()> {
        if self.reject_status_updates.load(Ordering::SeqCst) {
            return Err(CloudspoolError::HttpStatus {
                status: 503,
                body: "try again".into(),
            });
        }
        let mut state = self.state();
        state.queued.retain(|j| &j.id != job_id);
        state
            .statuses
            .push((job_id.clone(), status, message.map(str::to_string)));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Spooler
// ---------------------------------------------------------------------------

/// A submission as the fake spooler saw it.
#[derive(Debug, Clone)]
pub struct Submitted {
    pub printer: String,
    pub user_name: String,
    pub payload: Vec<u8>,
}

#[derive(Default)]
struct SpoolState {
    next_job: i32,
    submissions: Vec<Submitted>,
    /// Local job ID -> (printer, pending polls left).
    pending: HashMap<i32, (String, u32)>,
    max_pending: HashMap<String, usize>,
}

pub struct FakeSpooler {
    printers: Mutex<Vec<LocalPrinter>>,
    state: Mutex<SpoolState>,
    /// Polls answered `Pending` before a job finishes.
    pub polls_until_done: AtomicU32,
    pub fail_with: Mutex<Option<String>>,
    /// Never finish any job.
    pub hold_jobs: AtomicBool,
    /// List printers without attributes so they must be queried.
    pub attributes_by_query: AtomicBool,
    pub failing_attribute_queries: AtomicU32,
}

impl FakeSpooler {
    pub fn with_printers(printers: Vec<LocalPrinter>) -> Self {
        Self {
            printers: Mutex::new(printers),
            state: Mutex::new(SpoolState::default()),
            polls_until_done: AtomicU32::new(1),
            fail_with: Mutex::new(None),
            hold_jobs: AtomicBool::new(false),
            attributes_by_query: AtomicBool::new(false),
            failing_attribute_queries: AtomicU32::new(0),
        }
    }

    pub fn set_printers(&self, printers: Vec<LocalPrinter>) {
        *self.printers.lock().unwrap() = printers;
    }

    pub fn submissions(&self) -> Vec<Submitted> {
        self.state.lock().unwrap().submissions.clone()
    }

    /// Highest number of jobs pending at once on `printer`.
    pub fn max_pending(&self, printer: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .max_pending
            .get(printer)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl LocalPrintService for FakeSpooler {
    async fn list_printers(&self) -> Result<Vec<LocalPrinter>> {
        let mut printers = self.printers.lock().unwrap().clone();
        if self.attributes_by_query.load(Ordering::SeqCst) {
            for printer in &mut printers {
                printer.attributes.clear();
            }
        }
        Ok(printers)
    }

    async fn printer_attributes(&self, printer: &str) -> Result<BTreeMap<String, String>> {
        if take_one(&self.failing_attribute_queries) {
            return Err(CloudspoolError::LocalPrint("Get-Printer-Attributes: timeout".into()));
        }
        self.printers
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.name == printer)
            .map(|p| p.attributes.clone())
            .ok_or_else(|| CloudspoolError::PrinterGone(printer.into()))
    }

    async fn submit_job(&self, printer: &str, submission: &LocalSubmission) -> Result<LocalJobHandle> {
        let payload = std::fs::read(&submission.path)?;
        let mut state = self.state.lock().unwrap();
        state.next_job += 1;
        let job_id = state.next_job;
        state.submissions.push(Submitted {
            printer: printer.into(),
            user_name: submission.user_name.clone(),
            payload,
        });

        let polls = self.polls_until_done.load(Ordering::SeqCst);
        state.pending.insert(job_id, (printer.to_string(), polls));
        let now_pending = state.pending.values().filter(|(p, _)| p == printer).count();
        let max = state.max_pending.entry(printer.to_string()).or_default();
        *max = (*max).max(now_pending);

        Ok(LocalJobHandle {
            printer: printer.into(),
            job_id,
        })
    }

    async fn poll_job_status(&self, handle: &LocalJobHandle) -> Result<LocalJobStatus> {
        if self.hold_jobs.load(Ordering::SeqCst) {
            return Ok(LocalJobStatus::Pending);
        }
        let mut state = self.state.lock().unwrap();
        let Some((_, polls_left)) = state.pending.get_mut(&handle.job_id) else {
            return Err(CloudspoolError::LocalPrint(format!(
                "unknown local job {}",
                handle.job_id
            )));
        };
        if *polls_left > 0 {
            *polls_left -= 1;
            return Ok(LocalJobStatus::Pending);
        }
        state.pending.remove(&handle.job_id);
        Ok(match self.fail_with.lock().unwrap().clone() {
            Some(detail) => LocalJobStatus::Failed(detail),
            None => LocalJobStatus::Completed,
        })
    }

    async fn pending_job_count(&self, printer: &str) -> Result<usize> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .pending
            .values()
            .filter(|(p, _)| p == printer)
            .count())
    }
}
