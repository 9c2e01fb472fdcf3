// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The local print service as seen by the printer manager.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;

use cloudspool_core::error::Result;
use cloudspool_core::types::{JobOptions, LocalJobHandle, LocalJobStatus, LocalPrinter};

/// Everything the spooler needs to print one staged payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSubmission {
    pub title: String,
    /// `requesting-user-name` for the local job.
    pub user_name: String,
    /// MIME type of the payload (`document-format`).
    pub content_type: String,
    pub options: JobOptions,
    /// Staged payload file.
    pub path: PathBuf,
}

/// Local spooler operations.
#[async_trait]
pub trait LocalPrintService: Send + Sync {
    /// All queues the spooler currently knows, with selected attributes.
    async fn list_printers(&self) -> Result<Vec<LocalPrinter>>;

    /// Selected attributes of one queue.
    async fn printer_attributes(&self, printer: &str) -> Result<BTreeMap<String, String>>;

    async fn submit_job(&self, printer: &str, submission: &LocalSubmission)
    -> Result<LocalJobHandle>;

    async fn poll_job_status(&self, handle: &LocalJobHandle) -> Result<LocalJobStatus>;

    /// Jobs on `printer` that have not finished yet.
    async fn pending_job_count(&self, printer: &str) -> Result<usize>;
}
