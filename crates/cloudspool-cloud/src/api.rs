// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// The cloud print operations the printer manager depends on.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWrite;

use cloudspool_core::error::Result;
use cloudspool_core::types::{CloudJobStatus, JobId, JobTicket, PrinterRecord};

/// A printer as the cloud knows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloudPrinter {
    pub id: String,
    /// Local queue name the printer was registered from.
    pub name: String,
    #[serde(default)]
    pub display_name: String,
}

/// A job waiting in a printer's cloud queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub id: JobId,
    pub printer_id: String,
    #[serde(default)]
    pub title: String,
}

/// Cloud print service API.
///
/// All calls use the robot identity except [`share_printer`](Self::share_printer),
/// which needs the user identity.
#[async_trait]
pub trait CloudPrint: Send + Sync {
    /// Printers registered under this proxy.
    async fn list_printers(&self) -> Result<Vec<CloudPrinter>>;

    /// Register a printer; returns its new cloud ID.
    async fn register_printer(&self, printer: &PrinterRecord) -> Result<String>;

    /// Push changed metadata for an already registered printer.
    async fn update_printer(&self, printer: &PrinterRecord) -> Result<()>;

    async fn delete_printer(&self, cloud_id: &str) -> Result<()>;

    /// Share a printer with a scope (user, group, or domain).
    async fn share_printer(&self, cloud_id: &str, scope: &str) -> Result<()>;

    /// Jobs waiting in one printer's queue.
    async fn list_queued_jobs(&self, printer_id: &str) -> Result<Vec<QueuedJob>>;

    async fn fetch_job_ticket(&self, job_id: &JobId) -> Result<JobTicket>;

    /// Stream the job payload into `sink`; returns the number of bytes written.
    async fn download_payload(
        &self,
        ticket: &JobTicket,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64>;

    async fn update_job_status(
        &self,
        job_id: &JobId,
        status: CloudJobStatus,
        message: Option<&str>,
    ) -> Result<()>;
}
