// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Core domain types for the Cloudspool print proxy.
//
// Printer and job records are owned by the printer manager; everything handed
// to other components (diagnostics, logs) is a cloned snapshot.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CloudspoolError, Result};

/// Which credential an outbound call is made with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Identity {
    /// The proxy's own service account. Used for all automated calls.
    Robot,
    /// Optional human owner. Only needed for sharing printers.
    User,
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Robot => write!(f, "robot"),
            Self::User => write!(f, "user"),
        }
    }
}

/// Classification of errors for retry and escalation logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Network blip, timeout, overloaded server. Safe to retry.
    Transient,
    /// Credential rejected after one refresh. Fatal for the robot identity.
    Authentication { fatal: bool },
    /// Malformed notification, ticket, or reply. The job fails; other work continues.
    Protocol,
    /// The local spooler rejected or failed the job.
    LocalDevice,
    /// Missing configuration or unrecoverable startup condition.
    Fatal,
    /// Work was abandoned because the process is shutting down.
    Cancelled,
}

// ---------------------------------------------------------------------------
// Printers
// ---------------------------------------------------------------------------

/// A printer as reported by the local print service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalPrinter {
    /// Queue name, unique on this host.
    pub name: String,
    /// Free-form description (`printer-info`).
    pub info: String,
    /// Driver description (`printer-make-and-model`), absent for raw queues.
    pub make_and_model: Option<String>,
    /// Selected driver-reported attributes.
    pub attributes: BTreeMap<String, String>,
}

impl LocalPrinter {
    /// Raw queues pass data straight to the device without a driver.
    pub fn is_raw(&self) -> bool {
        match self.make_and_model.as_deref() {
            None => true,
            Some(m) => m.trim().is_empty() || m.trim() == "Local Raw Printer",
        }
    }
}

/// A printer known to the proxy, keyed by its local name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrinterRecord {
    /// Local queue name.
    pub name: String,
    /// Cloud printer ID; `None` until the first registration succeeds.
    pub cloud_id: Option<String>,
    /// Name shown to cloud users.
    pub display_name: String,
    /// Local description, kept for display-name derivation.
    #[serde(default)]
    pub info: String,
    /// Capability/attribute set. Compared as a whole when reconciling.
    pub attributes: BTreeMap<String, String>,
    /// Scope the printer was shared with, if any.
    #[serde(default)]
    pub share_scope: Option<String>,
    /// Raw queue flag.
    #[serde(default)]
    pub raw: bool,
    /// Last successful create or update in the cloud.
    #[serde(default)]
    pub synced_at: Option<DateTime<Utc>>,
}

impl PrinterRecord {
    /// Build an unregistered record from a local printer.
    ///
    /// The display name comes from `printer-info` only when
    /// `info_as_display_name` is set; otherwise the queue name is used.
    pub fn from_local(printer: &LocalPrinter, info_as_display_name: bool) -> Self {
        let display_name = if info_as_display_name && !printer.info.trim().is_empty() {
            printer.info.clone()
        } else {
            printer.name.clone()
        };

        Self {
            name: printer.name.clone(),
            cloud_id: None,
            display_name,
            info: printer.info.clone(),
            attributes: printer.attributes.clone(),
            share_scope: None,
            raw: printer.is_raw(),
            synced_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

/// Cloud-assigned, globally unique job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(pub String);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Lifecycle states of a cloud print job on this proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    /// Observed via notification or poll, not yet started.
    Queued,
    /// Ticket and payload are being fetched.
    Downloading,
    /// Payload staged locally.
    Downloaded,
    /// Handed to the local spooler.
    Submitted,
    /// The spooler reported success.
    Completed,
    /// Failed; may be re-queued until the retry budget runs out.
    Failed,
}

impl JobState {
    fn rank(self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Downloading => 1,
            Self::Downloaded => 2,
            Self::Submitted => 3,
            Self::Completed | Self::Failed => 4,
        }
    }

    /// Forward moves only, plus `Failed -> Queued` for a retry and
    /// `Downloading -> Downloading` for a repeated download attempt.
    pub fn can_transition_to(self, next: JobState) -> bool {
        match (self, next) {
            (Self::Completed, _) => false,
            (Self::Failed, Self::Queued) => true,
            (Self::Failed, _) => false,
            (_, Self::Failed) => true,
            (Self::Downloading, Self::Downloading) => true,
            (from, to) => to.rank() > from.rank(),
        }
    }
}

/// Where the job payload currently is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayloadRef {
    NotFetched,
    Fetched {
        path: PathBuf,
        size: u64,
        /// SHA-256 of the staged bytes, hex-encoded.
        sha256: String,
    },
}

/// Handle of a job inside the local spooler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LocalJobHandle {
    pub printer: String,
    pub job_id: i32,
}

/// Local spooler view of a submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalJobStatus {
    Pending,
    Completed,
    Failed(String),
}

/// A print job as tracked by this proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    /// Cloud ID of the target printer.
    pub printer_id: String,
    /// Local queue name, resolved at dispatch time.
    pub printer_name: Option<String>,
    pub title: Option<String>,
    pub state: JobState,
    pub payload: PayloadRef,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub local_handle: Option<LocalJobHandle>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(id: JobId, printer_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            printer_id: printer_id.into(),
            printer_name: None,
            title: None,
            state: JobState::Queued,
            payload: PayloadRef::NotFetched,
            retry_count: 0,
            last_error: None,
            local_handle: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move to `next`, rejecting non-monotonic transitions.
    pub fn transition(&mut self, next: JobState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(CloudspoolError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Mark the job failed with a detail message.
    pub fn fail(&mut self, detail: impl Into<String>) -> Result<()> {
        self.last_error = Some(detail.into());
        self.transition(JobState::Failed)
    }
}

/// Job options carried by a ticket, as IPP keyword → value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobOptions(pub BTreeMap<String, String>);

/// Option keys the local spooler path knows how to apply.
pub const SUPPORTED_JOB_OPTIONS: &[&str] = &[
    "copies",
    "sides",
    "media",
    "orientation-requested",
    "print-color-mode",
    "page-ranges",
    "fit-to-page",
];

impl JobOptions {
    /// Reject options that cannot be honoured locally.
    pub fn validate(&self) -> Result<()> {
        for (key, value) in &self.0 {
            if !SUPPORTED_JOB_OPTIONS.contains(&key.as_str()) {
                return Err(CloudspoolError::UnsupportedTicket(format!(
                    "option '{key}' is not supported"
                )));
            }
            let valid = match key.as_str() {
                "copies" => matches!(value.parse::<u32>(), Ok(n) if n > 0),
                "orientation-requested" => Self::orientation(value).is_some(),
                "page-ranges" => Self::page_ranges(value).is_some(),
                "fit-to-page" => Self::flag(value).is_some(),
                _ => !value.trim().is_empty(),
            };
            if !valid {
                return Err(CloudspoolError::UnsupportedTicket(format!(
                    "invalid value '{value}' for {key}"
                )));
            }
        }
        Ok(())
    }

    /// IPP `orientation-requested` enum for a keyword or its numeric form.
    pub fn orientation(value: &str) -> Option<i32> {
        match value {
            "portrait" | "3" => Some(3),
            "landscape" | "4" => Some(4),
            "reverse-landscape" | "5" => Some(5),
            "reverse-portrait" | "6" => Some(6),
            _ => None,
        }
    }

    /// Parse `1-3,5` into inclusive `(min, max)` page ranges.
    pub fn page_ranges(value: &str) -> Option<Vec<(i32, i32)>> {
        let mut ranges = Vec::new();
        for part in value.split(',') {
            let part = part.trim();
            let (min, max) = match part.split_once('-') {
                Some((a, b)) => (a.trim().parse().ok()?, b.trim().parse().ok()?),
                None => {
                    let n: i32 = part.parse().ok()?;
                    (n, n)
                }
            };
            if min < 1 || max < min {
                return None;
            }
            ranges.push((min, max));
        }
        (!ranges.is_empty()).then_some(ranges)
    }

    pub fn flag(value: &str) -> Option<bool> {
        match value {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        }
    }

    pub fn copies(&self) -> Option<u32> {
        self.0.get("copies").and_then(|v| v.parse().ok())
    }
}

/// Job metadata plus the handle used to download its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTicket {
    pub job_id: JobId,
    pub printer_id: String,
    pub title: String,
    /// Address of the user who submitted the job.
    pub owner: String,
    pub content_type: String,
    /// Payload download URL.
    pub file_url: String,
    #[serde(default)]
    pub options: JobOptions,
}

/// Job status values understood by the cloud service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloudJobStatus {
    InProgress,
    Done,
    Error,
}

impl CloudJobStatus {
    /// Wire keyword for the status endpoint.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InProgress => "IN_PROGRESS",
            Self::Done => "DONE",
            Self::Error => "ERROR",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

// ---------------------------------------------------------------------------
// Diagnostics
// ---------------------------------------------------------------------------

/// Running job counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounters {
    pub done: u64,
    pub error: u64,
    pub in_progress: u64,
}

/// Point-in-time copy of the printer and job tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerSnapshot {
    pub printers: Vec<PrinterRecord>,
    pub jobs: Vec<JobRecord>,
    pub counters: JobCounters,
    pub taken_at: DateTime<Utc>,
}
