// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Printer reconciliation: diff the local spooler inventory against the cloud
// registrations and apply creates, updates, and deletes.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use cloudspool_cloud::{CloudPrint, CloudPrinter};
use cloudspool_core::ConnectorConfig;
use cloudspool_core::error::{CloudspoolError, Result};
use cloudspool_core::types::{ErrorClass, LocalPrinter, PrinterRecord};
use cloudspool_cups::LocalPrintService;

use crate::tables::PrinterTable;

/// Knobs that change what the diff produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffOptions {
    pub ignore_raw: bool,
    /// Derive display names from `printer-info`; otherwise keep the name the
    /// cloud already has.
    pub info_as_display_name: bool,
}

/// What one reconciliation pass has to do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrinterDiff {
    pub to_create: Vec<PrinterRecord>,
    /// Full records (with `cloud_id`) whose attributes or display name changed.
    pub to_update: Vec<PrinterRecord>,
    /// Cloud printers with no local counterpart, plus duplicate registrations.
    pub to_delete: Vec<CloudPrinter>,
}

impl PrinterDiff {
    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_update.is_empty() && self.to_delete.is_empty()
    }
}

/// Compute the create/update/delete sets.
///
/// `known` is the last synced state keyed by local name. A cloud printer
/// without a known record, or whose last update did not go through, is
/// always updated so the cloud copy is rewritten from local truth.
pub fn diff_printers(
    local: &[LocalPrinter],
    known: &BTreeMap<String, PrinterRecord>,
    cloud: &[CloudPrinter],
    options: DiffOptions,
) -> PrinterDiff {
    let mut diff = PrinterDiff::default();

    let wanted: BTreeMap<&str, &LocalPrinter> = local
        .iter()
        .filter(|p| !(options.ignore_raw && p.is_raw()))
        .map(|p| (p.name.as_str(), p))
        .collect();

    // First registration per name wins; the rest are duplicates.
    let mut registered: BTreeMap<&str, &CloudPrinter> = BTreeMap::new();
    for printer in cloud {
        if !wanted.contains_key(printer.name.as_str()) || registered.contains_key(printer.name.as_str())
        {
            diff.to_delete.push(printer.clone());
        } else {
            registered.insert(printer.name.as_str(), printer);
        }
    }

    for (name, printer) in wanted {
        let mut desired = PrinterRecord::from_local(printer, options.info_as_display_name);

        let Some(existing) = registered.get(name) else {
            diff.to_create.push(desired);
            continue;
        };

        desired.cloud_id = Some(existing.id.clone());
        let previous = known
            .get(name)
            .filter(|r| r.cloud_id.as_deref() == Some(existing.id.as_str()));

        if !options.info_as_display_name {
            desired.display_name = previous
                .map(|r| r.display_name.clone())
                .or_else(|| Some(existing.display_name.clone()).filter(|n| !n.is_empty()))
                .unwrap_or(desired.display_name);
        }

        match previous {
            Some(prev)
                if prev.synced_at.is_some()
                    && prev.attributes == desired.attributes
                    && prev.display_name == desired.display_name
                    && prev.raw == desired.raw => {}
            _ => {
                if let Some(prev) = previous {
                    desired.share_scope = prev.share_scope.clone();
                }
                diff.to_update.push(desired);
            }
        }
    }

    diff
}

/// Counts from one pass, for logs and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub failed: usize,
    /// Printers left alone this pass because their attributes could not be read.
    pub deferred: usize,
}

/// Applies [`diff_printers`] results through the cloud client.
pub struct Reconciler {
    cloud: Arc<dyn CloudPrint>,
    local: Arc<dyn LocalPrintService>,
    printers: Arc<PrinterTable>,
    options: DiffOptions,
    share_scope: Option<String>,
    sharing_enabled: AtomicBool,
    local_timeout: Duration,
}

impl Reconciler {
    pub fn new(
        config: &ConnectorConfig,
        cloud: Arc<dyn CloudPrint>,
        local: Arc<dyn LocalPrintService>,
        printers: Arc<PrinterTable>,
    ) -> Self {
        Self {
            cloud,
            local,
            printers,
            options: DiffOptions {
                ignore_raw: config.cups_ignore_raw_printers,
                info_as_display_name: config.copy_printer_info_to_display_name,
            },
            share_scope: config.share_scope.clone().filter(|s| !s.trim().is_empty()),
            sharing_enabled: AtomicBool::new(true),
            local_timeout: config.local_call_timeout(),
        }
    }

    /// Whether newly registered printers are still being shared.
    pub fn sharing_enabled(&self) -> bool {
        self.share_scope.is_some() && self.sharing_enabled.load(Ordering::Relaxed)
    }

    /// List local printers and fill in their attributes. Returns the names
    /// whose attribute query failed alongside the list.
    async fn local_printers(&self) -> Result<(Vec<LocalPrinter>, HashSet<String>)> {
        let mut printers = tokio::time::timeout(self.local_timeout, self.local.list_printers())
            .await
            .map_err(|_| CloudspoolError::Timeout("listing local printers".into()))??;

        let mut unreadable = HashSet::new();
        for printer in printers.iter_mut().filter(|p| p.attributes.is_empty()) {
            match tokio::time::timeout(self.local_timeout, self.local.printer_attributes(&printer.name))
                .await
            {
                Ok(Ok(attributes)) => printer.attributes = attributes,
                Ok(Err(e)) => {
                    warn!(printer = %printer.name, error = %e, "attribute query failed");
                    unreadable.insert(printer.name.clone());
                }
                Err(_) => {
                    warn!(printer = %printer.name, "attribute query timed out");
                    unreadable.insert(printer.name.clone());
                }
            }
        }
        Ok((printers, unreadable))
    }

    /// Share a new registration with the configured scope.
    async fn share(&self, record: &mut PrinterRecord) {
        let (Some(scope), Some(cloud_id)) = (&self.share_scope, &record.cloud_id) else {
            return;
        };
        if !self.sharing_enabled.load(Ordering::Relaxed) {
            return;
        }
        match self.cloud.share_printer(cloud_id, scope).await {
            Ok(()) => {
                info!(printer = %record.name, %scope, "printer shared");
                record.share_scope = Some(scope.clone());
            }
            Err(e) if matches!(e.class(), ErrorClass::Authentication { .. }) => {
                warn!(error = %e, "user identity unavailable, sharing disabled");
                self.sharing_enabled.store(false, Ordering::Relaxed);
            }
            Err(e) => warn!(printer = %record.name, error = %e, "sharing failed"),
        }
    }

    /// One full pass. Per-printer failures are counted and retried next tick;
    /// only listing failures (or a fatal credential error) abort the pass.
    #[instrument(skip(self))]
    pub async fn reconcile_once(&self) -> Result<ReconcileReport> {
        let (mut local, unreadable) = self.local_printers().await?;
        let cloud = self.cloud.list_printers().await?;
        let known = self.printers.snapshot();

        // A printer whose attributes could not be read keeps its last synced
        // attributes. Without a synced record it is not pushed this pass.
        let mut deferred = HashSet::new();
        for printer in local.iter_mut().filter(|p| unreadable.contains(&p.name)) {
            match known.get(&printer.name).filter(|r| r.synced_at.is_some()) {
                Some(record) => printer.attributes = record.attributes.clone(),
                None => {
                    deferred.insert(printer.name.clone());
                }
            }
        }

        let mut diff = diff_printers(&local, &known, &cloud, self.options);
        let mut report = ReconcileReport::default();

        diff.to_create.retain(|record| {
            let keep = !deferred.contains(&record.name);
            if !keep {
                report.deferred += 1;
            }
            keep
        });
        let (held, to_update): (Vec<_>, Vec<_>) = std::mem::take(&mut diff.to_update)
            .into_iter()
            .partition(|record| deferred.contains(&record.name));
        diff.to_update = to_update;
        for record in held {
            // Still routable for jobs; the cloud copy is rewritten next pass.
            if !known.contains_key(&record.name) {
                self.printers.upsert(record);
            }
            report.deferred += 1;
        }

        if diff.is_empty() {
            debug!(printers = local.len(), "printers in sync");
        }

        for stale in &diff.to_delete {
            match self.cloud.delete_printer(&stale.id).await {
                Ok(()) => {
                    info!(printer = %stale.name, cloud_id = %stale.id, "cloud printer deleted");
                    report.deleted += 1;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(printer = %stale.name, error = %e, "delete failed");
                    report.failed += 1;
                }
            }
        }

        for mut record in diff.to_create {
            match self.cloud.register_printer(&record).await {
                Ok(cloud_id) => {
                    info!(printer = %record.name, %cloud_id, "printer registered");
                    record.cloud_id = Some(cloud_id);
                    record.synced_at = Some(Utc::now());
                    self.share(&mut record).await;
                    self.printers.upsert(record);
                    report.created += 1;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(printer = %record.name, error = %e, "registration failed");
                    report.failed += 1;
                }
            }
        }

        for mut record in diff.to_update {
            match self.cloud.update_printer(&record).await {
                Ok(()) => {
                    info!(printer = %record.name, "printer updated");
                    record.synced_at = Some(Utc::now());
                    self.printers.upsert(record);
                    report.updated += 1;
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(printer = %record.name, error = %e, "update failed");
                    // Still registered: keep it routable, unsynced so the
                    // next pass retries the update.
                    record.synced_at = None;
                    self.printers.upsert(record);
                    report.failed += 1;
                }
            }
        }

        let present: HashSet<String> = local
            .iter()
            .filter(|p| !(self.options.ignore_raw && p.is_raw()))
            .map(|p| p.name.clone())
            .collect();
        self.printers.retain_names(&present);

        info!(
            created = report.created,
            updated = report.updated,
            deleted = report.deleted,
            failed = report.failed,
            deferred = report.deferred,
            "reconciliation pass finished"
        );
        Ok(report)
    }
}
