// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Cloudspool Manager: printer reconciliation and the job dispatch pipeline.

pub mod dispatch;
pub mod manager;
pub mod payload;
pub mod reconcile;
pub mod retry;
pub mod tables;

#[cfg(test)]
mod fakes;

pub use dispatch::{Admission, DispatchConfig, Dispatcher, JobOutcome};
pub use manager::{PrinterManager, SnapshotReader};
pub use reconcile::{DiffOptions, PrinterDiff, ReconcileReport, Reconciler, diff_printers};
pub use retry::RetryPolicy;
pub use tables::{JobTable, PrinterTable};
