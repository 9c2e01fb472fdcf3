// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Cloudspool CUPS: the local print service, with printer listing, job submission,
// and job status polling against a CUPS scheduler over IPP.

pub mod cups_client;
pub mod service;

pub use cups_client::CupsClient;
pub use service::{LocalPrintService, LocalSubmission};
