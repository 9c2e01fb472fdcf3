// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// CUPS client speaking IPP to the local scheduler.
//
// Uses the `ipp` crate's async API:
//   - CUPS-Get-Printers        (CUPS extension)
//   - Get-Printer-Attributes   (RFC 8011 §4.2.5)
//   - Print-Job                (RFC 8011 §4.2.1)
//   - Get-Job-Attributes       (RFC 8011 §4.3.4)
//   - Get-Jobs                 (RFC 8011 §4.2.6)

use std::collections::BTreeMap;
use std::io::Cursor;

use async_trait::async_trait;
use ipp::prelude::*;
use tracing::{debug, error, info, instrument};

use cloudspool_core::ConnectorConfig;
use cloudspool_core::error::{CloudspoolError, Result};
use cloudspool_core::types::{JobOptions, LocalJobHandle, LocalJobStatus, LocalPrinter};

use crate::service::{LocalPrintService, LocalSubmission};

/// Local print service backed by a CUPS scheduler.
pub struct CupsClient {
    /// Scheduler base URI, e.g. `ipp://localhost:631`.
    server: String,
    server_uri: Uri,
    /// Attribute names copied into printer records.
    attributes: Vec<String>,
}

impl CupsClient {
    pub fn new(server: &str, attributes: Vec<String>) -> Result<Self> {
        let server = server.trim_end_matches('/').to_string();
        let server_uri: Uri = server
            .parse()
            .map_err(|e| CloudspoolError::Config(format!("invalid CUPS URI '{server}': {e}")))?;
        Ok(Self {
            server,
            server_uri,
            attributes,
        })
    }

    pub fn from_config(config: &ConnectorConfig) -> Result<Self> {
        Self::new(&config.cups_server_uri, config.printer_attributes())
    }

    /// URI of one queue on the scheduler.
    pub fn printer_uri(&self, printer: &str) -> Result<Uri> {
        let uri = format!("{}/printers/{printer}", self.server);
        uri.parse()
            .map_err(|e| CloudspoolError::LocalPrint(format!("invalid printer URI '{uri}': {e}")))
    }
}

fn request_failed(operation: &str, detail: impl std::fmt::Display) -> CloudspoolError {
    CloudspoolError::LocalPrint(format!("{operation}: {detail}"))
}

#[async_trait]
impl LocalPrintService for CupsClient {
    #[instrument(skip(self), fields(server = %self.server))]
    async fn list_printers(&self) -> Result<Vec<LocalPrinter>> {
        let operation = IppOperationBuilder::cups().get_printers();
        let client = AsyncIppClient::new(self.server_uri.clone());

        debug!("sending CUPS-Get-Printers");
        let response = client
            .send(operation)
            .await
            .map_err(|e| request_failed("CUPS-Get-Printers", e))?;

        if !response.header().status_code().is_success() {
            let code = response.header().status_code();
            error!(status = ?code, "CUPS-Get-Printers failed");
            return Err(request_failed("CUPS-Get-Printers", format!("status {code:?}")));
        }

        let printers: Vec<LocalPrinter> = response
            .attributes()
            .groups_of(DelimiterTag::PrinterAttributes)
            .filter_map(|group| {
                let attrs = group.attributes();
                printer_from_attributes(|name| attrs.get(name).map(|a| a.value()), &self.attributes)
            })
            .collect();

        debug!(count = printers.len(), "received printer list");
        Ok(printers)
    }

    #[instrument(skip(self))]
    async fn printer_attributes(&self, printer: &str) -> Result<BTreeMap<String, String>> {
        let uri = self.printer_uri(printer)?;
        let operation = IppOperationBuilder::get_printer_attributes(uri.clone())
            .attributes(self.attributes.as_slice())
            .build();
        let client = AsyncIppClient::new(uri);

        let response = client
            .send(operation)
            .await
            .map_err(|e| request_failed("Get-Printer-Attributes", e))?;

        if !response.header().status_code().is_success() {
            let code = response.header().status_code();
            error!(status = ?code, "Get-Printer-Attributes failed");
            return Err(CloudspoolError::PrinterGone(printer.to_string()));
        }

        let mut selected = BTreeMap::new();
        for group in response.attributes().groups_of(DelimiterTag::PrinterAttributes) {
            let attrs = group.attributes();
            selected.extend(select_attributes(
                |name| attrs.get(name).map(|a| a.value()),
                &self.attributes,
            ));
        }
        Ok(selected)
    }

    #[instrument(skip(self, submission), fields(title = %submission.title))]
    async fn submit_job(
        &self,
        printer: &str,
        submission: &LocalSubmission,
    ) -> Result<LocalJobHandle> {
        let attributes = option_attributes(&submission.options)?;
        let uri = self.printer_uri(printer)?;
        let document = tokio::fs::read(&submission.path).await?;
        let size = document.len();
        let payload = IppPayload::new(Cursor::new(document));

        let mut builder = IppOperationBuilder::print_job(uri.clone(), payload)
            .job_title(&submission.title)
            .document_format(&submission.content_type)
            .user_name(&submission.user_name);
        for attribute in attributes {
            builder = builder.attribute(attribute);
        }
        let operation = builder.build();
        let client = AsyncIppClient::new(uri);

        info!(bytes = size, mime = %submission.content_type, "sending Print-Job");
        let response = client
            .send(operation)
            .await
            .map_err(|e| request_failed("Print-Job", e))?;

        if !response.header().status_code().is_success() {
            let code = response.header().status_code();
            error!(status = ?code, "Print-Job failed");
            return Err(CloudspoolError::LocalJobFailed(format!(
                "Print-Job returned status {code:?}"
            )));
        }

        let job_id = extract_job_id(response.attributes()).ok_or_else(|| {
            CloudspoolError::LocalPrint("Print-Job response missing job-id attribute".into())
        })?;

        info!(job_id, "job accepted by local spooler");
        Ok(LocalJobHandle {
            printer: printer.to_string(),
            job_id,
        })
    }

    #[instrument(skip(self), fields(printer = %handle.printer, job_id = handle.job_id))]
    async fn poll_job_status(&self, handle: &LocalJobHandle) -> Result<LocalJobStatus> {
        let uri = self.printer_uri(&handle.printer)?;
        let operation = IppOperationBuilder::get_job_attributes(uri.clone(), handle.job_id).build();
        let client = AsyncIppClient::new(uri);

        let response = client
            .send(operation)
            .await
            .map_err(|e| request_failed("Get-Job-Attributes", e))?;

        if !response.header().status_code().is_success() {
            let code = response.header().status_code();
            error!(status = ?code, "Get-Job-Attributes failed");
            return Err(request_failed("Get-Job-Attributes", format!("status {code:?}")));
        }

        match response.attributes().groups_of(DelimiterTag::JobAttributes).next() {
            Some(group) => {
                let attrs = group.attributes();
                job_status(|name| attrs.get(name).map(|a| a.value()))
            }
            None => Err(request_failed(
                "Get-Job-Attributes",
                "no job attributes in response",
            )),
        }
    }

    #[instrument(skip(self))]
    async fn pending_job_count(&self, printer: &str) -> Result<usize> {
        let uri = self.printer_uri(printer)?;
        let operation = IppOperationBuilder::get_jobs(uri.clone()).build();
        let client = AsyncIppClient::new(uri);

        let response = client
            .send(operation)
            .await
            .map_err(|e| request_failed("Get-Jobs", e))?;

        if !response.header().status_code().is_success() {
            let code = response.header().status_code();
            error!(status = ?code, "Get-Jobs failed");
            return Err(request_failed("Get-Jobs", format!("status {code:?}")));
        }

        // Get-Jobs defaults to which-jobs=not-completed.
        let count = response
            .attributes()
            .groups_of(DelimiterTag::JobAttributes)
            .filter(|group| group.attributes().contains_key("job-id"))
            .count();
        Ok(count)
    }
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

/// Copy the wanted attributes that are present, rendered as strings.
fn select_attributes<'a>(
    lookup: impl Fn(&str) -> Option<&'a IppValue>,
    wanted: &[String],
) -> BTreeMap<String, String> {
    wanted
        .iter()
        .filter_map(|name| lookup(name).map(|value| (name.clone(), value.to_string())))
        .collect()
}

fn text<'a>(lookup: &impl Fn(&str) -> Option<&'a IppValue>, name: &str) -> Option<String> {
    lookup(name)
        .map(|v| v.to_string())
        .filter(|s| !s.trim().is_empty())
}

/// Build a printer from one CUPS-Get-Printers group; `None` without a name.
fn printer_from_attributes<'a>(
    lookup: impl Fn(&str) -> Option<&'a IppValue>,
    wanted: &[String],
) -> Option<LocalPrinter> {
    let name = text(&lookup, "printer-name")?;
    Some(LocalPrinter {
        info: text(&lookup, "printer-info").unwrap_or_default(),
        make_and_model: text(&lookup, "printer-make-and-model"),
        attributes: select_attributes(&lookup, wanted),
        name,
    })
}

/// Extract the `job-id` integer from a response's Job Attributes group.
fn extract_job_id(attrs: &IppAttributes) -> Option<i32> {
    for group in attrs.groups_of(DelimiterTag::JobAttributes) {
        if let Some(attr) = group.attributes().get("job-id")
            && let IppValue::Integer(id) = attr.value()
        {
            return Some(*id);
        }
    }
    None
}

/// Map RFC 8011 `job-state` onto the proxy's view.
///
/// 3 pending, 4 held, 5 processing, 6 stopped are still pending;
/// 7 canceled and 8 aborted are failures; 9 is completed.
fn job_status<'a>(lookup: impl Fn(&str) -> Option<&'a IppValue>) -> Result<LocalJobStatus> {
    let state = match lookup("job-state") {
        Some(IppValue::Enum(s)) | Some(IppValue::Integer(s)) => *s,
        _ => return Err(request_failed("Get-Job-Attributes", "missing job-state")),
    };
    let reason = text(&lookup, "job-state-message")
        .or_else(|| text(&lookup, "job-state-reasons"))
        .unwrap_or_else(|| format!("job-state {state}"));

    Ok(match state {
        7 => LocalJobStatus::Failed(format!("canceled: {reason}")),
        8 => LocalJobStatus::Failed(format!("aborted: {reason}")),
        9 => LocalJobStatus::Completed,
        _ => LocalJobStatus::Pending,
    })
}

// ---------------------------------------------------------------------------
// Ticket options
// ---------------------------------------------------------------------------

fn bad_option(key: &str, value: &str) -> CloudspoolError {
    CloudspoolError::UnsupportedTicket(format!("invalid value '{value}' for {key}"))
}

/// Turn validated ticket options into Print-Job attributes.
pub fn option_attributes(options: &JobOptions) -> Result<Vec<IppAttribute>> {
    options.validate()?;

    let mut attributes = Vec::with_capacity(options.0.len());
    for (key, value) in &options.0 {
        let ipp_value = match key.as_str() {
            "copies" => IppValue::Integer(value.parse().map_err(|_| bad_option(key, value))?),
            "orientation-requested" => IppValue::Enum(
                JobOptions::orientation(value).ok_or_else(|| bad_option(key, value))?,
            ),
            "page-ranges" => {
                let mut ranges: Vec<IppValue> = JobOptions::page_ranges(value)
                    .ok_or_else(|| bad_option(key, value))?
                    .into_iter()
                    .map(|(min, max)| IppValue::RangeOfInteger { min, max })
                    .collect();
                match ranges.len() {
                    1 => ranges.remove(0),
                    _ => IppValue::Array(ranges),
                }
            }
            "fit-to-page" => {
                IppValue::Boolean(JobOptions::flag(value).ok_or_else(|| bad_option(key, value))?)
            }
            _ => IppValue::Keyword(value.clone()),
        };
        attributes.push(IppAttribute::new(key, ipp_value));
    }
    Ok(attributes)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup<'a>(
        map: &'a HashMap<&'static str, IppValue>,
    ) -> impl Fn(&str) -> Option<&'a IppValue> + 'a {
        move |name| map.get(name)
    }

    fn options(pairs: &[(&str, &str)]) -> JobOptions {
        JobOptions(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn new_rejects_invalid_uri() {
        assert!(CupsClient::new("not a valid uri %%%", Vec::new()).is_err());
    }

    #[test]
    fn printer_uri_is_under_printers() {
        let client = CupsClient::new("ipp://localhost:631/", Vec::new()).unwrap();
        let uri = client.printer_uri("office-laser").unwrap();
        assert_eq!(uri.to_string(), "ipp://localhost:631/printers/office-laser");
    }

    #[test]
    fn printer_group_is_parsed_with_selected_attributes() {
        let map = HashMap::from([
            ("printer-name", IppValue::NameWithoutLanguage("laser".into())),
            ("printer-info", IppValue::TextWithoutLanguage("Front desk".into())),
            (
                "printer-make-and-model",
                IppValue::TextWithoutLanguage("HP LaserJet 4250".into()),
            ),
            ("color-supported", IppValue::Boolean(false)),
            ("printer-location", IppValue::TextWithoutLanguage("Lobby".into())),
        ]);
        let wanted = vec!["color-supported".to_string(), "media-supported".to_string()];

        let printer = printer_from_attributes(lookup(&map), &wanted).unwrap();
        assert_eq!(printer.name, "laser");
        assert_eq!(printer.info, "Front desk");
        assert!(!printer.is_raw());
        assert_eq!(printer.attributes.len(), 1);
        assert!(printer.attributes.contains_key("color-supported"));
    }

    #[test]
    fn nameless_group_is_skipped_and_raw_queue_detected() {
        let empty: HashMap<&'static str, IppValue> = HashMap::new();
        assert!(printer_from_attributes(lookup(&empty), &[]).is_none());

        let raw = HashMap::from([("printer-name", IppValue::NameWithoutLanguage("zebra".into()))]);
        assert!(printer_from_attributes(lookup(&raw), &[]).unwrap().is_raw());
    }

    #[test]
    fn job_state_mapping() {
        let state = |s: i32| HashMap::from([("job-state", IppValue::Enum(s))]);
        for pending in 3..=6 {
            assert_eq!(job_status(lookup(&state(pending))).unwrap(), LocalJobStatus::Pending);
        }
        assert_eq!(job_status(lookup(&state(9))).unwrap(), LocalJobStatus::Completed);

        let mut aborted = state(8);
        aborted.insert("job-state-message", IppValue::TextWithoutLanguage("media-jam".into()));
        match job_status(lookup(&aborted)).unwrap() {
            LocalJobStatus::Failed(reason) => assert!(reason.contains("media-jam")),
            other => panic!("expected failure, got {other:?}"),
        }

        let none: HashMap<&'static str, IppValue> = HashMap::new();
        assert!(job_status(lookup(&none)).is_err());
    }

    #[test]
    fn options_map_to_typed_ipp_values() {
        let attrs = option_attributes(&options(&[
            ("copies", "2"),
            ("orientation-requested", "landscape"),
            ("page-ranges", "1-3,5"),
            ("sides", "two-sided-long-edge"),
            ("fit-to-page", "true"),
        ]))
        .unwrap();

        let by_name: HashMap<_, _> = attrs.iter().map(|a| (a.name(), a.value())).collect();
        assert_eq!(by_name["copies"], &IppValue::Integer(2));
        assert_eq!(by_name["orientation-requested"], &IppValue::Enum(4));
        assert_eq!(by_name["fit-to-page"], &IppValue::Boolean(true));
        assert_eq!(
            by_name["sides"],
            &IppValue::Keyword("two-sided-long-edge".into())
        );
        assert_eq!(
            by_name["page-ranges"],
            &IppValue::Array(vec![
                IppValue::RangeOfInteger { min: 1, max: 3 },
                IppValue::RangeOfInteger { min: 5, max: 5 },
            ])
        );
    }

    #[test]
    fn malformed_option_values_are_rejected() {
        assert!(option_attributes(&options(&[("page-ranges", "5-2")])).is_err());
        assert!(option_attributes(&options(&[("orientation-requested", "sideways")])).is_err());
        assert!(option_attributes(&options(&[("staple", "yes")])).is_err());
    }

    #[tokio::test]
    async fn missing_payload_fails_before_contacting_spooler() {
        let dir = tempfile::tempdir().unwrap();
        let client = CupsClient::new("ipp://127.0.0.1:9", Vec::new()).unwrap();
        let submission = LocalSubmission {
            title: "report".into(),
            user_name: "alice".into(),
            content_type: "application/pdf".into(),
            options: JobOptions::default(),
            path: dir.path().join("missing.pdf"),
        };
        let err = client.submit_job("laser", &submission).await.unwrap_err();
        assert!(matches!(err, CloudspoolError::Io(_)));
    }
}
