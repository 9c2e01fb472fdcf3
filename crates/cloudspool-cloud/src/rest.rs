// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// HTTP implementation of `CloudPrint`.
//
// Every endpoint takes a form POST and answers with a JSON envelope:
//
//   {"success": true, "message": "…", ...endpoint fields...}
//
// Retry policy inside a single call: an HTTP 401 invalidates the cached
// token and repeats the request once; a transient failure (connect error,
// timeout, 408/429/5xx) is repeated once.  Anything else is returned.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::StatusCode;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument, warn};

use cloudspool_core::ConnectorConfig;
use cloudspool_core::error::{CloudspoolError, Result};
use cloudspool_core::types::{CloudJobStatus, Identity, JobId, JobTicket, PrinterRecord};

use crate::api::{CloudPrinter, CloudPrint, QueuedJob};
use crate::credentials::TokenSource;

/// Build the shared HTTP client used for token refresh and REST calls.
pub fn build_http_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(concat!("cloudspool/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| CloudspoolError::Config(format!("http client: {e}")))
}

fn transport_error(what: &str, e: reqwest::Error) -> CloudspoolError {
    if e.is_timeout() {
        CloudspoolError::Timeout(format!("{what}: {e}"))
    } else {
        CloudspoolError::Network(format!("{what}: {e}"))
    }
}

/// Common reply envelope.
#[derive(Debug, Deserialize)]
struct Reply<T> {
    success: bool,
    #[serde(default)]
    message: String,
    #[serde(flatten)]
    body: T,
}

#[derive(Debug, Deserialize)]
struct Empty {}

#[derive(Debug, Deserialize)]
struct PrinterList {
    #[serde(default)]
    printers: Vec<CloudPrinter>,
}

#[derive(Debug, Deserialize)]
struct JobList {
    #[serde(default)]
    jobs: Vec<QueuedJob>,
}

#[derive(Debug, Deserialize)]
struct TicketReply {
    job: JobTicket,
}

/// Cloud print REST client.
pub struct CloudClient {
    http: reqwest::Client,
    base_url: String,
    proxy: String,
    tokens: Arc<dyn TokenSource>,
}

impl CloudClient {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        proxy: impl Into<String>,
        tokens: Arc<dyn TokenSource>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            proxy: proxy.into(),
            tokens,
        }
    }

    pub fn from_config(
        config: &ConnectorConfig,
        http: reqwest::Client,
        tokens: Arc<dyn TokenSource>,
    ) -> Self {
        Self::new(http, &config.cloud_base_url, &config.proxy_name, tokens)
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{endpoint}", self.base_url)
    }

    /// Send a request built by `build`, applying the 401 and transient
    /// single-retry rules. Returns only successful responses.
    async fn execute<F>(&self, identity: Identity, what: &str, build: F) -> Result<reqwest::Response>
    where
        F: Fn(&str) -> reqwest::RequestBuilder + Send + Sync,
    {
        let mut auth_retried = false;
        let mut transient_retried = false;

        loop {
            let token = self.tokens.access_token(identity).await?;

            let err = match build(&token).send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) if response.status() == StatusCode::UNAUTHORIZED => {
                    if !auth_retried {
                        auth_retried = true;
                        debug!(what, %identity, "401 from cloud, refreshing token");
                        self.tokens.invalidate(identity).await;
                        continue;
                    }
                    CloudspoolError::Authentication {
                        identity,
                        detail: format!("{what}: rejected after token refresh"),
                    }
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    let body = response.text().await.unwrap_or_default();
                    CloudspoolError::HttpStatus { status, body }
                }
                Err(e) => transport_error(what, e),
            };

            if err.is_transient() && !transient_retried {
                transient_retried = true;
                warn!(what, error = %err, "transient cloud error, retrying once");
                continue;
            }
            return Err(err);
        }
    }

    /// POST a form and decode the reply envelope.
    async fn call<T: DeserializeOwned>(
        &self,
        identity: Identity,
        endpoint: &str,
        form: &[(&str, String)],
    ) -> Result<T> {
        let url = self.url(endpoint);
        let response = self
            .execute(identity, endpoint, |token| {
                self.http.post(&url).bearer_auth(token).form(form)
            })
            .await?;

        let text = response
            .text()
            .await
            .map_err(|e| transport_error(endpoint, e))?;
        let reply: Reply<T> = serde_json::from_str(&text)
            .map_err(|e| CloudspoolError::Protocol(format!("{endpoint}: malformed reply: {e}")))?;
        if !reply.success {
            return Err(CloudspoolError::CloudRejected(format!(
                "{endpoint}: {}",
                reply.message
            )));
        }
        Ok(reply.body)
    }

    fn printer_form(&self, printer: &PrinterRecord) -> Result<Vec<(&'static str, String)>> {
        Ok(vec![
            ("proxy", self.proxy.clone()),
            ("name", printer.name.clone()),
            ("display_name", printer.display_name.clone()),
            ("description", printer.info.clone()),
            ("capabilities", serde_json::to_string(&printer.attributes)?),
        ])
    }
}

#[async_trait]
impl CloudPrint for CloudClient {
    #[instrument(skip(self))]
    async fn list_printers(&self) -> Result<Vec<CloudPrinter>> {
        let list: PrinterList = self
            .call(Identity::Robot, "list", &[("proxy", self.proxy.clone())])
            .await?;
        Ok(list.printers)
    }

    #[instrument(skip_all, fields(printer = %printer.name))]
    async fn register_printer(&self, printer: &PrinterRecord) -> Result<String> {
        let form = self.printer_form(printer)?;
        let list: PrinterList = self.call(Identity::Robot, "register", &form).await?;
        list.printers
            .into_iter()
            .next()
            .map(|p| p.id)
            .ok_or_else(|| CloudspoolError::Protocol("register: reply has no printer".into()))
    }

    #[instrument(skip_all, fields(printer = %printer.name))]
    async fn update_printer(&self, printer: &PrinterRecord) -> Result<()> {
        let cloud_id = printer.cloud_id.clone().ok_or_else(|| {
            CloudspoolError::Protocol(format!("update: {} is not registered", printer.name))
        })?;
        let mut form = self.printer_form(printer)?;
        form.push(("printerid", cloud_id));
        let _: Empty = self.call(Identity::Robot, "update", &form).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_printer(&self, cloud_id: &str) -> Result<()> {
        let _: Empty = self
            .call(Identity::Robot, "delete", &[("printerid", cloud_id.to_string())])
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn share_printer(&self, cloud_id: &str, scope: &str) -> Result<()> {
        let form = [
            ("printerid", cloud_id.to_string()),
            ("scope", scope.to_string()),
            ("role", "USER".to_string()),
            ("skip_notification", "true".to_string()),
        ];
        let _: Empty = self.call(Identity::User, "share", &form).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_queued_jobs(&self, printer_id: &str) -> Result<Vec<QueuedJob>> {
        let list: JobList = self
            .call(Identity::Robot, "fetch", &[("printerid", printer_id.to_string())])
            .await?;
        Ok(list.jobs)
    }

    #[instrument(skip_all, fields(job = %job_id))]
    async fn fetch_job_ticket(&self, job_id: &JobId) -> Result<JobTicket> {
        let reply: TicketReply = self
            .call(Identity::Robot, "job", &[("jobid", job_id.to_string())])
            .await?;
        Ok(reply.job)
    }

    #[instrument(skip_all, fields(job = %ticket.job_id))]
    async fn download_payload(
        &self,
        ticket: &JobTicket,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64> {
        let response = self
            .execute(Identity::Robot, "download", |token| {
                self.http.get(&ticket.file_url).bearer_auth(token)
            })
            .await?;

        let expected = response.content_length();
        let mut body = response.bytes_stream();
        let mut written = 0u64;

        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    if let Some(expected) = expected
                        && written < expected
                    {
                        return Err(CloudspoolError::TruncatedPayload {
                            expected,
                            actual: written,
                        });
                    }
                    return Err(transport_error("download", e));
                }
            };
            sink.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        sink.flush().await?;

        if let Some(expected) = expected
            && written != expected
        {
            return Err(CloudspoolError::TruncatedPayload {
                expected,
                actual: written,
            });
        }

        debug!(bytes = written, "payload downloaded");
        Ok(written)
    }

    #[instrument(skip_all, fields(job = %job_id, status = status.as_str()))]
    async fn update_job_status(
        &self,
        job_id: &JobId,
        status: CloudJobStatus,
        message: Option<&str>,
    ) -> Result<()> {
        let mut form = vec![
            ("jobid", job_id.to_string()),
            ("status", status.as_str().to_string()),
        ];
        if let Some(message) = message {
            form.push(("message", message.to_string()));
        }
        let _: Empty = self.call(Identity::Robot, "control", &form).await?;
        Ok(())
    }
}
