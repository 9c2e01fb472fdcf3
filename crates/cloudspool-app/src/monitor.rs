// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Diagnostic monitor: a Unix socket that answers every connection with one
// plain-text snapshot of the session state and the printer/job tables.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use cloudspool_cloud::SessionState;
use cloudspool_core::error::{CloudspoolError, Result};
use cloudspool_core::types::{JobState, ManagerSnapshot};
use cloudspool_manager::SnapshotReader;

/// Refuse to start when another connector already owns the socket path.
pub fn ensure_not_running(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if path.exists() {
        return Err(CloudspoolError::Config(format!(
            "{} exists; a connector is already running (remove the file if it is stale)",
            path.display()
        )));
    }
    Ok(())
}

/// Format a snapshot as `key=value` lines.
pub fn render_snapshot(session: &str, snapshot: &ManagerSnapshot) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "session={session}");
    let _ = writeln!(out, "printers={}", snapshot.printers.len());
    let _ = writeln!(out, "jobs-done={}", snapshot.counters.done);
    let _ = writeln!(out, "jobs-error={}", snapshot.counters.error);
    let _ = writeln!(out, "jobs-in-progress={}", snapshot.counters.in_progress);

    for printer in &snapshot.printers {
        let _ = writeln!(
            out,
            "printer {} cloud-id={} display-name={:?} raw={} shared={}",
            printer.name,
            printer.cloud_id.as_deref().unwrap_or("-"),
            printer.display_name,
            printer.raw,
            printer.share_scope.as_deref().unwrap_or("-"),
        );
    }
    for job in &snapshot.jobs {
        let _ = write!(
            out,
            "job {} printer-id={} state={:?} retries={}",
            job.id, job.printer_id, job.state, job.retry_count
        );
        if job.state == JobState::Failed
            && let Some(detail) = &job.last_error
        {
            let _ = write!(out, " error={detail:?}");
        }
        out.push('\n');
    }
    let _ = writeln!(out, "taken-at={}", snapshot.taken_at.to_rfc3339());
    out
}

/// Running monitor socket.
pub struct Monitor {
    path: PathBuf,
    shutdown: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl Monitor {
    /// Bind the socket and spawn the accept loop.
    pub fn start(
        path: impl AsRef<Path>,
        session: watch::Receiver<SessionState>,
        reader: SnapshotReader,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let listener = UnixListener::bind(&path).map_err(|e| {
            CloudspoolError::Config(format!("bind monitor socket {}: {e}", path.display()))
        })?;
        info!(path = %path.display(), "monitor listening");

        let shutdown = Arc::new(Notify::new());
        let task = tokio::spawn(accept_loop(listener, Arc::clone(&shutdown), session, reader));
        Ok(Self {
            path,
            shutdown,
            task: Some(task),
        })
    }

    /// Stop accepting and remove the socket file.
    pub async fn stop(mut self) {
        self.shutdown.notify_one();
        if let Some(task) = self.task.take()
            && let Err(e) = task.await
        {
            warn!(error = %e, "monitor task ended abnormally");
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "could not remove monitor socket");
        }
        info!("monitor stopped");
    }
}

async fn accept_loop(
    listener: UnixListener,
    shutdown: Arc<Notify>,
    session: watch::Receiver<SessionState>,
    reader: SnapshotReader,
) {
    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                debug!("monitor received shutdown signal");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let label = session.borrow().label();
                    let text = render_snapshot(label, &reader.snapshot());
                    tokio::spawn(async move {
                        if let Err(e) = reply(stream, text).await {
                            warn!(error = %e, "monitor client write failed");
                        }
                    });
                }
                Err(e) => error!(error = %e, "failed to accept monitor connection"),
            }
        }
    }
}

async fn reply(mut stream: UnixStream, text: String) -> std::io::Result<()> {
    stream.write_all(text.as_bytes()).await?;
    stream.shutdown().await
}
