// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Payload staging: stream a job payload into a temp file while computing its
// SHA-256 fingerprint.

use std::io;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tokio::io::AsyncWrite;
use tracing::debug;

use cloudspool_cloud::CloudPrint;
use cloudspool_core::error::Result;
use cloudspool_core::types::{JobTicket, PayloadRef};

/// `AsyncWrite` adapter that hashes everything written through it.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: AsyncWrite + Unpin> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    /// Bytes written and their lowercase hex SHA-256.
    pub fn finish(self) -> (u64, String) {
        (self.written, hex::encode(self.hasher.finalize()))
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for HashingWriter<W> {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.hasher.update(&buf[..n]);
                this.written += n as u64;
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// A downloaded payload. The file is deleted when this is dropped.
#[derive(Debug)]
pub struct StagedPayload {
    file: NamedTempFile,
    size: u64,
    sha256: String,
}

impl StagedPayload {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    pub fn payload_ref(&self) -> PayloadRef {
        PayloadRef::Fetched {
            path: self.file.path().to_path_buf(),
            size: self.size,
            sha256: self.sha256.clone(),
        }
    }
}

/// Download the ticket's payload into a fresh temp file.
pub async fn stage_payload(cloud: &dyn CloudPrint, ticket: &JobTicket) -> Result<StagedPayload> {
    let file = tempfile::Builder::new()
        .prefix("cloudspool-")
        .suffix(".job")
        .tempfile()?;
    let handle = tokio::fs::File::from_std(file.reopen()?);
    let mut sink = HashingWriter::new(handle);

    cloud.download_payload(ticket, &mut sink).await?;

    let (size, sha256) = sink.finish();
    debug!(job_id = %ticket.job_id, size, %sha256, "payload staged");
    Ok(StagedPayload { file, size, sha256 })
}
