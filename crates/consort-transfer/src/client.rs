//! HTTP client side of the file channel.
//!
//! Every file moves in its own request; all files of a batch are in flight
//! at once. A request that fails on a dropped or refused connection is
//! retried after `base_delay × attempt`; any other failure aborts the batch.

use futures::future::try_join_all;
use futures::StreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, StatusCode};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, instrument, warn};

use crate::error::TransferError;

/// Default delay unit between retries.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(5);

/// Client for a node's `/transfer` endpoint.
#[derive(Clone, Debug)]
pub struct TransferClient {
    client: Client,
    endpoint: String,
    base_delay: Duration,
}

impl TransferClient {
    /// Client for `endpoint`, e.g. `http://localhost:3300/transfer`.
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            base_delay: DEFAULT_BASE_DELAY,
        }
    }

    /// Set the retry delay unit.
    #[must_use]
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Endpoint URL.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn with_retry<T, F, Fut>(&self, file: &str, limit: u32, op: F) -> Result<T, TransferError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, TransferError>>,
    {
        for attempt in 0..limit {
            if attempt > 0 {
                tokio::time::sleep(self.base_delay * attempt).await;
            }
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => {
                    debug!(file = %file, attempt, error = %e, "Retrying file request");
                }
                Err(e) => return Err(e),
            }
        }
        warn!(file = %file, limit, "File retry limit reached");
        Err(TransferError::RetryExhausted(file.to_string()))
    }

    /// Upload `files` from `directory`, tagged with the sender and run.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::RetryExhausted`] once a file has failed
    /// `limit` times on transient errors, or the first non-transient error.
    #[instrument(skip(self, files, directory), fields(files = files.len()))]
    pub async fn upload_files(
        &self,
        files: &[String],
        client_id: &str,
        run_id: &str,
        directory: &Path,
        limit: u32,
    ) -> Result<(), TransferError> {
        try_join_all(files.iter().map(|file| {
            self.with_retry(file, limit, move || {
                self.upload_one(file, client_id, run_id, directory)
            })
        }))
        .await?;
        Ok(())
    }

    async fn upload_one(
        &self,
        file: &str,
        client_id: &str,
        run_id: &str,
        directory: &Path,
    ) -> Result<(), TransferError> {
        let handle = File::open(directory.join(file)).await?;
        let size = handle.metadata().await?.len();
        debug!(file = %file, size, "Uploading file");

        let part = Part::stream(Body::wrap_stream(ReaderStream::new(handle)))
            .file_name(file.to_string());
        let form = Form::new()
            .text("clientId", client_id.to_string())
            .text("runId", run_id.to_string())
            .text("filename", file.to_string())
            .text("compressed", "true")
            .text("files", "[]")
            .part("file", part);

        let response = self.client.post(&self.endpoint).multipart(form).send().await?;
        check_status(file, response.status())
    }

    /// Download `files` into `directory`; returns their local paths.
    ///
    /// # Errors
    ///
    /// Same retry rules as [`TransferClient::upload_files`]; a missing file
    /// is a non-transient error.
    #[instrument(skip(self, files, directory), fields(files = files.len()))]
    pub async fn download_files(
        &self,
        files: &[String],
        client_id: &str,
        run_id: &str,
        directory: &Path,
        limit: u32,
    ) -> Result<Vec<PathBuf>, TransferError> {
        tokio::fs::create_dir_all(directory).await?;
        try_join_all(files.iter().map(|file| {
            self.with_retry(file, limit, move || {
                self.download_one(file, client_id, run_id, directory)
            })
        }))
        .await
    }

    async fn download_one(
        &self,
        file: &str,
        client_id: &str,
        run_id: &str,
        directory: &Path,
    ) -> Result<PathBuf, TransferError> {
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[("id", client_id), ("runId", run_id), ("file", file), ("files", "[]")])
            .send()
            .await?;
        check_status(file, response.status())?;

        let path = directory.join(file);
        let mut out = File::create(&path).await?;
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            out.write_all(&chunk?).await?;
        }
        out.flush().await?;
        debug!(file = %file, "Downloaded file");
        Ok(path)
    }
}

fn check_status(file: &str, status: StatusCode) -> Result<(), TransferError> {
    if status == StatusCode::OK {
        Ok(())
    } else {
        Err(TransferError::Status {
            file: file.to_string(),
            status: status.as_u16(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_retry_waits_longer_each_attempt() {
        let client = TransferClient::new("http://127.0.0.1:9/transfer");
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let started = tokio::time::Instant::now();

        let result = client
            .with_retry("a.tar.gz.0", 4, move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(TransferError::Io(std::io::ErrorKind::ConnectionRefused.into()))
                } else {
                    Ok(7)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(counter.load(Ordering::SeqCst), 4);
        // 5s + 10s + 15s
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(30) && waited < Duration::from_secs(31));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_limit() {
        let client = TransferClient::new("http://127.0.0.1:9/transfer");

        let result: Result<(), _> = client
            .with_retry("a.tar.gz.0", 3, || async {
                Err(TransferError::Io(std::io::ErrorKind::ConnectionReset.into()))
            })
            .await;

        assert!(matches!(result, Err(TransferError::RetryExhausted(f)) if f == "a.tar.gz.0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_retried() {
        let client = TransferClient::new("http://127.0.0.1:9/transfer");
        let counter = AtomicU32::new(0);
        let calls = &counter;

        let result: Result<(), _> = client
            .with_retry("a.tar.gz.0", 100, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TransferError::Status {
                    file: "a.tar.gz.0".into(),
                    status: 404,
                })
            })
            .await;

        assert!(matches!(result, Err(TransferError::Status { status: 404, .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
