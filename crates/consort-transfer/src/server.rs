//! HTTP server side of the file channel.
//!
//! `POST <pathname>` takes a multipart form `{clientId, runId, filename,
//! compressed, files, file}`, writes the file into the directory the
//! [`TransferHandler`] picks and answers 200 before the handler processes
//! it. `GET <pathname>?id=&runId=&file=` streams a file back or answers 404.

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::error::TransferError;

/// Largest accepted request body.
pub const MAX_UPLOAD_BYTES: usize = 100 * 1024 * 1024;

/// Decides where transferred files live and learns about new ones.
#[async_trait]
pub trait TransferHandler: Send + Sync + 'static {
    /// Directory an upload from `client_id` for `run_id` is written to, or
    /// `None` for an unknown run.
    async fn staging_dir(&self, client_id: &str, run_id: &str) -> Option<PathBuf>;

    /// A file was written in full.
    async fn file_received(&self, client_id: &str, run_id: &str, filename: &str);

    /// Directory downloads for `client_id` and `run_id` are served from, or
    /// `None` for an unknown run.
    async fn served_dir(&self, client_id: &str, run_id: &str) -> Option<PathBuf>;
}

type SharedHandler = Arc<dyn TransferHandler>;

#[derive(Debug)]
enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };
        debug!(%status, %message, "Transfer request rejected");
        (status, message).into_response()
    }
}

impl From<std::io::Error> for ApiError {
    fn from(err: std::io::Error) -> Self {
        ApiError::Internal(err.to_string())
    }
}

fn check_file_name(name: &str) -> Result<(), ApiError> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\']) {
        return Err(ApiError::BadRequest(format!("Invalid file name: {name}")));
    }
    Ok(())
}

/// Build the transfer router mounted at `pathname`.
pub fn router(pathname: &str, handler: Arc<dyn TransferHandler>) -> Router {
    Router::new()
        .route(pathname, post(upload).get(download))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(handler)
}

async fn upload(
    State(handler): State<SharedHandler>,
    mut multipart: Multipart,
) -> Result<StatusCode, ApiError> {
    let mut fields: HashMap<String, String> = HashMap::new();
    let mut stored = None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name != "file" {
            let value = field
                .text()
                .await
                .map_err(|e| ApiError::BadRequest(e.to_string()))?;
            fields.insert(name, value);
            continue;
        }

        let (Some(client_id), Some(run_id)) = (fields.get("clientId"), fields.get("runId")) else {
            return Err(ApiError::BadRequest(
                "clientId and runId must precede the file part".into(),
            ));
        };
        let filename = fields
            .get("filename")
            .cloned()
            .or_else(|| field.file_name().map(str::to_string))
            .ok_or_else(|| ApiError::BadRequest("Missing filename".into()))?;
        check_file_name(&filename)?;

        let dir = handler
            .staging_dir(client_id, run_id)
            .await
            .ok_or_else(|| ApiError::NotFound(format!("No such pipeline run: {run_id}")))?;
        tokio::fs::create_dir_all(&dir).await?;

        let mut out = File::create(dir.join(&filename)).await?;
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|e| ApiError::BadRequest(e.to_string()))?
        {
            out.write_all(&chunk).await?;
        }
        out.flush().await?;
        stored = Some((client_id.clone(), run_id.clone(), filename));
    }

    let (client_id, run_id, filename) =
        stored.ok_or_else(|| ApiError::BadRequest("Missing file part".into()))?;
    debug!(client_id = %client_id, run_id = %run_id, file = %filename, "File received");

    tokio::spawn(async move {
        handler.file_received(&client_id, &run_id, &filename).await;
    });
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DownloadQuery {
    id: String,
    run_id: String,
    file: String,
}

async fn download(
    State(handler): State<SharedHandler>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response, ApiError> {
    check_file_name(&query.file)?;
    let dir = handler
        .served_dir(&query.id, &query.run_id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("No such pipeline run: {}", query.run_id)))?;

    let file = File::open(dir.join(&query.file))
        .await
        .map_err(|_| ApiError::NotFound(format!("No such file: {}", query.file)))?;
    let body = Body::from_stream(ReaderStream::new(file));

    Ok(([(header::CONTENT_TYPE, "application/octet-stream")], body).into_response())
}

/// A running file server.
pub struct TransferServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl TransferServer {
    /// Bind `addr` and serve the transfer endpoint at `pathname`.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::Server`] if the address cannot be bound.
    pub async fn bind(
        addr: SocketAddr,
        pathname: &str,
        handler: Arc<dyn TransferHandler>,
    ) -> Result<Self, TransferError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransferError::Server(format!("cannot bind {addr}: {e}")))?;
        let local_addr = listener.local_addr()?;
        let app = router(pathname, handler);

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await;
            if let Err(e) = result {
                error!(error = %e, "File server error");
            }
        });

        info!(addr = %local_addr, pathname = %pathname, "File server up");
        Ok(Self {
            local_addr,
            shutdown,
            task,
        })
    }

    /// Address actually bound.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting requests and wait for the server task.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            error!(error = %e, "File server task failed");
        }
    }
}
