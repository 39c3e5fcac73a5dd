/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

//! A reference transfer target implementing the upload/download contract every benchmarked
//! server must follow:
//!
//! | Method | Path                   |
//! |--------|------------------------|
//! | GET    | `/health`              |
//! | POST   | `/upload/:file_id`     |
//! | GET    | `/download/:file_id`   |

mod errors;

pub use errors::ServerError;

use crate::file_set::validate_file_id;
use anyhow::Context;
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Path, State},
    http::header,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use bytes::Bytes;
use std::{io, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::{io::ReaderStream, sync::CancellationToken};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

#[derive(Clone)]
struct Storage {
    dir: Arc<PathBuf>,
}
impl Storage {
    fn path_of(&self, file_id: &str) -> Result<PathBuf, ServerError> {
        validate_file_id(file_id).map_err(|e| ServerError::InvalidFileId(e.to_string()))?;
        Ok(self.dir.join(file_id))
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn upload(
    State(storage): State<Storage>,
    Path(file_id): Path<String>,
    body: Bytes,
) -> Result<&'static str, ServerError> {
    let path = storage.path_of(&file_id)?;
    tokio::fs::write(&path, &body).await?;
    debug!("stored {} ({} bytes)", file_id, body.len());

    Ok("File uploaded successfully")
}

async fn download(
    State(storage): State<Storage>,
    Path(file_id): Path<String>,
) -> Result<Response, ServerError> {
    let path = storage.path_of(&file_id)?;
    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(ServerError::NotFound(file_id))
        }
        Err(err) => return Err(err.into()),
    };

    let headers = [
        (header::CONTENT_TYPE, "application/octet-stream".to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename={}", file_id),
        ),
    ];
    Ok((headers, Body::from_stream(ReaderStream::new(file))).into_response())
}

pub fn create_app(storage_dir: PathBuf) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/upload/:file_id", post(upload))
        .route("/download/:file_id", get(download))
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http())
        .with_state(Storage {
            dir: Arc::new(storage_dir),
        })
}

/// Serves the reference target on the given listener until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    storage_dir: PathBuf,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&storage_dir)
        .await
        .context(format!(
            "Unable to create storage dir {}",
            storage_dir.to_string_lossy()
        ))?;

    info!(
        "Starting reference transfer target on {}, storing files in {}",
        listener.local_addr()?,
        storage_dir.to_string_lossy()
    );

    let app = create_app(storage_dir);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Error serving transfer target")
}

/// A reference target running on a background task, stopped on `shutdown` or drop.
pub struct RunningServer {
    addr: SocketAddr,
    token: CancellationToken,
    handle: Option<JoinHandle<anyhow::Result<()>>>,
}
impl RunningServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            match tokio::time::timeout(Duration::from_secs(5), handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(err))) => warn!("reference target stopped with an error: {}", err),
                Ok(Err(err)) => warn!("reference target task failed: {}", err),
                Err(_) => warn!("reference target did not shut down in time"),
            }
        }
    }
}
impl Drop for RunningServer {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Starts a reference target on an ephemeral localhost port.
pub async fn spawn(storage_dir: PathBuf) -> anyhow::Result<RunningServer> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let token = CancellationToken::new();

    let handle = tokio::spawn(serve(listener, storage_dir, token.clone()));

    Ok(RunningServer {
        addr,
        token,
        handle: Some(handle),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::StatusCode;

    #[tokio::test]
    async fn health_reports_ok() -> anyhow::Result<()> {
        let storage = tempfile::tempdir()?;
        let server = spawn(storage.path().to_path_buf()).await?;

        let resp = reqwest::get(format!("{}/health", server.url())).await?;
        assert_eq!(resp.status(), StatusCode::OK);

        server.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn round_trip_is_byte_identical() -> anyhow::Result<()> {
        let storage = tempfile::tempdir()?;
        let server = spawn(storage.path().to_path_buf()).await?;
        let client = reqwest::Client::new();

        // bigger than axum's default body limit
        let content: Vec<u8> = (0..3 * 1024 * 1024).map(|i| (i % 251) as u8).collect();

        let resp = client
            .post(format!("{}/upload/large_text_file.txt", server.url()))
            .body(content.clone())
            .send()
            .await?;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = client
            .get(format!("{}/download/large_text_file.txt", server.url()))
            .send()
            .await?;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()
                .get(header::CONTENT_DISPOSITION)
                .and_then(|v| v.to_str().ok()),
            Some("attachment; filename=large_text_file.txt")
        );
        assert_eq!(resp.bytes().await?.to_vec(), content);

        server.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn unknown_file_is_not_found() -> anyhow::Result<()> {
        let storage = tempfile::tempdir()?;
        let server = spawn(storage.path().to_path_buf()).await?;

        let resp = reqwest::get(format!("{}/download/file_9.json", server.url())).await?;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        server.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn invalid_identifier_is_rejected() -> anyhow::Result<()> {
        let storage = tempfile::tempdir()?;
        let server = spawn(storage.path().to_path_buf()).await?;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("{}/upload/bad%20name.json", server.url()))
            .body("{}")
            .send()
            .await?;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(!storage.path().join("bad name.json").exists());

        server.shutdown().await;
        Ok(())
    }
}
