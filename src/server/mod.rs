//! HTTP server
//!
//! Two routes over an unlocked repository: `GET /file/:fileId` streams a
//! decrypted object with headers derived from its metadata, and
//! `GET /api/tree/*path` returns a JSON listing of the directory tree.
//! File responses are produced through a pipe so the metadata callback can
//! set headers before the first body byte.

use crate::envelope::Metadata;
use crate::error::{Error, Result};
use crate::repo::Repository;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Run the server until ctrl-c
pub async fn serve(repo: Arc<Repository>, addr: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on http://{}", addr);

    axum::serve(listener, router(repo))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

/// Build the application router
pub fn router(repo: Arc<Repository>) -> Router {
    Router::new()
        .route("/file/:file_id", get(file_handler))
        .route("/api/tree", get(tree_root_handler))
        .route("/api/tree/", get(tree_root_handler))
        .route("/api/tree/*path", get(tree_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(repo)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {}", e);
    }
}

/// `GET /file/:fileId`: stream a decrypted object by id
async fn file_handler(
    State(repo): State<Arc<Repository>>,
    Path(file_id): Path<String>,
) -> Response {
    let object_id = match Uuid::parse_str(&file_id) {
        Ok(id) if id.get_version_num() == 4 => id,
        _ => return StatusCode::BAD_REQUEST.into_response(),
    };

    let (meta_tx, meta_rx) = oneshot::channel::<Metadata>();
    let (mut pipe_w, pipe_r) = tokio::io::duplex(64 * 1024);

    let stream_task = tokio::spawn({
        let repo = repo.clone();
        async move {
            let mut meta_tx = Some(meta_tx);
            let result = repo
                .get_object(&object_id, &mut pipe_w, move |metadata, _| {
                    if let Some(tx) = meta_tx.take() {
                        let _ = tx.send(metadata.clone());
                    }
                    true
                })
                .await;
            if let Err(e) = &result {
                debug!(%object_id, "file stream ended with error: {}", e);
            }
            result
        }
    });

    // Headers come from the decrypted metadata; if it never arrives the
    // object is missing or unreadable
    let metadata = match meta_rx.await {
        Ok(metadata) => metadata,
        Err(_) => {
            return match stream_task.await {
                Ok(Err(Error::BackendNotFound)) => StatusCode::NOT_FOUND.into_response(),
                _ => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
            };
        }
    };

    let content_type = if metadata.content_type.is_empty() {
        "application/octet-stream".to_string()
    } else {
        metadata.content_type.clone()
    };
    let mut disposition = "inline".to_string();
    if !metadata.name.is_empty() {
        disposition = format!("inline; filename=\"{}\"", metadata.name.replace('"', ""));
    }

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_DISPOSITION, disposition);
    if metadata.size > 0 {
        builder = builder.header(header::CONTENT_LENGTH, metadata.size.to_string());
    }

    match builder.body(Body::from_stream(ReaderStream::new(pipe_r))) {
        Ok(response) => response,
        Err(e) => {
            error!("failed to build file response: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// `GET /api/tree/*path`: JSON listing of a directory
async fn tree_handler(
    State(repo): State<Arc<Repository>>,
    Path(path): Path<String>,
) -> Response {
    let normalized = format!("/{}", path.trim_start_matches('/'));
    list_response(repo, &normalized).await
}

async fn tree_root_handler(State(repo): State<Arc<Repository>>) -> Response {
    list_response(repo, "/").await
}

async fn list_response(repo: Arc<Repository>, path: &str) -> Response {
    match repo.list(path).await {
        Ok(Some(entries)) => Json(entries).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            error!(path, "tree listing failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
