//! Minimal HTTP endpoint that hands out files from one directory.

use crate::utils::plain_file_name;
use axum::body::Body;
use axum::extract::{Path as UrlPath, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid bind address {0}")]
    BadAddress(String),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("server error: {0}")]
    Serve(#[from] std::io::Error),
}

#[derive(Clone)]
struct ServerState {
    root: Arc<PathBuf>,
}

pub fn router(root: PathBuf) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/file/:file_name", get(serve_file))
        .with_state(ServerState { root: Arc::new(root) })
}

async fn ping() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn serve_file(
    State(state): State<ServerState>,
    UrlPath(file_name): UrlPath<String>,
) -> Result<Response, StatusCode> {
    let Some(name) = plain_file_name(&file_name) else {
        warn!("[server] Rejected file name {:?}", file_name);
        return Err(StatusCode::BAD_REQUEST);
    };

    let path = state.root.join(name);
    let metadata = match tokio::fs::metadata(&path).await {
        Ok(m) if m.is_file() => m,
        _ => {
            debug!("[server] {} not found", path.display());
            return Err(StatusCode::NOT_FOUND);
        }
    };
    let file = tokio::fs::File::open(&path).await.map_err(|e| {
        warn!("[server] Failed to open {}: {}", path.display(), e);
        StatusCode::NOT_FOUND
    })?;

    info!("[server] Serving {} ({} bytes)", path.display(), metadata.len());

    let disposition = format!("attachment; filename=\"{}\"", name.replace(['"', '\r', '\n'], "_"));
    let disposition = HeaderValue::from_str(&disposition)
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"));

    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("application/octet-stream")),
            (header::CONTENT_DISPOSITION, disposition),
            (header::CONTENT_LENGTH, HeaderValue::from(metadata.len())),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

/// Serve `root` on `bind` until `shutdown` resolves.
pub async fn serve<F>(bind: &str, root: PathBuf, shutdown: F) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr: SocketAddr = bind
        .parse()
        .map_err(|_| ServerError::BadAddress(bind.to_string()))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })?;

    info!("[server] Serving {} on http://{}", root.display(), addr);
    axum::serve(listener, router(root))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("[server] Stopped");
    Ok(())
}
