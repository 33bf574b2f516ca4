//! The browser UI: `index.html` and the assets under `environment/`, read
//! from the scripts root on every request.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path as AxumPath, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;

const INDEX_FILE: &str = "index.html";
const ASSETS_DIR: &str = "environment";

pub fn router(site_root: PathBuf) -> Router {
    Router::new()
        .route("/", get(handle_index))
        .route("/index.html", get(handle_index))
        .route("/environment/*path", get(handle_asset))
        .with_state(Arc::new(site_root))
}

async fn handle_index(State(root): State<Arc<PathBuf>>) -> Response {
    let path = root.join(INDEX_FILE);
    match tokio::fs::read(&path).await {
        Ok(contents) => file_response(&path, contents),
        Err(err) => {
            tracing::debug!(path = %path.display(), error = %err, "ui index unavailable");
            (
                StatusCode::NOT_FOUND,
                format!(
                    "{INDEX_FILE} not found under {}. The API is available under /api.\n",
                    root.display()
                ),
            )
                .into_response()
        }
    }
}

async fn handle_asset(
    State(root): State<Arc<PathBuf>>,
    AxumPath(path): AxumPath<String>,
) -> Response {
    let Some(relative) = sanitize(&path) else {
        tracing::warn!(path = %path, "rejected asset path");
        return StatusCode::NOT_FOUND.into_response();
    };
    let target = root.join(ASSETS_DIR).join(relative);
    match tokio::fs::read(&target).await {
        Ok(contents) => file_response(&target, contents),
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Only plain relative components; anything that could leave the assets
/// directory is refused.
fn sanitize(path: &str) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for component in Path::new(path.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if clean.as_os_str().is_empty() {
        return None;
    }
    Some(clean)
}

fn file_response(path: &Path, contents: Vec<u8>) -> Response {
    let mut response = Response::new(Body::from(contents));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(content_type_for(path)),
    );
    response
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("js") => "text/javascript; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        Some("ico") => "image/x-icon",
        Some("txt") => "text/plain; charset=utf-8",
        Some("woff2") => "font/woff2",
        _ => "application/octet-stream",
    }
}
