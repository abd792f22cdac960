//! Serves files from a directory, generated text and in-memory large objects.
//!
//! ```text
//! cargo run --example serve -- ./public
//! curl -H 'Range: bytes=0-99' 'http://localhost:3000/file?path=index.html'
//! curl --data-binary @video.mp4 http://localhost:3000/objects
//! ```

use std::io;
use std::path::{Component, Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use futures::TryStreamExt;
use serde::Deserialize;

use axum_delivery::large_object::{LargeObjects, MemoryLargeObjectStore, Oid};
use axum_delivery::{ByteStream, Compress, DeliveryOptions, Error, FileSource, HttpBody, HttpMessage, Range, Request};

#[derive(Clone)]
struct AppState {
    options: Arc<DeliveryOptions>,
    root: Arc<PathBuf>,
    objects: LargeObjects<MemoryLargeObjectStore>,
}

#[derive(Debug, Deserialize)]
struct FileRequest {
    path: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let root = std::env::args().nth(1).map_or_else(|| PathBuf::from("."), PathBuf::from);
    let state = AppState {
        options: Arc::new(DeliveryOptions { compress: Compress::Threshold(1024), ..Default::default() }),
        root: Arc::new(root),
        objects: LargeObjects::new(MemoryLargeObjectStore::new()),
    };

    let router = Router::new()
        .route("/", get(|| async { "Hello, World!" }))
        .route("/file", get(get_file))
        .route("/generated", get(generated))
        .route("/objects", post(put_object))
        .route("/objects/{oid}", get(get_object))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
    tracing::info!(addr = %listener.local_addr().unwrap(), "listening");
    axum::serve(listener, router).await.unwrap();
}

fn is_contained(path: &FsPath) -> bool {
    path.components().all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

async fn get_file(State(state): State<AppState>, Query(q): Query<FileRequest>, request: Request) -> Result<HttpMessage, Error> {
    let relative = PathBuf::from(q.path.trim_start_matches('/'));
    if !is_contained(&relative) {
        return Ok(HttpMessage::new(StatusCode::NOT_FOUND));
    }

    let file = FileSource::open(state.root.join(relative)).await?;
    HttpMessage::from(file)
        .with_header(header::ACCEPT_RANGES, "bytes")
        .prepare(&request, &state.options)
        .await
}

async fn generated(State(state): State<AppState>, request: Request) -> Result<HttpMessage, Error> {
    let body = HttpBody::producer(|range: Option<Range>| async move {
        let text: String = (0..1000).map(|n| format!("line {n:04}\n")).collect();
        let bytes = Bytes::from(text);

        let bytes = match range {
            Some(range) => {
                let range = range.create_range(Some(bytes.len() as u64))?;
                let start = range.offset() as usize;
                bytes.slice(start..start + range.length().unwrap_or(0) as usize)
            }
            None => bytes,
        };

        Ok(HttpMessage::from(HttpBody::bytes(bytes).with_content_type("text/plain")))
    });

    HttpMessage::from(body)
        .with_header(header::ACCEPT_RANGES, "bytes")
        .with_compress(true)
        .prepare(&request, &state.options)
        .await
}

async fn put_object(State(state): State<AppState>, body: Body) -> Result<String, Error> {
    let upload = ByteStream::new(body.into_data_stream().map_err(io::Error::other));
    let oid = state.objects.write(upload, None).await?;
    Ok(oid.to_string())
}

async fn get_object(State(state): State<AppState>, Path(oid): Path<Oid>, request: Request) -> Result<HttpMessage, Error> {
    let blob = state.objects.blob(oid).await?.with_content_type("application/octet-stream");

    HttpMessage::from(HttpBody::blob(blob))
        .with_header(header::ACCEPT_RANGES, "bytes")
        .prepare(&request, &state.options)
        .await
}
