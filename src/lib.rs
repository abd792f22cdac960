//! # axum-delivery
//!
//! HTTP content delivery for [`axum`][1]: byte ranges, conditional requests,
//! compression and multipart streaming over any body source.
//!
//! A handler returns an [`HttpMessage`]. [`HttpMessage::prepare`] runs it
//! through the assembly stages for the incoming [`Request`]: missing files,
//! cache validators, deferred producers, `Range` and `Accept-Encoding`. The
//! result implements [`IntoResponse`](axum::response::IntoResponse).
//!
//! Bodies can be in-memory bytes, files ([`FileSource`]), any [`Blob`], a
//! one-shot [`ByteStream`] or a producer invoked with the requested range.
//!
//! ```
//! use axum::Router;
//! use axum::extract::State;
//! use axum::http::header;
//! use axum::routing::get;
//!
//! use std::sync::Arc;
//!
//! use axum_delivery::{DeliveryOptions, Error, FileSource, HttpMessage, Request};
//!
//! async fn file(State(options): State<Arc<DeliveryOptions>>, request: Request) -> Result<HttpMessage, Error> {
//!     let file = FileSource::open("document.txt").await?;
//!     let message = HttpMessage::from(file).with_header(header::ACCEPT_RANGES, "bytes");
//!
//!     message.prepare(&request, &options).await
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     // build our application with a single route
//!     let _app: Router = Router::new().route("/", get(file)).with_state(Arc::new(DeliveryOptions::default()));
//!
//!     // run it with hyper on localhost:3000
//!     #[cfg(feature = "run_server_in_example")]
//!     axum::serve(tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap(), _app)
//!        .await
//!        .unwrap();
//! }
//! ```
//!
//! Outside of axum, [`deliver`] writes a message to anything implementing
//! [`Socket`], honoring its backpressure.
//!
//! [1]: https://docs.rs/axum

pub mod body;
pub mod compress;
pub mod config;
pub mod deliver;
pub mod error;
pub mod file;
pub mod headers;
pub mod http_range;
pub mod large_object;
pub mod message;
pub mod range;
pub mod stream;
pub mod tmp;
pub mod transmit;

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::AsyncSeek;

pub use body::{Blob, BodyData, HttpBody};
pub use config::{Compress, CompressionOptions, DeliveryOptions};
pub use deliver::{deliver, Request};
pub use error::{Error, RangeError, Result};
pub use file::{FileSource, FileState};
pub use http_range::HttpRange;
pub use message::HttpMessage;
pub use range::{Range, RangeSpec};
pub use stream::{ByteStream, StreamJoiner, StreamSlicer};
pub use transmit::{Outcome, Socket};

/// [`AsyncSeek`] narrowed to only allow seeking from start.
pub trait AsyncSeekStart {
    /// Same semantics as [`AsyncSeek::start_seek`], always passing position as the `SeekFrom::Start` variant.
    fn start_seek(self: Pin<&mut Self>, position: u64) -> io::Result<()>;

    /// Same semantics as [`AsyncSeek::poll_complete`], returning `()` instead of the new stream position.
    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>>;
}

impl<T: AsyncSeek> AsyncSeekStart for T {
    fn start_seek(self: Pin<&mut Self>, position: u64) -> io::Result<()> {
        AsyncSeek::start_seek(self, io::SeekFrom::Start(position))
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        AsyncSeek::poll_complete(self, cx).map_ok(|_| ())
    }
}
