//! Response assembly.
//!
//! An [`HttpMessage`] is a response in progress. The `check_*` stages are run
//! in a fixed order by [`HttpMessage::prepare`](crate::deliver) and each may
//! downgrade the status and drop the body; later stages see the result.

use std::fmt;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum_extra::headers::{HeaderMapExt, LastModified};
use bytes::Bytes;

use crate::body::{BodyData, HttpBody};
use crate::compress::{compress_stream, is_compressible, Encoding};
use crate::config::{Compress, CompressionOptions};
use crate::error::Result;
use crate::file::{FileSource, FileState};
use crate::headers::{is_weak, IfRange, RequestHeaders};
use crate::http_range::RangeOptions;
use crate::stream::ByteStream;

/// Options of [`HttpMessage::check_http_range`].
#[derive(Debug, Clone, Copy)]
pub struct RangeCheck {
    /// Build the ranged body. Off for `HEAD`, where only headers matter.
    pub create_body: bool,
    pub max_ranges: usize,
}

/// Options of [`HttpMessage::check_compression`]. The message's own settings
/// take precedence.
#[derive(Debug, Clone, Copy)]
pub struct CompressionCheck {
    pub create_body: bool,
    pub compress: Compress,
    pub compression: CompressionOptions,
    pub default_encoding: Encoding,
}

pub struct HttpMessage {
    status: StatusCode,
    headers: HeaderMap,
    body: Option<HttpBody>,
    compress: Option<Compress>,
    compression: Option<CompressionOptions>,
    last_modified: OnceLock<Option<SystemTime>>,
}

impl HttpMessage {
    pub fn new(status: StatusCode) -> Self {
        HttpMessage {
            status,
            headers: HeaderMap::new(),
            body: None,
            compress: None,
            compression: None,
            last_modified: OnceLock::new(),
        }
    }

    pub fn ok() -> Self {
        HttpMessage::new(StatusCode::OK)
    }

    pub fn with_body(mut self, body: impl Into<HttpBody>) -> Self {
        self.set_body(body.into(), false);
        self
    }

    pub fn with_header<V: TryInto<HeaderValue>>(mut self, name: HeaderName, value: V) -> Self {
        self.set_header(name, value);
        self
    }

    pub fn with_last_modified(mut self, modified: SystemTime) -> Self {
        self.headers.typed_insert(LastModified::from(modified));
        self.last_modified = OnceLock::new();
        self
    }

    /// Per-response override of the server compression setting.
    pub fn with_compress(mut self, compress: impl Into<Compress>) -> Self {
        self.compress = Some(compress.into());
        self
    }

    pub fn with_compression(mut self, compression: CompressionOptions) -> Self {
        self.compression = Some(compression);
        self
    }

    /// Invalid values are dropped.
    pub fn set_header<V: TryInto<HeaderValue>>(&mut self, name: HeaderName, value: V) {
        match value.try_into() {
            Ok(value) => {
                self.headers.insert(name, value);
            }
            Err(_) => tracing::warn!(%name, "dropping invalid header value"),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn set_status(&mut self, status: StatusCode) {
        self.status = status;
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_success()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn body(&self) -> Option<&HttpBody> {
        self.body.as_ref()
    }

    pub fn has_body(&self) -> bool {
        self.body.as_ref().is_some_and(HttpBody::has_body)
    }

    pub fn into_body(self) -> Option<HttpBody> {
        self.body
    }

    /// Removes the body without touching the headers describing it.
    pub fn take_body(&mut self) -> Option<HttpBody> {
        self.body.take()
    }

    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get(header::CONTENT_LENGTH)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(header::CONTENT_TYPE).and_then(|value| value.to_str().ok())
    }

    pub fn etag(&self) -> Option<&str> {
        self.headers.get(header::ETAG).and_then(|value| value.to_str().ok())
    }

    /// `Last-Modified` header, else the modification time of a file or blob
    /// body. Computed once.
    pub fn last_modified(&self) -> Option<SystemTime> {
        *self.last_modified.get_or_init(|| {
            self.headers
                .typed_get::<LastModified>()
                .map(SystemTime::from)
                .or_else(|| self.body.as_ref().and_then(HttpBody::last_modified))
        })
    }

    /// Replaces the body and rewrites `Content-Length` / `Content-Type` to
    /// describe it. `destroy` releases the previous body first.
    pub fn set_body(&mut self, body: HttpBody, destroy: bool) {
        let body = body.or_content_type(self.content_type());

        if !body.has_body() {
            self.delete_body();
            return;
        }

        if destroy {
            self.delete_body();
        }

        match body.content_length() {
            Some(length) => self.set_header(header::CONTENT_LENGTH, length),
            None => {
                self.headers.remove(header::CONTENT_LENGTH);
            }
        }
        match body.content_type().map(str::to_owned) {
            Some(content_type) => self.set_header(header::CONTENT_TYPE, content_type),
            None => {
                self.headers.remove(header::CONTENT_TYPE);
            }
        }

        self.body = Some(body);
        self.last_modified = OnceLock::new();
    }

    pub fn delete_body(&mut self) {
        if let Some(mut body) = self.body.take() {
            body.destroy();
        }

        self.headers.remove(header::CONTENT_LENGTH);
        self.headers.remove(header::CONTENT_TYPE);
    }

    fn drop_body(&mut self, status: StatusCode) {
        tracing::debug!(from = %self.status, to = %status, "dropping response body");
        self.status = status;
        self.delete_body();
    }

    /// A successful response for a file that does not exist becomes a 404.
    /// Files whose state was never looked up are left alone.
    pub fn check_body(&mut self) {
        if self.is_ok() && self.body.as_ref().and_then(HttpBody::file_state) == Some(FileState::Absent) {
            self.drop_body(StatusCode::NOT_FOUND);
        }
    }

    /// Conditional request validation.
    pub fn check_cache(&mut self, request: &RequestHeaders, method: &Method) {
        if !self.is_ok() {
            return;
        }

        let last_modified = self.last_modified();
        if let Some(modified) = last_modified {
            self.headers.typed_insert(LastModified::from(modified));
        }

        let safe = method == Method::GET || method == Method::HEAD;
        let etag = self.etag().map(str::to_owned);

        if let (Some(etag), Some(tags)) = (&etag, &request.if_match) {
            // strong comparison, a weak tag never matches
            if is_weak(etag) || !(tags.is_any() || tags.contains(etag)) {
                return self.drop_body(StatusCode::PRECONDITION_FAILED);
            }
        }

        if let (Some(etag), Some(tags)) = (&etag, &request.if_none_match) {
            if tags.is_any() || tags.contains_weak(etag) {
                let status = if safe { StatusCode::NOT_MODIFIED } else { StatusCode::PRECONDITION_FAILED };
                return self.drop_body(status);
            }
        }

        if let (true, Some(modified), Some(since)) = (safe, last_modified, request.if_modified_since) {
            if unix_secs(modified) <= unix_secs(since) {
                return self.drop_body(StatusCode::NOT_MODIFIED);
            }
        }

        if let (Some(modified), Some(since)) = (last_modified, request.if_unmodified_since) {
            if unix_secs(modified) > unix_secs(since) {
                self.drop_body(StatusCode::PRECONDITION_FAILED);
            }
        }
    }

    /// Resolves a producer body by invoking it without a range and adopting
    /// the message it returns.
    pub async fn check_body_function(&mut self) -> Result<()> {
        let Some(producer) = self.body.as_ref().and_then(HttpBody::producer_fn) else {
            return Ok(());
        };

        let HttpMessage { status, headers, body, .. } = producer(None).await?;
        tracing::trace!(%status, "producer resolved");

        self.status = status;
        self.replace_headers(headers);
        self.set_body(body.unwrap_or_default(), true);
        self.check_body();

        Ok(())
    }

    fn if_range_passes(&self, if_range: Option<&IfRange>) -> bool {
        match if_range {
            None => true,
            Some(IfRange::Date(date)) => match self.last_modified() {
                Some(modified) => unix_secs(modified) <= unix_secs(*date),
                None => true,
            },
            Some(IfRange::ETag(tag)) if tag == "*" => true,
            Some(IfRange::ETag(tag)) => match self.etag() {
                Some(etag) => !is_weak(etag) && etag == tag,
                None => true,
            },
        }
    }

    /// Honors the `Range` header of the request.
    pub async fn check_http_range(&mut self, request: &RequestHeaders, options: RangeCheck) -> Result<()> {
        if !self.has_body() {
            return Ok(());
        }

        let accepts_ranges = self
            .headers
            .get(header::ACCEPT_RANGES)
            .is_some_and(|value| value.as_bytes().eq_ignore_ascii_case(b"bytes"));
        if !accepts_ranges {
            return Ok(());
        }

        if self.status == StatusCode::PARTIAL_CONTENT || self.status == StatusCode::RANGE_NOT_SATISFIABLE {
            return Ok(());
        }

        let Some(http_range) = &request.range else {
            return Ok(());
        };

        if !self.if_range_passes(request.if_range.as_ref()) {
            tracing::trace!("If-Range failed, sending the full body");
            return Ok(());
        }

        let range_options = RangeOptions {
            max_ranges: Some(options.max_ranges),
            content_type: self.content_type().map(str::to_owned),
            content_length: None,
            create_body: options.create_body,
        };
        let Some(body) = self.body.as_mut() else {
            return Ok(());
        };

        let HttpMessage { status, headers, body: ranged, .. } = http_range.create_http_message(body, range_options).await?;

        self.status = status;
        if !headers.contains_key(header::CONTENT_LENGTH) {
            self.headers.remove(header::CONTENT_LENGTH);
        }
        self.replace_headers(headers);

        if !self.is_ok() {
            self.delete_body();
        } else if options.create_body {
            self.set_body(ranged.unwrap_or_default(), false);
        }

        Ok(())
    }

    /// Negotiates a content coding and, when `create_body` is set, pipes the
    /// body through the encoder.
    pub fn check_compression(&mut self, request: &RequestHeaders, options: CompressionCheck) -> Result<()> {
        if !self.has_body() {
            return Ok(());
        }

        let compress = self.compress.unwrap_or(options.compress);
        if !compress.is_enabled() || self.headers.contains_key(header::CONTENT_ENCODING) {
            return Ok(());
        }

        self.add_vary("Accept-Encoding");

        if !compress.admits(self.content_length()) {
            return Ok(());
        }

        if !self.content_type().is_some_and(is_compressible) {
            return Ok(());
        }

        let Some(accept) = &request.accept_encoding else {
            return Ok(());
        };

        let encoding = match Encoding::negotiate(accept.iter()) {
            Some(encoding) => encoding,
            None if accept.accepts_any() => options.default_encoding,
            None => return Ok(()),
        };
        if encoding == Encoding::Identity {
            return Ok(());
        }

        tracing::debug!(%encoding, "compressing response");
        self.set_header(header::CONTENT_ENCODING, encoding.as_str());

        if options.create_body {
            let compression = self.compression.unwrap_or(options.compression);

            if let Some(body) = self.body.as_mut() {
                let compressed = compress_stream(body.stream(None)?, encoding, &compression);
                self.set_body(HttpBody::from_stream(compressed), false);
            }
        } else {
            self.headers.remove(header::CONTENT_LENGTH);
        }

        Ok(())
    }

    /// Final materialization of the body.
    pub fn create_body(&mut self) -> Result<Option<BodyData>> {
        match self.body.as_mut() {
            Some(body) if body.has_body() => body.create_body(None).map(Some),
            _ => Ok(None),
        }
    }

    fn replace_headers(&mut self, headers: HeaderMap) {
        for name in headers.keys() {
            self.headers.remove(name);
        }
        for (name, value) in &headers {
            self.headers.append(name, value.clone());
        }
    }

    fn add_vary(&mut self, field: &'static str) {
        let present = self.headers.get_all(header::VARY).iter().any(|value| {
            value
                .to_str()
                .is_ok_and(|value| value.split(',').any(|item| item.trim().eq_ignore_ascii_case(field) || item.trim() == "*"))
        });

        if !present {
            self.headers.append(header::VARY, HeaderValue::from_static(field));
        }
    }
}

fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).map_or(0, |elapsed| elapsed.as_secs())
}

impl Default for HttpMessage {
    fn default() -> Self {
        HttpMessage::ok()
    }
}

impl fmt::Debug for HttpMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpMessage")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body", &self.body)
            .finish_non_exhaustive()
    }
}

impl From<StatusCode> for HttpMessage {
    fn from(status: StatusCode) -> Self {
        HttpMessage::new(status)
    }
}

impl From<HttpBody> for HttpMessage {
    fn from(body: HttpBody) -> Self {
        HttpMessage::ok().with_body(body)
    }
}

impl From<(StatusCode, HttpBody)> for HttpMessage {
    fn from((status, body): (StatusCode, HttpBody)) -> Self {
        HttpMessage::new(status).with_body(body)
    }
}

impl From<Bytes> for HttpMessage {
    fn from(bytes: Bytes) -> Self {
        HttpMessage::from(HttpBody::from(bytes))
    }
}

impl From<&'static [u8]> for HttpMessage {
    fn from(bytes: &'static [u8]) -> Self {
        HttpMessage::from(HttpBody::from(bytes))
    }
}

impl From<String> for HttpMessage {
    fn from(text: String) -> Self {
        HttpMessage::from(HttpBody::from(text))
    }
}

impl From<&'static str> for HttpMessage {
    fn from(text: &'static str) -> Self {
        HttpMessage::from(HttpBody::from(text))
    }
}

impl From<FileSource> for HttpMessage {
    fn from(file: FileSource) -> Self {
        HttpMessage::from(HttpBody::from(file))
    }
}

impl From<ByteStream> for HttpMessage {
    fn from(stream: ByteStream) -> Self {
        HttpMessage::from(HttpBody::from(stream))
    }
}

impl IntoResponse for HttpMessage {
    fn into_response(mut self) -> Response {
        let body = match self.create_body() {
            Ok(None) => axum::body::Body::empty(),
            Ok(Some(BodyData::Bytes(bytes))) => axum::body::Body::from(bytes),
            Ok(Some(BodyData::Stream(stream))) => axum::body::Body::new(stream),
            Err(e) => {
                tracing::warn!(error = %e, "failed to create response body");
                return StatusCode::INTERNAL_SERVER_ERROR.into_response();
            }
        };

        let mut response = Response::new(body);
        *response.status_mut() = self.status;
        *response.headers_mut() = std::mem::take(&mut self.headers);
        response
    }
}
