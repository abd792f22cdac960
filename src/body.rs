//! The body of a response, over whatever the bytes come from.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::{Error, Result};
use crate::file::{FileSource, FileState};
use crate::message::HttpMessage;
use crate::range::Range;
use crate::stream::{ByteStream, MultipartEncoder, StreamMeta, StreamSlicer};

/// Default type of text bodies.
pub const TEXT_PLAIN_UTF8: &str = "text/plain; charset=UTF-8";

/// Deferred body. Invoked with the requested range, or `None` for the whole
/// content, and expected to slice its output itself.
pub type Producer = Arc<dyn Fn(Option<Range>) -> BoxFuture<'static, Result<HttpMessage>> + Send + Sync>;

/// A sized, typed source that can stream any window of itself.
pub trait Blob: Send + Sync + 'static {
    fn size(&self) -> Option<u64>;

    fn content_type(&self) -> Option<&str> {
        None
    }

    fn last_modified(&self) -> Option<SystemTime> {
        None
    }

    fn stream(&self, range: &Range) -> Result<ByteStream>;
}

enum Source {
    Empty,
    Bytes(Bytes),
    File(Arc<FileSource>),
    Blob(Arc<dyn Blob>),
    /// `None` once taken.
    Stream(Option<ByteStream>),
    Producer(Producer),
}

/// Materialized body data.
#[derive(Debug)]
pub enum BodyData {
    Bytes(Bytes),
    Stream(ByteStream),
}

impl BodyData {
    pub fn into_stream(self) -> ByteStream {
        match self {
            BodyData::Bytes(bytes) => ByteStream::once(bytes),
            BodyData::Stream(stream) => stream,
        }
    }
}

pub struct HttpBody {
    source: Source,
    content_length: Option<u64>,
    content_type: Option<String>,
    destroyed: bool,
}

impl HttpBody {
    fn with_source(source: Source, content_length: Option<u64>, content_type: Option<String>) -> Self {
        HttpBody { source, content_length, content_type, destroyed: false }
    }

    pub fn empty() -> Self {
        HttpBody::with_source(Source::Empty, Some(0), None)
    }

    pub fn bytes(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        let content_length = bytes.len() as u64;
        HttpBody::with_source(Source::Bytes(bytes), Some(content_length), None)
    }

    pub fn text(text: impl Into<String>) -> Self {
        HttpBody::bytes(text.into()).with_content_type(TEXT_PLAIN_UTF8)
    }

    pub fn file(file: FileSource) -> Self {
        let content_length = file.size();
        let content_type = Blob::content_type(&file).map(str::to_owned);
        HttpBody::with_source(Source::File(Arc::new(file)), content_length, content_type)
    }

    pub fn blob(blob: impl Blob) -> Self {
        let content_length = blob.size();
        let content_type = blob.content_type().map(str::to_owned);
        HttpBody::with_source(Source::Blob(Arc::new(blob)), content_length, content_type)
    }

    pub fn from_stream(stream: ByteStream) -> Self {
        let content_length = stream.size();
        let content_type = stream.content_type().map(str::to_owned);
        HttpBody::with_source(Source::Stream(Some(stream)), content_length, content_type)
    }

    pub fn producer<F, Fut>(produce: F) -> Self
    where
        F: Fn(Option<Range>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HttpMessage>> + Send + 'static,
    {
        let producer: Producer = Arc::new(move |range| produce(range).boxed());
        HttpBody::with_source(Source::Producer(producer), None, None)
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub(crate) fn or_content_type(mut self, content_type: Option<&str>) -> Self {
        if self.content_type.is_none() {
            self.content_type = content_type.map(str::to_owned);
        }
        self
    }

    pub fn has_body(&self) -> bool {
        !matches!(self.source, Source::Empty)
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn is_file(&self) -> bool {
        matches!(self.source, Source::File(_))
    }

    pub fn is_stream(&self) -> bool {
        matches!(self.source, Source::Stream(_))
    }

    pub fn is_producer(&self) -> bool {
        matches!(self.source, Source::Producer(_))
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// State of a file body, `None` for other sources.
    pub fn file_state(&self) -> Option<FileState> {
        match &self.source {
            Source::File(file) => Some(file.state()),
            _ => None,
        }
    }

    /// Natural modification time of file and blob sources.
    pub fn last_modified(&self) -> Option<SystemTime> {
        match &self.source {
            Source::File(file) => file.last_modified(),
            Source::Blob(blob) => blob.last_modified(),
            _ => None,
        }
    }

    pub(crate) fn producer_fn(&self) -> Option<Producer> {
        match &self.source {
            Source::Producer(producer) => Some(producer.clone()),
            _ => None,
        }
    }

    /// A second handle on the same content. Streams can be read only once and
    /// are never shared.
    pub fn try_clone(&self) -> Option<HttpBody> {
        let source = match &self.source {
            Source::Empty => Source::Empty,
            Source::Bytes(bytes) => Source::Bytes(bytes.clone()),
            Source::File(file) => Source::File(file.clone()),
            Source::Blob(blob) => Source::Blob(blob.clone()),
            Source::Producer(producer) => Source::Producer(producer.clone()),
            Source::Stream(_) => return None,
        };

        Some(HttpBody::with_source(source, self.content_length, self.content_type.clone()))
    }

    /// Materializes the selected window, the whole content when `range` is
    /// `None`.
    ///
    /// Fails for producers, which are resolved by the caller. A stream can be
    /// taken once; a window other than the full range goes through a
    /// [`StreamSlicer`].
    pub fn create_body(&mut self, range: Option<&Range>) -> Result<BodyData> {
        if self.destroyed {
            return Err(Error::BodyConsumed);
        }

        let full = Range::full();
        let range = range.unwrap_or(&full);
        let content_type = self.content_type.clone();

        match &mut self.source {
            Source::Producer(_) => Err(Error::BodyIsProducer),

            Source::Empty => Ok(BodyData::Bytes(Bytes::new())),

            Source::Bytes(bytes) => {
                let range = range.create_range(Some(bytes.len() as u64))?;

                if range.is_full_range() {
                    Ok(BodyData::Bytes(bytes.clone()))
                } else {
                    let start = range.offset() as usize;
                    let end = start + range.length().unwrap_or(0) as usize;
                    Ok(BodyData::Bytes(bytes.slice(start..end)))
                }
            }

            Source::File(file) => Ok(BodyData::Stream(retype(file.stream(range)?, content_type))),

            Source::Blob(blob) => Ok(BodyData::Stream(retype(blob.stream(range)?, content_type))),

            Source::Stream(stream) => {
                let stream = stream.take().ok_or(Error::BodyConsumed)?;

                if range.is_full_range() {
                    return Ok(BodyData::Stream(retype(stream, content_type)));
                }

                let range = range.create_range(self.content_length)?;
                let slicer = StreamSlicer::new(stream, &range)?;
                Ok(BodyData::Stream(retype(ByteStream::from_meta(slicer), content_type)))
            }
        }
    }

    /// Like [`create_body`](Self::create_body), lifting in-memory data into a
    /// one-shot stream.
    pub fn stream(&mut self, range: Option<&Range>) -> Result<ByteStream> {
        let content_type = self.content_type.clone();
        Ok(retype(self.create_body(range)?.into_stream(), content_type))
    }

    /// Releases the source. Safe to call more than once.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        if let Source::Stream(stream) = &mut self.source {
            if let Some(stream) = stream.take() {
                tracing::trace!(?stream, "destroying body stream");
            }
        }
    }
}

fn retype(stream: ByteStream, content_type: Option<String>) -> ByteStream {
    match content_type {
        Some(content_type) => stream.with_content_type(content_type),
        None => stream,
    }
}

impl Default for HttpBody {
    fn default() -> Self {
        HttpBody::empty()
    }
}

impl fmt::Debug for HttpBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.source {
            Source::Empty => "empty",
            Source::Bytes(_) => "bytes",
            Source::File(_) => "file",
            Source::Blob(_) => "blob",
            Source::Stream(_) => "stream",
            Source::Producer(_) => "producer",
        };

        f.debug_struct("HttpBody")
            .field("kind", &kind)
            .field("content_length", &self.content_length)
            .field("content_type", &self.content_type)
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

impl From<Bytes> for HttpBody {
    fn from(bytes: Bytes) -> Self {
        HttpBody::bytes(bytes)
    }
}

impl From<Vec<u8>> for HttpBody {
    fn from(bytes: Vec<u8>) -> Self {
        HttpBody::bytes(bytes)
    }
}

impl From<&'static [u8]> for HttpBody {
    fn from(bytes: &'static [u8]) -> Self {
        HttpBody::bytes(Bytes::from_static(bytes))
    }
}

impl From<String> for HttpBody {
    fn from(text: String) -> Self {
        HttpBody::text(text)
    }
}

impl From<&'static str> for HttpBody {
    fn from(text: &'static str) -> Self {
        HttpBody::text(text)
    }
}

impl From<FileSource> for HttpBody {
    fn from(file: FileSource) -> Self {
        HttpBody::file(file)
    }
}

impl From<ByteStream> for HttpBody {
    fn from(stream: ByteStream) -> Self {
        HttpBody::from_stream(stream)
    }
}

impl From<MultipartEncoder> for HttpBody {
    fn from(encoder: MultipartEncoder) -> Self {
        HttpBody::from_stream(encoder.into_stream())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use futures::stream;

    use super::*;
    use crate::range::RangeSpec;

    fn range(start: i64, end: i64) -> Range {
        RangeSpec::new().start(start).end(end).build().unwrap()
    }

    fn digits_stream(size: Option<u64>) -> ByteStream {
        let chunks = ["0123", "456", "789"].map(|chunk| Ok::<_, std::io::Error>(Bytes::from_static(chunk.as_bytes())));
        ByteStream::new(stream::iter(chunks)).with_size(size)
    }

    #[tokio::test]
    async fn test_bytes_body() {
        let mut body = HttpBody::from(&b"0123456789"[..]);
        assert_eq!(body.content_length(), Some(10));
        assert!(body.has_body());

        assert_matches!(body.create_body(None).unwrap(), BodyData::Bytes(b) if b == "0123456789");
        assert_matches!(body.create_body(Some(&range(2, 5))).unwrap(), BodyData::Bytes(b) if b == "234");
        assert_matches!(body.create_body(Some(&range(-3, 100))).unwrap(), BodyData::Bytes(b) if b == "789");

        let stream = body.stream(Some(&range(0, 4))).unwrap();
        assert_eq!(stream.size(), Some(4));
        assert_eq!(stream.collect_bytes().await.unwrap(), Bytes::from_static(b"0123"));
    }

    #[test]
    fn test_text_body() {
        let body = HttpBody::from("hello");
        assert_eq!(body.content_type(), Some(TEXT_PLAIN_UTF8));
        assert_eq!(body.content_length(), Some(5));

        let typed = HttpBody::text("x").with_content_type("text/html");
        assert_eq!(typed.content_type(), Some("text/html"));
        assert!(!HttpBody::empty().has_body());
    }

    #[tokio::test]
    async fn test_stream_body_is_taken_once() {
        let mut body = HttpBody::from_stream(digits_stream(Some(10)).with_content_type("text/plain"));
        assert!(body.is_stream());
        assert_eq!(body.content_type(), Some("text/plain"));
        assert!(body.try_clone().is_none());

        let stream = body.stream(None).unwrap();
        assert_eq!(stream.collect_bytes().await.unwrap(), Bytes::from_static(b"0123456789"));

        assert_matches!(body.create_body(None), Err(Error::BodyConsumed));
    }

    #[tokio::test]
    async fn test_stream_body_is_sliced() {
        let mut body = HttpBody::from_stream(digits_stream(Some(10)));
        let stream = body.stream(Some(&range(-4, -1))).unwrap();
        assert_eq!(stream.size(), Some(3));
        assert_eq!(stream.collect_bytes().await.unwrap(), Bytes::from_static(b"678"));

        // a relative window needs the size
        let mut body = HttpBody::from_stream(digits_stream(None));
        assert_matches!(body.create_body(Some(&range(-4, -1))), Err(Error::Range(_)));
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let mut body = HttpBody::from_stream(digits_stream(None));
        body.destroy();
        body.destroy();
        assert!(body.is_destroyed());
        assert_matches!(body.create_body(None), Err(Error::BodyConsumed));
    }

    #[tokio::test]
    async fn test_producer_body() {
        let mut body = HttpBody::producer(|range: Option<Range>| async move {
            let text = match range {
                Some(range) => format!("range {}", range.http_range().unwrap_or_default()),
                None => "full".to_string(),
            };
            Ok(HttpMessage::from(HttpBody::text(text)))
        });

        assert!(body.is_producer());
        assert_eq!(body.content_length(), None);
        assert_matches!(body.create_body(None), Err(Error::BodyIsProducer));

        let producer = body.producer_fn().unwrap();
        let mut message = producer(Some(range(0, 5))).await.unwrap();
        let data = message.create_body().unwrap().unwrap();
        assert_matches!(data, BodyData::Bytes(b) if b == "range 0-4");
    }
}
