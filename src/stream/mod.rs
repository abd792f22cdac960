//! Byte streams and the building blocks used to compose them.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use http_body::{Body, Frame, SizeHint};
use pin_project::pin_project;
use tokio::io::{AsyncRead, ReadBuf};

use crate::AsyncSeekStart;

pub mod joiner;
pub mod multipart;
pub mod slicer;

pub use joiner::{JoinItem, JoinWriter, Produced, StreamJoiner};
pub use multipart::{DecodedPart, MultipartDecoder, MultipartEncoder, Part};
pub use slicer::StreamSlicer;

const IO_BUFFER_SIZE: usize = 64 * 1024;

/// Metadata a byte stream may know about itself.
pub trait StreamMeta {
    /// Total number of bytes the stream will yield, when known up front.
    fn size(&self) -> Option<u64>;

    fn content_type(&self) -> Option<&str> {
        None
    }

    fn name(&self) -> Option<&str> {
        None
    }
}

/// Owned, type-erased byte stream. Implements [`Stream`], [`Body`] and
/// [`IntoResponse`].
///
/// Dropping the stream releases whatever it reads from.
pub struct ByteStream {
    inner: BoxStream<'static, io::Result<Bytes>>,
    size: Option<u64>,
    content_type: Option<String>,
    name: Option<String>,
}

impl ByteStream {
    pub fn new<S>(stream: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        ByteStream { inner: stream.boxed(), size: None, content_type: None, name: None }
    }

    /// Boxes a stream, keeping the metadata it reports.
    pub fn from_meta<S>(stream: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + StreamMeta + Send + 'static,
    {
        let size = stream.size();
        let content_type = stream.content_type().map(str::to_owned);
        let name = stream.name().map(str::to_owned);

        ByteStream { inner: stream.boxed(), size, content_type, name }
    }

    pub fn empty() -> Self {
        ByteStream::new(stream::empty()).with_size(Some(0))
    }

    /// A stream yielding `bytes` as its only chunk.
    pub fn once(bytes: Bytes) -> Self {
        let size = bytes.len() as u64;

        if bytes.is_empty() {
            return ByteStream::empty();
        }

        ByteStream::new(stream::once(async move { Ok(bytes) })).with_size(Some(size))
    }

    pub fn with_size(mut self, size: Option<u64>) -> Self {
        self.size = size;
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Reads the whole stream into memory.
    pub async fn collect_bytes(mut self) -> io::Result<Bytes> {
        let capacity = self.size.and_then(|size| usize::try_from(size).ok()).unwrap_or(0);
        let mut buffer = BytesMut::with_capacity(capacity.min(IO_BUFFER_SIZE * 16));

        while let Some(chunk) = self.next().await {
            buffer.extend_from_slice(&chunk?);
        }

        Ok(buffer.freeze())
    }
}

impl fmt::Debug for ByteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteStream")
            .field("size", &self.size)
            .field("content_type", &self.content_type)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl StreamMeta for ByteStream {
    fn size(&self) -> Option<u64> {
        self.size
    }

    fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl Stream for ByteStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl Body for ByteStream {
    type Data = Bytes;
    type Error = io::Error;

    fn size_hint(&self) -> SizeHint {
        match self.size {
            Some(size) => SizeHint::with_exact(size),
            None => SizeHint::default(),
        }
    }

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<io::Result<Frame<Bytes>>>> {
        self.poll_next(cx).map(|item| item.map(|result| result.map(Frame::data)))
    }
}

impl IntoResponse for ByteStream {
    fn into_response(self) -> Response {
        Response::new(axum::body::Body::new(self))
    }
}

/// Reads `length` bytes starting at `start` from a seekable reader.
#[pin_project]
pub struct RangedStream<R> {
    state: RangedState,
    length: u64,
    buffer: BytesMut,
    #[pin]
    reader: R,
}

#[derive(Debug, Clone, Copy)]
enum RangedState {
    Seek { start: u64 },
    Seeking,
    Reading { remaining: u64 },
    Done,
}

impl<R: AsyncRead + AsyncSeekStart> RangedStream<R> {
    pub fn new(reader: R, start: u64, length: u64) -> Self {
        RangedStream {
            state: RangedState::Seek { start },
            length,
            buffer: BytesMut::new(),
            reader,
        }
    }
}

impl<R> StreamMeta for RangedStream<R> {
    fn size(&self) -> Option<u64> {
        Some(self.length)
    }
}

impl<R: AsyncRead + AsyncSeekStart> Stream for RangedStream<R> {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<io::Result<Bytes>>> {
        let mut this = self.project();

        loop {
            match *this.state {
                RangedState::Seek { start } => {
                    if *this.length == 0 {
                        *this.state = RangedState::Done;
                        continue;
                    }

                    if let Err(e) = this.reader.as_mut().start_seek(start) {
                        *this.state = RangedState::Done;
                        return Poll::Ready(Some(Err(e)));
                    }
                    *this.state = RangedState::Seeking;
                }

                RangedState::Seeking => match this.reader.as_mut().poll_complete(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Err(e)) => {
                        *this.state = RangedState::Done;
                        return Poll::Ready(Some(Err(e)));
                    }
                    Poll::Ready(Ok(())) => {
                        *this.state = RangedState::Reading { remaining: *this.length };
                    }
                },

                RangedState::Reading { remaining: 0 } | RangedState::Done => {
                    *this.state = RangedState::Done;
                    return Poll::Ready(None);
                }

                RangedState::Reading { remaining } => {
                    let want = usize::try_from(remaining).unwrap_or(usize::MAX).min(IO_BUFFER_SIZE);
                    this.buffer.clear();
                    this.buffer.resize(want, 0);

                    // the read is capped at the rest of the range
                    let mut read_buf = ReadBuf::new(&mut this.buffer[..want]);
                    match this.reader.as_mut().poll_read(cx, &mut read_buf) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Err(e)) => {
                            *this.state = RangedState::Done;
                            return Poll::Ready(Some(Err(e)));
                        }
                        Poll::Ready(Ok(())) => {}
                    }
                    let n = read_buf.filled().len();

                    if n == 0 {
                        *this.state = RangedState::Done;
                        return Poll::Ready(Some(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("source ended {remaining} bytes before the end of the range"),
                        ))));
                    }

                    let chunk = this.buffer.split_to(n).freeze();
                    *this.state = RangedState::Reading { remaining: remaining - n as u64 };

                    return Poll::Ready(Some(Ok(chunk)));
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Cursor;

    use super::*;

    pub(crate) async fn collect_stream<S>(mut stream: S) -> String
    where
        S: Stream<Item = io::Result<Bytes>> + Unpin,
    {
        let mut string = String::new();
        while let Some(chunk) = stream.next().await {
            string += std::str::from_utf8(&chunk.unwrap()).unwrap();
        }
        string
    }

    fn digits() -> Cursor<Vec<u8>> {
        Cursor::new(b"0123456789".to_vec())
    }

    #[tokio::test]
    async fn test_ranged_stream_window() {
        let stream = Box::pin(RangedStream::new(digits(), 3, 4));
        assert_eq!(stream.size(), Some(4));
        assert_eq!("3456", collect_stream(stream).await);
    }

    #[tokio::test]
    async fn test_ranged_stream_stops_at_window_end() {
        let data: Vec<u8> = (0..IO_BUFFER_SIZE * 3).map(|i| (i % 251) as u8).collect();
        let length = IO_BUFFER_SIZE + 7;

        let mut stream = ByteStream::from_meta(RangedStream::new(Cursor::new(data.clone()), 5, length as u64));
        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next().await {
            chunks.push(chunk.unwrap());
        }

        assert!(chunks.iter().all(|chunk| chunk.len() <= IO_BUFFER_SIZE));
        assert_eq!(chunks.last().map(Bytes::len), Some(7));
        assert_eq!(chunks.concat(), data[5..5 + length]);
    }

    #[tokio::test]
    async fn test_ranged_stream_empty() {
        let stream = Box::pin(RangedStream::new(digits(), 10, 0));
        assert_eq!("", collect_stream(stream).await);
    }

    #[tokio::test]
    async fn test_ranged_stream_short_source() {
        let mut stream = Box::pin(RangedStream::new(digits(), 8, 5));
        assert_eq!(stream.next().await.unwrap().unwrap(), Bytes::from_static(b"89"));

        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_byte_stream_meta() {
        let stream = ByteStream::once(Bytes::from_static(b"hello"))
            .with_content_type("text/plain")
            .with_name("greeting.txt");

        assert_eq!(stream.size(), Some(5));
        assert_eq!(Body::size_hint(&stream).exact(), Some(5));
        assert_eq!(StreamMeta::content_type(&stream), Some("text/plain"));
        assert_eq!(stream.name(), Some("greeting.txt"));
        assert_eq!(stream.collect_bytes().await.unwrap(), Bytes::from_static(b"hello"));

        let boxed = ByteStream::from_meta(RangedStream::new(digits(), 0, 10));
        assert_eq!(boxed.size(), Some(10));
        assert_eq!("0123456789", collect_stream(boxed).await);

        assert_eq!(ByteStream::empty().size(), Some(0));
        assert_eq!(ByteStream::once(Bytes::new()).size(), Some(0));
    }
}
