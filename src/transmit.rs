//! Drains a body stream into a socket that pushes back.

use std::future::poll_fn;
use std::io;
use std::task::{Context, Poll};

use axum::http::header::{HeaderName, HeaderValue};
use axum::http::StatusCode;
use bytes::Bytes;
use futures::StreamExt;

use crate::stream::ByteStream;

/// The write side of an HTTP/1.1 response.
///
/// Writes never block. A socket that cannot take more data reports it through
/// the return value and wakes [`poll_writable`](Socket::poll_writable) once it
/// has drained.
pub trait Socket {
    fn write_status(&mut self, status: StatusCode);

    fn write_header(&mut self, name: &HeaderName, value: &HeaderValue);

    /// Writes `chunk` of a body of `total` bytes, ending the response with the
    /// last byte. Returns `(ok, done)`: whether the whole chunk was accepted,
    /// and whether the response is complete. A rejected tail is not buffered;
    /// resend it from [`write_offset`](Socket::write_offset).
    fn try_end(&mut self, chunk: &[u8], total: u64) -> (bool, bool);

    /// Chunked write. The chunk is always buffered; `false` asks the caller to
    /// pause until writable.
    fn write(&mut self, chunk: &[u8]) -> bool;

    fn end(&mut self, body: &[u8]);

    fn end_without_body(&mut self);

    /// Body bytes accepted so far.
    fn write_offset(&self) -> u64;

    /// Drops the connection.
    fn close(&mut self);

    /// Ready with the write offset once the socket drained.
    fn poll_writable(&mut self, cx: &mut Context<'_>) -> Poll<u64>;

    /// Ready once the client went away.
    fn poll_aborted(&mut self, cx: &mut Context<'_>) -> Poll<()>;
}

/// How a transmission ended.
#[derive(Debug)]
pub enum Outcome {
    Completed,
    /// The client aborted, the source was dropped.
    Aborted,
    /// The source failed or ended short, the connection was closed.
    Failed(io::Error),
}

impl Outcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed)
    }
}

enum Event<T> {
    Ready(T),
    Aborted,
}

async fn next_event<S, F, T>(socket: &mut S, mut poll: F) -> Event<T>
where
    S: Socket + ?Sized,
    F: FnMut(&mut S, &mut Context<'_>) -> Poll<T>,
{
    poll_fn(|cx| {
        if socket.poll_aborted(cx).is_ready() {
            return Poll::Ready(Event::Aborted);
        }
        poll(socket, cx).map(Event::Ready)
    })
    .await
}

/// Writes `stream` to `socket`.
///
/// With a `content_length` the body goes out through
/// [`try_end`](Socket::try_end) and rejected bytes are resent from the
/// acknowledged offset; without one it is written chunked and terminated
/// when the stream ends. The source is dropped on every exit.
pub async fn transmit<S: Socket + ?Sized>(socket: &mut S, mut stream: ByteStream, content_length: Option<u64>) -> Outcome {
    loop {
        let chunk = match next_event(socket, |_, cx| stream.poll_next_unpin(cx)).await {
            Event::Aborted => {
                tracing::debug!("client aborted, dropping body");
                return Outcome::Aborted;
            }
            Event::Ready(Some(Ok(chunk))) => chunk,
            Event::Ready(Some(Err(e))) => {
                tracing::warn!(error = %e, "body stream failed, closing connection");
                socket.close();
                return Outcome::Failed(e);
            }
            Event::Ready(None) => break,
        };

        if chunk.is_empty() {
            continue;
        }

        let event = match content_length {
            Some(total) => write_sized(socket, chunk, total).await,
            None => write_chunked(socket, chunk).await,
        };

        match event {
            Event::Aborted => {
                tracing::debug!("client aborted while backpressured");
                return Outcome::Aborted;
            }
            Event::Ready(true) => return Outcome::Completed,
            Event::Ready(false) => {}
        }
    }

    match content_length {
        None => {
            socket.end_without_body();
            Outcome::Completed
        }
        Some(total) => {
            let written = socket.write_offset();
            tracing::warn!(written, total, "body ended before its length");
            socket.close();
            Outcome::Failed(io::Error::new(io::ErrorKind::UnexpectedEof, "body ended before its length"))
        }
    }
}

/// Ready with `true` once the response is complete.
async fn write_sized<S: Socket + ?Sized>(socket: &mut S, chunk: Bytes, total: u64) -> Event<bool> {
    let last_offset = socket.write_offset();
    let (mut ok, mut done) = socket.try_end(&chunk, total);

    while !ok && !done {
        let offset = match next_event(socket, |socket, cx| socket.poll_writable(cx)).await {
            Event::Ready(offset) => offset,
            Event::Aborted => return Event::Aborted,
        };

        let accepted = usize::try_from(offset.saturating_sub(last_offset)).unwrap_or(usize::MAX).min(chunk.len());
        tracing::trace!(offset, remaining = chunk.len() - accepted, "socket writable again");
        (ok, done) = socket.try_end(&chunk[accepted..], total);
    }

    Event::Ready(done)
}

async fn write_chunked<S: Socket + ?Sized>(socket: &mut S, chunk: Bytes) -> Event<bool> {
    if socket.write(&chunk) {
        return Event::Ready(false);
    }

    tracing::trace!(offset = socket.write_offset(), "backpressure, pausing body");
    match next_event(socket, |socket, cx| socket.poll_writable(cx)).await {
        Event::Ready(_) => Event::Ready(false),
        Event::Aborted => Event::Aborted,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use axum::http::HeaderMap;
    use futures::stream;

    use super::*;

    /// Accepts `window` bytes per writable cycle.
    pub(crate) struct MemorySocket {
        pub status: Option<StatusCode>,
        pub headers: HeaderMap,
        pub body: Vec<u8>,
        pub ended: bool,
        pub closed: bool,
        /// Times the writer had to wait.
        pub stalls: usize,
        pub abort_at: Option<usize>,
        window: usize,
        budget: usize,
        draining: bool,
    }

    impl MemorySocket {
        pub fn new(window: usize) -> Self {
            MemorySocket {
                status: None,
                headers: HeaderMap::new(),
                body: Vec::new(),
                ended: false,
                closed: false,
                stalls: 0,
                abort_at: None,
                window,
                budget: window,
                draining: false,
            }
        }
    }

    impl Socket for MemorySocket {
        fn write_status(&mut self, status: StatusCode) {
            self.status = Some(status);
        }

        fn write_header(&mut self, name: &HeaderName, value: &HeaderValue) {
            self.headers.append(name, value.clone());
        }

        fn try_end(&mut self, chunk: &[u8], total: u64) -> (bool, bool) {
            let accepted = chunk.len().min(self.budget);
            self.body.extend_from_slice(&chunk[..accepted]);
            self.budget -= accepted;

            let done = self.body.len() as u64 >= total;
            self.ended |= done;
            (accepted == chunk.len(), done)
        }

        fn write(&mut self, chunk: &[u8]) -> bool {
            self.body.extend_from_slice(chunk);
            let ok = chunk.len() <= self.budget;
            self.budget = self.budget.saturating_sub(chunk.len());
            ok
        }

        fn end(&mut self, body: &[u8]) {
            self.body.extend_from_slice(body);
            self.ended = true;
        }

        fn end_without_body(&mut self) {
            self.ended = true;
        }

        fn write_offset(&self) -> u64 {
            self.body.len() as u64
        }

        fn close(&mut self) {
            self.closed = true;
        }

        fn poll_writable(&mut self, cx: &mut Context<'_>) -> Poll<u64> {
            if !self.draining {
                self.draining = true;
                self.stalls += 1;
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }

            self.draining = false;
            self.budget = self.window;
            Poll::Ready(self.write_offset())
        }

        fn poll_aborted(&mut self, _cx: &mut Context<'_>) -> Poll<()> {
            match self.abort_at {
                Some(at) if self.body.len() >= at => Poll::Ready(()),
                _ => Poll::Pending,
            }
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn chunks(data: &[u8], size: usize) -> ByteStream {
        let chunks: Vec<io::Result<Bytes>> = data.chunks(size).map(|chunk| Ok(Bytes::copy_from_slice(chunk))).collect();
        ByteStream::new(stream::iter(chunks))
    }

    #[tokio::test]
    async fn test_sized_backpressure_keeps_bytes() {
        let data = pattern(1000);
        let mut socket = MemorySocket::new(64);

        let outcome = transmit(&mut socket, chunks(&data, 300), Some(1000)).await;

        assert_matches!(outcome, Outcome::Completed);
        assert!(socket.ended);
        assert!(socket.stalls > 10);
        assert_eq!(socket.body, data);
    }

    #[tokio::test]
    async fn test_chunked_backpressure_keeps_bytes() {
        let data = pattern(777);
        let mut socket = MemorySocket::new(100);

        let outcome = transmit(&mut socket, chunks(&data, 50), None).await;

        assert_matches!(outcome, Outcome::Completed);
        assert!(socket.ended);
        assert!(socket.stalls > 0);
        assert_eq!(socket.body, data);
    }

    #[tokio::test]
    async fn test_short_body_closes() {
        let mut socket = MemorySocket::new(1024);
        let outcome = transmit(&mut socket, chunks(b"short", 2), Some(10)).await;

        assert_matches!(outcome, Outcome::Failed(e) if e.kind() == io::ErrorKind::UnexpectedEof);
        assert!(socket.closed);
        assert!(!socket.ended);
    }

    #[tokio::test]
    async fn test_stream_error_closes() {
        let items = vec![Ok(Bytes::from_static(b"abc")), Err(io::Error::other("disk gone"))];
        let mut socket = MemorySocket::new(1024);

        let outcome = transmit(&mut socket, ByteStream::new(stream::iter(items)), None).await;

        assert_matches!(outcome, Outcome::Failed(e) if e.to_string() == "disk gone");
        assert!(socket.closed);
        assert_eq!(socket.body, b"abc");
    }

    #[tokio::test]
    async fn test_abort_drops_source() {
        struct Guard(Arc<AtomicBool>);

        impl Drop for Guard {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicBool::new(false));
        let guard = Guard(dropped.clone());
        let source = async_stream::stream! {
            let _guard = guard;
            loop {
                yield Ok::<_, io::Error>(Bytes::from_static(b"0123456789"));
            }
        };

        let mut socket = MemorySocket::new(25);
        socket.abort_at = Some(40);

        let outcome = transmit(&mut socket, ByteStream::new(source), Some(1 << 20)).await;

        assert_matches!(outcome, Outcome::Aborted);
        assert!(dropped.load(Ordering::SeqCst));
        assert!(!socket.closed);
    }
}
