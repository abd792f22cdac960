//! Sequential concatenation of heterogeneous byte sources.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};

use super::{ByteStream, StreamMeta};

/// Deferred item, invoked only when the joiner reaches it.
pub type Produce = Box<dyn FnOnce() -> BoxFuture<'static, io::Result<Produced>> + Send>;

/// One entry written to a [`StreamJoiner`].
pub enum JoinItem {
    Bytes(Bytes),
    /// Drained completely before the next item starts.
    Stream(ByteStream),
    /// Lazily invoked producer. `size` is what it will yield, when known.
    Producer { size: Option<u64>, produce: Produce },
}

/// Result of invoking a producer.
pub enum Produced {
    /// Nothing to emit, continue with the next item.
    Skip,
    /// Stop the output here, discarding everything still queued.
    End,
    Item(JoinItem),
}

impl JoinItem {
    pub fn producer<F, Fut>(size: Option<u64>, produce: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = io::Result<Produced>> + Send + 'static,
    {
        JoinItem::Producer { size, produce: Box::new(move || produce().boxed()) }
    }

    fn size(&self) -> Option<u64> {
        match self {
            JoinItem::Bytes(bytes) => Some(bytes.len() as u64),
            JoinItem::Stream(stream) => stream.size(),
            JoinItem::Producer { size, .. } => *size,
        }
    }
}

impl From<Bytes> for JoinItem {
    fn from(bytes: Bytes) -> Self {
        JoinItem::Bytes(bytes)
    }
}

impl From<ByteStream> for JoinItem {
    fn from(stream: ByteStream) -> Self {
        JoinItem::Stream(stream)
    }
}

impl fmt::Debug for JoinItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinItem::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            JoinItem::Stream(stream) => f.debug_tuple("Stream").field(stream).finish(),
            JoinItem::Producer { size, .. } => f.debug_struct("Producer").field("size", size).finish_non_exhaustive(),
        }
    }
}

struct Queue {
    items: VecDeque<JoinItem>,
    size: Option<u64>,
    ended: bool,
    destroyed: bool,
    waker: Option<Waker>,
}

impl Queue {
    fn wake(&mut self) {
        if let Some(waker) = self.waker.take() {
            waker.wake();
        }
    }
}

fn lock(queue: &Mutex<Queue>) -> MutexGuard<'_, Queue> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Writing half of a [`StreamJoiner`].
#[derive(Clone)]
pub struct JoinWriter {
    queue: Arc<Mutex<Queue>>,
}

impl JoinWriter {
    /// Queues an item. Writes after [`end`](Self::end) or after the joiner
    /// was dropped are discarded.
    pub fn write(&self, item: impl Into<JoinItem>) {
        let item = item.into();
        let mut queue = lock(&self.queue);

        if queue.ended || queue.destroyed {
            tracing::trace!(?item, "write after end ignored");
            return;
        }

        queue.size = match (queue.size, item.size()) {
            (Some(total), Some(size)) => Some(total + size),
            _ => None,
        };
        queue.items.push_back(item);
        queue.wake();
    }

    /// Marks the end of input. The joiner finishes once the queue drains.
    pub fn end(&self) {
        let mut queue = lock(&self.queue);
        queue.ended = true;
        queue.wake();
    }

    /// Running total of everything written, `None` once any item had an
    /// unknown size.
    pub fn size(&self) -> Option<u64> {
        lock(&self.queue).size
    }
}

enum Current {
    Idle,
    Stream(ByteStream),
    Producing(BoxFuture<'static, io::Result<Produced>>),
    Done,
}

/// Concatenates written items into one byte stream.
///
/// Items are consumed strictly in write order. A sub-stream is drained before
/// the next item starts and producers run only when reached.
pub struct StreamJoiner {
    queue: Arc<Mutex<Queue>>,
    current: Current,
}

impl Default for StreamJoiner {
    fn default() -> Self {
        StreamJoiner::new()
    }
}

impl StreamJoiner {
    pub fn new() -> Self {
        let queue = Queue { items: VecDeque::new(), size: Some(0), ended: false, destroyed: false, waker: None };
        StreamJoiner { queue: Arc::new(Mutex::new(queue)), current: Current::Idle }
    }

    pub fn writer(&self) -> JoinWriter {
        JoinWriter { queue: self.queue.clone() }
    }

    pub fn write(&self, item: impl Into<JoinItem>) {
        self.writer().write(item)
    }

    pub fn end(&self) {
        self.writer().end()
    }

    /// Drops every queued item and the active one. Further polls end the
    /// stream.
    pub fn destroy(&mut self) {
        let items = {
            let mut queue = lock(&self.queue);
            queue.destroyed = true;
            queue.waker = None;
            std::mem::take(&mut queue.items)
        };
        drop(items);
        self.current = Current::Done;
    }

    fn next_item(&mut self, cx: &mut Context<'_>) -> Poll<Option<JoinItem>> {
        let mut queue = lock(&self.queue);

        if let Some(item) = queue.items.pop_front() {
            return Poll::Ready(Some(item));
        }

        if queue.ended || queue.destroyed {
            return Poll::Ready(None);
        }

        queue.waker = Some(cx.waker().clone());
        Poll::Pending
    }

    /// Starts an item, returning bytes that can be emitted right away.
    fn start(&mut self, item: JoinItem) -> Option<Bytes> {
        match item {
            JoinItem::Bytes(bytes) => {
                self.current = Current::Idle;
                (!bytes.is_empty()).then_some(bytes)
            }
            JoinItem::Stream(stream) => {
                self.current = Current::Stream(stream);
                None
            }
            JoinItem::Producer { produce, .. } => {
                self.current = Current::Producing(produce());
                None
            }
        }
    }
}

impl Drop for StreamJoiner {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl StreamMeta for StreamJoiner {
    fn size(&self) -> Option<u64> {
        lock(&self.queue).size
    }
}

impl Stream for StreamJoiner {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<io::Result<Bytes>>> {
        let this = self.get_mut();

        loop {
            match &mut this.current {
                Current::Done => return Poll::Ready(None),

                Current::Idle => match this.next_item(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(None) => {
                        this.current = Current::Done;
                        return Poll::Ready(None);
                    }
                    Poll::Ready(Some(item)) => {
                        if let Some(bytes) = this.start(item) {
                            return Poll::Ready(Some(Ok(bytes)));
                        }
                    }
                },

                Current::Stream(stream) => match stream.poll_next_unpin(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Some(Ok(bytes))) if bytes.is_empty() => {}
                    Poll::Ready(Some(Ok(bytes))) => return Poll::Ready(Some(Ok(bytes))),
                    Poll::Ready(Some(Err(e))) => {
                        this.destroy();
                        return Poll::Ready(Some(Err(e)));
                    }
                    Poll::Ready(None) => this.current = Current::Idle,
                },

                Current::Producing(future) => match future.poll_unpin(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Ok(Produced::Skip)) => this.current = Current::Idle,
                    Poll::Ready(Ok(Produced::End)) => {
                        this.destroy();
                        return Poll::Ready(None);
                    }
                    Poll::Ready(Ok(Produced::Item(item))) => {
                        if let Some(bytes) = this.start(item) {
                            return Poll::Ready(Some(Ok(bytes)));
                        }
                    }
                    Poll::Ready(Err(e)) => {
                        this.destroy();
                        return Poll::Ready(Some(Err(e)));
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use futures::stream;

    use super::*;
    use crate::stream::tests::collect_stream;

    fn chunked(parts: &[&'static str]) -> ByteStream {
        let chunks: Vec<io::Result<Bytes>> = parts.iter().map(|part| Ok(Bytes::from_static(part.as_bytes()))).collect();
        ByteStream::new(stream::iter(chunks))
    }

    #[tokio::test]
    async fn test_join_in_order() {
        let joiner = StreamJoiner::new();
        joiner.write(Bytes::from_static(b"a"));
        joiner.write(chunked(&["b", "", "c"]).with_size(Some(2)));
        joiner.write(JoinItem::producer(Some(1), || async { Ok(Produced::Item(Bytes::from_static(b"d").into())) }));
        joiner.write(JoinItem::producer(Some(0), || async { Ok(Produced::Skip) }));
        joiner.write(Bytes::from_static(b"e"));
        joiner.end();

        assert_eq!(joiner.size(), Some(5));
        assert_eq!("abcde", collect_stream(joiner).await);
    }

    #[tokio::test]
    async fn test_unknown_size_is_permanent() {
        let joiner = StreamJoiner::new();
        joiner.write(Bytes::from_static(b"abc"));
        assert_eq!(joiner.size(), Some(3));

        joiner.write(chunked(&["x"]));
        assert_eq!(joiner.size(), None);

        joiner.write(Bytes::from_static(b"abc"));
        assert_eq!(joiner.size(), None);
    }

    #[tokio::test]
    async fn test_producer_end_stops_output() {
        let reached = Arc::new(AtomicBool::new(false));
        let flag = reached.clone();

        let joiner = StreamJoiner::new();
        joiner.write(Bytes::from_static(b"head"));
        joiner.write(JoinItem::producer(None, || async { Ok(Produced::End) }));
        joiner.write(JoinItem::producer(None, move || async move {
            flag.store(true, Ordering::SeqCst);
            Ok(Produced::Skip)
        }));
        joiner.end();

        assert_eq!("head", collect_stream(joiner).await);
        assert!(!reached.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_waits_for_writer() {
        let mut joiner = StreamJoiner::new();
        let writer = joiner.writer();

        let task = tokio::spawn(async move {
            tokio::task::yield_now().await;
            writer.write(Bytes::from_static(b"late"));
            writer.end();
        });

        let first = joiner.next().await.unwrap().unwrap();
        assert_eq!(first, Bytes::from_static(b"late"));
        assert!(joiner.next().await.is_none());
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_stream_error_destroys_rest() {
        let failing = ByteStream::new(stream::iter(vec![
            Ok(Bytes::from_static(b"ok")),
            Err(io::Error::other("boom")),
        ]));

        let mut joiner = StreamJoiner::new();
        joiner.write(failing);
        joiner.write(Bytes::from_static(b"never"));
        joiner.end();

        assert_eq!(joiner.next().await.unwrap().unwrap(), Bytes::from_static(b"ok"));
        assert!(joiner.next().await.unwrap().is_err());
        assert!(joiner.next().await.is_none());
    }

    #[tokio::test]
    async fn test_destroy_drops_queued_streams() {
        struct Guard(Arc<AtomicBool>);
        impl Drop for Guard {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicBool::new(false));
        let guard = Guard(dropped.clone());
        let queued = ByteStream::new(stream::poll_fn(move |_| {
            let _ = &guard;
            Poll::Ready(None::<io::Result<Bytes>>)
        }));

        let mut joiner = StreamJoiner::new();
        let writer = joiner.writer();
        writer.write(queued);
        joiner.destroy();

        assert!(dropped.load(Ordering::SeqCst));
        assert!(joiner.next().await.is_none());

        // the writer outlives the joiner, its writes are discarded
        writer.write(Bytes::from_static(b"ignored"));
        assert_eq!(writer.size(), None);
    }
}
