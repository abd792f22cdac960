use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;
use pin_project::pin_project;

use super::StreamMeta;
use crate::error::RangeError;
use crate::range::Range;

/// Forwards the window of an upstream byte stream selected by a resolved
/// [`Range`].
///
/// Bytes before the start are dropped. Once the window has been forwarded the
/// slicer ends without draining the upstream.
#[pin_project]
pub struct StreamSlicer<S> {
    skip: u64,
    remaining: Option<u64>,
    size: Option<u64>,
    #[pin]
    upstream: S,
}

impl<S> StreamSlicer<S>
where
    S: Stream<Item = io::Result<Bytes>> + StreamMeta,
{
    pub fn new(upstream: S, range: &Range) -> Result<Self, RangeError> {
        if range.is_relative() {
            return Err(RangeError::Relative);
        }

        let skip = range.offset();
        let remaining = range.max_length();
        let size = upstream.size().map(|size| {
            let available = size.saturating_sub(skip);
            remaining.map_or(available, |remaining| remaining.min(available))
        });

        Ok(StreamSlicer { skip, remaining, size, upstream })
    }
}

impl<S> StreamMeta for StreamSlicer<S> {
    fn size(&self) -> Option<u64> {
        self.size
    }
}

impl<S> Stream for StreamSlicer<S>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<io::Result<Bytes>>> {
        let mut this = self.project();

        loop {
            if *this.remaining == Some(0) {
                return Poll::Ready(None);
            }

            let mut chunk = match this.upstream.as_mut().poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(Some(Ok(chunk))) => chunk,
            };

            let len = chunk.len() as u64;
            if *this.skip >= len {
                *this.skip -= len;
                continue;
            }
            if *this.skip > 0 {
                chunk = chunk.slice(*this.skip as usize..);
                *this.skip = 0;
            }

            if let Some(remaining) = this.remaining.as_mut() {
                if chunk.len() as u64 > *remaining {
                    chunk.truncate(*remaining as usize);
                }
                *remaining -= chunk.len() as u64;
            }

            if !chunk.is_empty() {
                return Poll::Ready(Some(Ok(chunk)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::stream;

    use super::*;
    use crate::range::RangeSpec;
    use crate::stream::tests::collect_stream;
    use crate::stream::ByteStream;

    fn source() -> ByteStream {
        let chunks = ["012", "3", "4567", "89"].map(|chunk| Ok::<_, io::Error>(Bytes::from_static(chunk.as_bytes())));
        ByteStream::new(stream::iter(chunks)).with_size(Some(10))
    }

    #[tokio::test]
    async fn test_slice_window() {
        let tests = [(0, 10, "0123456789"), (2, 5, "234"), (3, 4, "3"), (4, 10, "456789"), (9, 20, "9"), (10, 10, "")];

        for (start, end, expected) in tests {
            let range = RangeSpec::new().content_length(10).start(start).end(end).build().unwrap();
            let slicer = Box::pin(StreamSlicer::new(source(), &range).unwrap());
            assert_eq!(slicer.size(), Some(expected.len() as u64), "{start}..{end}");
            assert_eq!(expected, collect_stream(slicer).await, "{start}..{end}");
        }
    }

    #[tokio::test]
    async fn test_open_window_over_unknown_size() {
        let range = RangeSpec::new().start(7).build().unwrap();
        let slicer = Box::pin(StreamSlicer::new(source().with_size(None), &range).unwrap());
        assert_eq!(slicer.size(), None);
        assert_eq!("789", collect_stream(slicer).await);
    }

    #[test]
    fn test_relative_range_fails() {
        let range = RangeSpec::new().start(-3).build().unwrap();
        assert_eq!(StreamSlicer::new(source(), &range).err(), Some(RangeError::Relative));
    }
}
