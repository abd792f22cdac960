//! The `Range` request header and the partial responses it produces.

use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::OnceLock;

use axum::http::header::{self, HeaderValue};
use axum::http::StatusCode;

use crate::body::{BodyData, HttpBody};
use crate::error::{Error, RangeError, Result};
use crate::message::HttpMessage;
use crate::range::Range;
use crate::stream::multipart::generate_boundary;
use crate::stream::{JoinItem, MultipartEncoder, Part, Produced};

fn bytes_unit() -> HeaderValue {
    HeaderValue::from_static("bytes")
}

/// Options of [`HttpRange::create_http_message`].
#[derive(Debug, Clone)]
pub struct RangeOptions {
    /// More ranges than this are refused. Zero or `None` means no limit.
    pub max_ranges: Option<usize>,
    /// Type of the selected content, the body's own type when unset.
    pub content_type: Option<String>,
    /// Total size of a producer's content. Other bodies know their size.
    pub content_length: Option<u64>,
    /// Build the response body. Headers are computed either way.
    pub create_body: bool,
}

impl Default for RangeOptions {
    fn default() -> Self {
        RangeOptions { max_ranges: None, content_type: None, content_length: None, create_body: true }
    }
}

/// An ordered list of byte ranges, as in `Range: bytes=0-99,-100`.
#[derive(Debug, Clone, Default)]
pub struct HttpRange {
    ranges: Vec<Range>,
    http_range: OnceLock<Option<String>>,
}

impl HttpRange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_range(&mut self, range: Range) -> &mut Self {
        self.ranges.push(range);
        self.http_range = OnceLock::new();
        self
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
        self.http_range = OnceLock::new();
    }

    pub fn size(&self) -> usize {
        self.ranges.len()
    }

    pub fn has_ranges(&self) -> bool {
        !self.ranges.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Range> {
        self.ranges.iter()
    }

    pub fn is_valid_http_range(&self) -> bool {
        self.http_range().is_some()
    }

    /// The comma separated range list, without the unit. `None` when empty
    /// or when a range cannot be written in header syntax.
    pub fn http_range(&self) -> Option<&str> {
        self.http_range
            .get_or_init(|| {
                if self.ranges.is_empty() {
                    return None;
                }

                let tokens = self.ranges.iter().map(Range::http_range).collect::<Option<Vec<_>>>()?;
                Some(tokens.join(","))
            })
            .as_deref()
    }

    /// Builds the response for these ranges over `body`.
    ///
    /// - `206 Partial Content` with the selected window for a single range.
    /// - `206` with a `multipart/byteranges` body for several ranges over a
    ///   replayable body. Stream bodies only support a single range.
    /// - `416 Range Not Satisfiable` when the list is empty, too long, or
    ///   holds a range that does not fit the content.
    ///
    /// Producers are invoked with the resolved range and must slice their
    /// output. Multipart parts are only materialized when the encoder reaches
    /// them.
    pub async fn create_http_message(&self, body: &mut HttpBody, options: RangeOptions) -> Result<HttpMessage> {
        let content_type = options.content_type.or_else(|| body.content_type().map(str::to_owned));
        let content_length = if body.is_producer() { options.content_length } else { body.content_length() };
        let multiple = !body.is_stream();

        let too_many = options.max_ranges.is_some_and(|max| max > 0 && self.size() > max);
        let mut resolved = Vec::with_capacity(self.size());

        if self.has_ranges() && !too_many && (multiple || self.size() == 1) {
            for range in &self.ranges {
                match range.create_range(content_length) {
                    Ok(range) if range.is_valid_http_content_range() => resolved.push(range),
                    _ => {
                        resolved.clear();
                        break;
                    }
                }
            }
        }

        if resolved.is_empty() {
            tracing::debug!(range = %self, ?content_length, "range not satisfiable");

            let total = content_length.map_or_else(|| "*".to_string(), |length| length.to_string());
            return Ok(HttpMessage::new(StatusCode::RANGE_NOT_SATISFIABLE)
                .with_header(header::ACCEPT_RANGES, bytes_unit())
                .with_header(header::CONTENT_RANGE, format!("bytes */{total}")));
        }

        let mut message = HttpMessage::new(StatusCode::PARTIAL_CONTENT).with_header(header::ACCEPT_RANGES, bytes_unit());

        if resolved.len() == 1 {
            let range = resolved.remove(0);

            if let Some(length) = range.length() {
                message.set_header(header::CONTENT_LENGTH, length);
            }
            if let Some(content_type) = &content_type {
                message.set_header(header::CONTENT_TYPE, content_type.as_str());
            }
            if let Some(content_range) = range.http_content_range() {
                message.set_header(header::CONTENT_RANGE, content_range);
            }

            if options.create_body {
                let part = match body.producer_fn() {
                    Some(producer) => producer(Some(range)).await?.into_body().unwrap_or_default(),
                    None => match body.create_body(Some(&range))? {
                        BodyData::Bytes(bytes) => HttpBody::bytes(bytes),
                        BodyData::Stream(stream) => HttpBody::from_stream(stream),
                    },
                };
                message.set_body(part, false);
            }

            return Ok(message);
        }

        if !options.create_body {
            let content_type = format!("multipart/byteranges; boundary={}", generate_boundary());
            return Ok(message.with_header(header::CONTENT_TYPE, content_type));
        }

        let mut encoder = MultipartEncoder::new("byteranges", None)?;
        let part_type = content_type.as_deref().and_then(|value| HeaderValue::from_str(value).ok());

        for range in resolved {
            let source = body.try_clone().ok_or(Error::BodyConsumed)?;
            let content_range = range.http_content_range().and_then(|value| HeaderValue::try_from(value).ok());

            let mut part = Part::new(JoinItem::producer(range.length(), move || read_part(source, range)));
            if let Some(part_type) = &part_type {
                part = part.header(header::CONTENT_TYPE, part_type.clone());
            }
            if let Some(content_range) = content_range {
                part = part.header(header::CONTENT_RANGE, content_range);
            }
            encoder.write(part);
        }
        encoder.finish();

        tracing::trace!(ranges = self.size(), boundary = encoder.boundary(), "multipart range response");
        let content_type = encoder.content_type().to_string();
        message.set_header(header::CONTENT_TYPE, content_type);
        message.set_body(HttpBody::from(encoder), false);

        Ok(message)
    }
}

async fn read_part(mut source: HttpBody, range: Range) -> io::Result<Produced> {
    let stream = match source.producer_fn() {
        Some(producer) => producer(Some(range)).await?.into_body().unwrap_or_default().stream(None)?,
        None => source.stream(Some(&range))?,
    };

    Ok(Produced::Item(JoinItem::Stream(stream)))
}

impl PartialEq for HttpRange {
    fn eq(&self, other: &Self) -> bool {
        self.ranges == other.ranges
    }
}

impl<'a> IntoIterator for &'a HttpRange {
    type Item = &'a Range;
    type IntoIter = std::slice::Iter<'a, Range>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl FromIterator<Range> for HttpRange {
    fn from_iter<I: IntoIterator<Item = Range>>(iter: I) -> Self {
        HttpRange { ranges: iter.into_iter().collect(), http_range: OnceLock::new() }
    }
}

impl fmt::Display for HttpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bytes={}", self.http_range().unwrap_or_default())
    }
}

impl FromStr for HttpRange {
    type Err = RangeError;

    /// Parses a `Range` header value. Only the `bytes` unit is understood.
    fn from_str(value: &str) -> Result<Self, RangeError> {
        let malformed = || RangeError::Malformed(value.to_string());

        let (unit, list) = value.trim().split_once('=').ok_or_else(malformed)?;
        if !unit.trim().eq_ignore_ascii_case("bytes") {
            return Err(malformed());
        }

        let ranges = list
            .split(',')
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(Range::from_str)
            .collect::<Result<Vec<_>, _>>()?;

        if ranges.is_empty() {
            return Err(malformed());
        }

        Ok(ranges.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use bytes::Bytes;
    use futures::stream;

    use super::*;
    use crate::stream::{ByteStream, MultipartDecoder, StreamMeta};

    fn digits() -> HttpBody {
        HttpBody::from(&b"0123456789"[..]).with_content_type("text/plain")
    }

    #[test]
    fn test_parse() {
        let range: HttpRange = "bytes=0-9, 20-, -5".parse().unwrap();
        assert_eq!(range.size(), 3);
        assert_eq!(range.http_range(), Some("0-9,20-,-5"));
        assert_eq!(range.to_string(), "bytes=0-9,20-,-5");

        let single: HttpRange = "Bytes = 5-".parse().unwrap();
        assert_eq!(single.iter().next().map(Range::start), Some(5));

        for value in ["", "bytes=", "bytes=,", "items=0-1", "bytes=a-b", "0-1"] {
            assert_matches!(value.parse::<HttpRange>(), Err(RangeError::Malformed(_)), "{value}");
        }
    }

    #[test]
    fn test_memoized_string_is_invalidated() {
        let mut range: HttpRange = "bytes=0-1".parse().unwrap();
        assert_eq!(range.http_range(), Some("0-1"));

        range.add_range("4-".parse().unwrap());
        assert_eq!(range.http_range(), Some("0-1,4-"));

        range.clear();
        assert!(!range.has_ranges());
        assert!(!range.is_valid_http_range());
    }

    #[tokio::test]
    async fn test_single_range() {
        let range: HttpRange = "bytes=-3".parse().unwrap();
        let mut message = range.create_http_message(&mut digits(), RangeOptions::default()).await.unwrap();

        assert_eq!(message.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(message.headers()[header::ACCEPT_RANGES], "bytes");
        assert_eq!(message.headers()[header::CONTENT_RANGE], "bytes 7-9/10");
        assert_eq!(message.content_length(), Some(3));
        assert_eq!(message.content_type(), Some("text/plain"));

        let data = message.create_body().unwrap().unwrap().into_stream();
        assert_eq!(data.collect_bytes().await.unwrap(), Bytes::from_static(b"789"));
    }

    #[tokio::test]
    async fn test_end_past_i64_is_clamped() {
        for value in ["bytes=0-9223372036854775807", "bytes=-9223372036854775807"] {
            let range: HttpRange = value.parse().unwrap();
            let mut message = range.create_http_message(&mut digits(), RangeOptions::default()).await.unwrap();

            assert_eq!(message.status(), StatusCode::PARTIAL_CONTENT, "{value}");
            assert_eq!(message.headers()[header::CONTENT_RANGE], "bytes 0-9/10");

            let data = message.create_body().unwrap().unwrap().into_stream();
            assert_eq!(data.collect_bytes().await.unwrap(), Bytes::from_static(b"0123456789"));
        }

        assert_matches!("bytes=0-9223372036854775808".parse::<HttpRange>(), Err(RangeError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_not_satisfiable() {
        let tests = [("bytes=20-30", Some(10)), ("bytes=0-1,3-4,6-7", Some(10))];

        for (value, content_length) in tests {
            let range: HttpRange = value.parse().unwrap();
            let options = RangeOptions { max_ranges: Some(2), ..Default::default() };
            let message = range.create_http_message(&mut digits(), options).await.unwrap();

            assert_eq!(message.status(), StatusCode::RANGE_NOT_SATISFIABLE, "{value}");
            assert_eq!(message.headers()[header::CONTENT_RANGE], format!("bytes */{}", content_length.unwrap()));
            assert!(!message.has_body());
        }

        let range = HttpRange::new();
        let message = range.create_http_message(&mut digits(), RangeOptions::default()).await.unwrap();
        assert_eq!(message.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    }

    #[tokio::test]
    async fn test_stream_takes_one_range() {
        let chunks = ["01234", "56789"].map(|chunk| Bytes::from_static(chunk.as_bytes()));
        let stream = || ByteStream::new(stream::iter(chunks.clone().map(Ok::<_, io::Error>))).with_size(Some(10));

        let range: HttpRange = "bytes=0-0,5-5".parse().unwrap();
        let message = range.create_http_message(&mut HttpBody::from(stream()), RangeOptions::default()).await.unwrap();
        assert_eq!(message.status(), StatusCode::RANGE_NOT_SATISFIABLE);

        let range: HttpRange = "bytes=3-6".parse().unwrap();
        let mut message = range.create_http_message(&mut HttpBody::from(stream()), RangeOptions::default()).await.unwrap();
        assert_eq!(message.status(), StatusCode::PARTIAL_CONTENT);
        let data = message.create_body().unwrap().unwrap().into_stream();
        assert_eq!(data.collect_bytes().await.unwrap(), Bytes::from_static(b"3456"));
    }

    #[tokio::test]
    async fn test_multipart_parts_are_deferred() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut body = HttpBody::producer(move |range: Option<Range>| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                let range = range.unwrap_or_default();
                let content = &b"abcdefghij"[range.offset() as usize..][..range.length().unwrap_or(0) as usize];
                Ok(HttpMessage::from(HttpBody::from(Bytes::copy_from_slice(content))))
            }
        });

        let range: HttpRange = "bytes=0-2,7-".parse().unwrap();
        let options = RangeOptions {
            content_length: Some(10),
            content_type: Some("text/plain".to_string()),
            ..Default::default()
        };
        let mut message = range.create_http_message(&mut body, options).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let content_type = message.content_type().unwrap().to_string();
        let boundary = content_type.strip_prefix("multipart/byteranges; boundary=").unwrap();
        let data = message.create_body().unwrap().unwrap().into_stream();
        assert!(data.size().is_some());

        let mut decoder = MultipartDecoder::new(data, boundary).unwrap();
        let mut parts = Vec::new();
        while let Some(part) = futures::StreamExt::next(&mut decoder).await {
            let part = part.unwrap();
            let content_range = part.headers[header::CONTENT_RANGE].to_str().unwrap().to_string();
            parts.push((content_range, part.body.collect_bytes().await.unwrap()));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            parts,
            [
                ("bytes 0-2/10".to_string(), Bytes::from_static(b"abc")),
                ("bytes 7-9/10".to_string(), Bytes::from_static(b"hij")),
            ]
        );
    }

    #[tokio::test]
    async fn test_head_multipart_has_no_body() {
        let range: HttpRange = "bytes=0-0,2-2".parse().unwrap();
        let options = RangeOptions { create_body: false, ..Default::default() };
        let message = range.create_http_message(&mut digits(), options).await.unwrap();

        assert_eq!(message.status(), StatusCode::PARTIAL_CONTENT);
        assert!(message.content_type().unwrap().starts_with("multipart/byteranges; boundary="));
        assert!(!message.has_body());
    }
}
