//! Multipart bodies: an encoder streaming parts as one body and a decoder
//! splitting such a body back into parts.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{Stream, StreamExt};
use memchr::memmem;
use uuid::Uuid;

use super::{ByteStream, JoinItem, StreamJoiner, StreamMeta};
use crate::error::{Error, Result};

/// Subtypes accepted after `multipart/`.
pub const MULTIPART_TYPES: [&str; 5] = ["alternative", "byteranges", "form-data", "mixed", "related"];

const MAX_BOUNDARY_LEN: usize = 70;

/// Random boundary built from two v4 uuids, base64url encoded.
pub fn generate_boundary() -> String {
    let mut raw = [0u8; 32];
    raw[..16].copy_from_slice(Uuid::new_v4().as_bytes());
    raw[16..].copy_from_slice(Uuid::new_v4().as_bytes());

    URL_SAFE_NO_PAD.encode(raw)
}

fn validate_boundary(boundary: &str) -> Result<()> {
    let valid_char = |c: char| c.is_ascii_alphanumeric() || "'()+_,-./:=? ".contains(c);

    if boundary.is_empty()
        || boundary.len() > MAX_BOUNDARY_LEN
        || boundary.ends_with(' ')
        || !boundary.chars().all(valid_char)
    {
        return Err(Error::InvalidBoundary);
    }

    Ok(())
}

/// One part written to a [`MultipartEncoder`].
#[derive(Debug)]
pub struct Part {
    pub headers: HeaderMap,
    pub body: JoinItem,
}

impl Part {
    pub fn new(body: impl Into<JoinItem>) -> Self {
        Part { headers: HeaderMap::new(), body: body.into() }
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }
}

/// Streams written parts as a single multipart body.
///
/// The size is known as long as every written part has a known size.
pub struct MultipartEncoder {
    boundary: String,
    content_type: String,
    joiner: StreamJoiner,
    finished: bool,
}

impl fmt::Debug for MultipartEncoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultipartEncoder")
            .field("boundary", &self.boundary)
            .field("content_type", &self.content_type)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl MultipartEncoder {
    /// `kind` is the subtype, e.g. `byteranges`. A boundary is generated when
    /// none is given.
    pub fn new(kind: &str, boundary: Option<String>) -> Result<Self> {
        if !MULTIPART_TYPES.contains(&kind) {
            return Err(Error::InvalidMultipartType(kind.to_string()));
        }

        let boundary = match boundary {
            Some(boundary) => {
                validate_boundary(&boundary)?;
                boundary
            }
            None => generate_boundary(),
        };
        let content_type = format!("multipart/{kind}; boundary={boundary}");

        Ok(MultipartEncoder { boundary, content_type, joiner: StreamJoiner::new(), finished: false })
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// `multipart/<kind>; boundary=<boundary>`
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn write(&self, part: Part) {
        if self.finished {
            return;
        }

        let mut head = BytesMut::with_capacity(self.boundary.len() + 8);
        head.put_slice(b"--");
        head.put_slice(self.boundary.as_bytes());
        head.put_slice(b"\r\n");
        for (name, value) in &part.headers {
            head.put_slice(name.as_str().as_bytes());
            head.put_slice(b": ");
            head.put_slice(value.as_bytes());
            head.put_slice(b"\r\n");
        }
        head.put_slice(b"\r\n");

        self.joiner.write(head.freeze());
        self.joiner.write(part.body);
        self.joiner.write(Bytes::from_static(b"\r\n"));
    }

    /// Writes the closing boundary. Parts written afterwards are ignored.
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }

        self.joiner.write(Bytes::from(format!("--{}--\r\n", self.boundary)));
        self.joiner.end();
        self.finished = true;
    }

    /// Finishes the body and boxes it with its size and content type.
    pub fn into_stream(mut self) -> ByteStream {
        self.finish();
        ByteStream::from_meta(self)
    }
}

impl StreamMeta for MultipartEncoder {
    fn size(&self) -> Option<u64> {
        self.joiner.size()
    }

    fn content_type(&self) -> Option<&str> {
        Some(&self.content_type)
    }
}

impl Stream for MultipartEncoder {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<io::Result<Bytes>>> {
        self.joiner.poll_next_unpin(cx)
    }
}

/// A part recovered by [`MultipartDecoder`].
#[derive(Debug)]
pub struct DecodedPart {
    pub headers: HeaderMap,
    /// Reads from the shared input. Polling the decoder for the next part
    /// skips whatever is left unread here.
    pub body: ByteStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Preamble,
    Delimiter,
    Headers,
    Body(u64),
    Final,
    Done,
    Failed { part: Option<u64> },
}

struct State {
    input: ByteStream,
    buffer: BytesMut,
    input_done: bool,
    /// `\r\n--boundary`
    delimiter: Bytes,
    phase: Phase,
    parts: u64,
    /// Preamble bytes dropped so far.
    skipped: usize,
}

impl State {
    fn fail(&mut self, reason: &'static str) -> Error {
        tracing::debug!(reason, "multipart parse failure");

        let part = match self.phase {
            Phase::Body(id) => Some(id),
            _ => None,
        };
        self.phase = Phase::Failed { part };
        self.buffer.clear();

        Error::MalformedMultipart(reason)
    }

    /// Pulls one more chunk of input into the buffer.
    fn fill(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        match self.input.poll_next_unpin(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => {
                self.buffer.extend_from_slice(&chunk);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Some(Err(e))) => {
                self.fail("input stream failed");
                Poll::Ready(Err(e.into()))
            }
            Poll::Ready(None) => {
                self.input_done = true;
                Poll::Ready(Ok(()))
            }
        }
    }

    /// Next chunk of the current part body. `None` once its delimiter has
    /// been consumed.
    fn poll_body(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<Bytes>>> {
        loop {
            if let Some(i) = memmem::find(&self.buffer, &self.delimiter) {
                let chunk = self.buffer.split_to(i).freeze();
                self.buffer.advance(self.delimiter.len());
                self.phase = Phase::Delimiter;

                return Poll::Ready((!chunk.is_empty()).then_some(Ok(chunk)));
            }

            // a delimiter may straddle chunks, hold back its possible prefix
            let hold = self.delimiter.len() - 1;
            if self.buffer.len() > hold {
                let chunk = self.buffer.split_to(self.buffer.len() - hold).freeze();
                return Poll::Ready(Some(Ok(chunk)));
            }

            if self.input_done {
                return Poll::Ready(Some(Err(self.fail("unexpected end of data"))));
            }

            match self.fill(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(Ok(())) => {}
            }
        }
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn parse_headers(raw: &[u8]) -> Option<HeaderMap> {
    let mut headers = HeaderMap::new();

    for line in raw.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if line.is_empty() {
            continue;
        }

        let colon = memchr::memchr(b':', line)?;
        let name = HeaderName::from_bytes(line[..colon].trim_ascii()).ok()?;
        let value = HeaderValue::from_bytes(line[colon + 1..].trim_ascii()).ok()?;
        headers.append(name, value);
    }

    Some(headers)
}

/// Splits a multipart body into [`DecodedPart`]s.
///
/// Data before the first boundary is ignored. Anything after the closing
/// boundary, or a body that ends before it, is a parse error.
pub struct MultipartDecoder {
    state: Arc<Mutex<State>>,
}

impl MultipartDecoder {
    pub fn new(input: ByteStream, boundary: &str) -> Result<Self> {
        validate_boundary(boundary)?;

        let state = State {
            input,
            buffer: BytesMut::new(),
            input_done: false,
            delimiter: Bytes::from(format!("\r\n--{boundary}")),
            phase: Phase::Preamble,
            parts: 0,
            skipped: 0,
        };

        Ok(MultipartDecoder { state: Arc::new(Mutex::new(state)) })
    }
}

impl Stream for MultipartDecoder {
    type Item = Result<DecodedPart>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<DecodedPart>>> {
        let shared = self.state.clone();
        let mut state = lock(&shared);

        loop {
            match state.phase {
                Phase::Done | Phase::Failed { .. } => return Poll::Ready(None),

                Phase::Preamble => {
                    let dashed_len = state.delimiter.len() - 2;

                    // the first boundary may open the input without a CRLF
                    if state.skipped == 0
                        && state.buffer.len() >= dashed_len
                        && state.buffer[..dashed_len] == state.delimiter[2..]
                    {
                        state.buffer.advance(dashed_len);
                        state.phase = Phase::Delimiter;
                        continue;
                    }

                    if let Some(i) = memmem::find(&state.buffer, &state.delimiter) {
                        let skip = i + state.delimiter.len();
                        state.buffer.advance(skip);
                        state.phase = Phase::Delimiter;
                        continue;
                    }

                    if state.input_done {
                        return Poll::Ready(Some(Err(state.fail("missing boundary"))));
                    }

                    let hold = state.delimiter.len() - 1;
                    if state.buffer.len() > hold {
                        let skip = state.buffer.len() - hold;
                        state.buffer.advance(skip);
                        state.skipped += skip;
                    }
                }

                Phase::Delimiter => {
                    if state.buffer.len() >= 2 {
                        let lead = [state.buffer[0], state.buffer[1]];
                        match &lead {
                            b"\r\n" => {
                                state.buffer.advance(2);
                                state.phase = Phase::Headers;
                                continue;
                            }
                            b"--" if state.buffer.len() >= 4 => {
                                if &state.buffer[..4] != b"--\r\n" {
                                    return Poll::Ready(Some(Err(state.fail("malformed closing boundary"))));
                                }
                                state.buffer.advance(4);
                                state.phase = Phase::Final;
                                continue;
                            }
                            b"--" => {}
                            _ => return Poll::Ready(Some(Err(state.fail("malformed boundary")))),
                        }
                    }

                    if state.input_done {
                        return Poll::Ready(Some(Err(state.fail("unexpected end of data"))));
                    }
                }

                Phase::Headers => {
                    let header_end = if state.buffer.starts_with(b"\r\n") {
                        Some((0, 2))
                    } else {
                        memmem::find(&state.buffer, b"\r\n\r\n").map(|i| (i, i + 4))
                    };

                    if let Some((end, skip)) = header_end {
                        let Some(headers) = parse_headers(&state.buffer[..end]) else {
                            return Poll::Ready(Some(Err(state.fail("invalid part header"))));
                        };
                        state.buffer.advance(skip);
                        state.parts += 1;

                        let id = state.parts;
                        state.phase = Phase::Body(id);

                        let body = PartBody { state: shared.clone(), id, done: false };
                        return Poll::Ready(Some(Ok(DecodedPart { headers, body: ByteStream::new(body) })));
                    }

                    if state.input_done {
                        return Poll::Ready(Some(Err(state.fail("unexpected end of part headers"))));
                    }
                }

                // the previous part was not read to its end, skip the rest
                Phase::Body(_) => match state.poll_body(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                    Poll::Ready(Some(Ok(_)) | None) => continue,
                },

                Phase::Final => {
                    if !state.buffer.is_empty() {
                        return Poll::Ready(Some(Err(state.fail("data after closing boundary"))));
                    }
                    if state.input_done {
                        state.phase = Phase::Done;
                        return Poll::Ready(None);
                    }
                }
            }

            match state.fill(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(Ok(())) => {}
            }
        }
    }
}

struct PartBody {
    state: Arc<Mutex<State>>,
    id: u64,
    done: bool,
}

impl Stream for PartBody {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<io::Result<Bytes>>> {
        if self.done {
            return Poll::Ready(None);
        }

        let shared = self.state.clone();
        let mut state = lock(&shared);

        let polled = match state.phase {
            Phase::Body(id) if id == self.id => state.poll_body(cx),
            Phase::Failed { part: Some(id) } if id == self.id => {
                Poll::Ready(Some(Err(Error::MalformedMultipart("part was interrupted"))))
            }
            _ => Poll::Ready(None),
        };
        drop(state);

        match polled {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Some(Err(e))) => {
                self.done = true;
                Poll::Ready(Some(Err(e.into())))
            }
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(None)
            }
        }
    }
}
