//! Running the assembly pipeline and framing the result on a socket.

use std::convert::Infallible;

use axum::extract::FromRequestParts;
use axum::http::header::{self, HeaderMap, HeaderValue};
use axum::http::request::Parts;
use axum::http::Method;

use crate::body::BodyData;
use crate::config::DeliveryOptions;
use crate::error::Result;
use crate::headers::RequestHeaders;
use crate::message::{CompressionCheck, HttpMessage, RangeCheck};
use crate::transmit::{transmit, Outcome, Socket};

/// The parts of a request that shape its response.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub headers: RequestHeaders,
}

impl Request {
    pub fn new(method: Method, headers: &HeaderMap) -> Self {
        Request { method, headers: RequestHeaders::from_header_map(headers) }
    }

    pub fn is_head(&self) -> bool {
        self.method == Method::HEAD
    }
}

impl<S: Send + Sync> FromRequestParts<S> for Request {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Request::new(parts.method.clone(), &parts.headers))
    }
}

impl HttpMessage {
    /// Runs the assembly stages for `request`: body check, conditional
    /// headers, producer resolution, ranges, compression.
    ///
    /// Bodies are left in place for `HEAD`, with the headers a `GET` would
    /// get. Hyper drops them on the wire.
    pub async fn prepare(mut self, request: &Request, options: &DeliveryOptions) -> Result<HttpMessage> {
        let create_body = !request.is_head();

        self.check_body();
        self.check_cache(&request.headers, &request.method);
        self.check_body_function().await?;
        self.check_http_range(&request.headers, RangeCheck { create_body, max_ranges: options.max_ranges })
            .await?;
        self.check_compression(
            &request.headers,
            CompressionCheck {
                create_body,
                compress: options.compress,
                compression: options.compression,
                default_encoding: options.default_encoding,
            },
        )?;

        Ok(self)
    }
}

/// Prepares `message` and writes it to `socket`.
///
/// Framing headers are decided here: a `HEAD` response advertises the length
/// a `GET` would send, or `Transfer-Encoding: chunked` when it is unknown; an
/// empty response gets `Content-Length: 0`; otherwise the socket frames the
/// body itself.
///
/// Errors are only returned before the status line is written. Later
/// failures close the connection and are reported as
/// [`Outcome::Failed`].
pub async fn deliver<S: Socket + ?Sized>(
    socket: &mut S,
    request: &Request,
    message: HttpMessage,
    options: &DeliveryOptions,
) -> Result<Outcome> {
    let mut message = message.prepare(request, options).await?;

    let content_length = message.content_length();
    let headers = message.headers_mut();
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(header::TRANSFER_ENCODING);

    let mut send_body = message.has_body();
    if send_body && request.is_head() {
        if let Some(mut body) = message.take_body() {
            body.destroy();
        }
        send_body = false;

        match content_length {
            Some(length) => message.set_header(header::CONTENT_LENGTH, length),
            None => message.set_header(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked")),
        }
    } else if !send_body {
        message.set_header(header::CONTENT_LENGTH, 0u64);
    }

    let data = if send_body {
        match message.create_body() {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(error = %e, "failed to create response body");
                socket.close();
                return Ok(Outcome::Failed(e.into()));
            }
        }
    } else {
        None
    };

    tracing::debug!(status = %message.status(), ?content_length, head = request.is_head(), "writing response");
    socket.write_status(message.status());
    for (name, value) in message.headers() {
        socket.write_header(name, value);
    }

    Ok(match data {
        None => {
            socket.end_without_body();
            Outcome::Completed
        }
        Some(BodyData::Bytes(bytes)) => {
            socket.end(&bytes);
            Outcome::Completed
        }
        Some(BodyData::Stream(stream)) => transmit(socket, stream, content_length).await,
    })
}
