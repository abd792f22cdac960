//! Content codings and streaming compression.

use std::fmt;
use std::str::FromStr;

use async_compression::tokio::bufread::{BrotliEncoder, DeflateEncoder, GzipEncoder, ZstdEncoder};
use async_compression::Level;
use mime_guess::mime::{self, Mime};
use serde::Deserialize;
use tokio_util::io::{ReaderStream, StreamReader};

use crate::config::CompressionOptions;
use crate::stream::{ByteStream, StreamMeta};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    Br,
    Deflate,
    Gzip,
    Identity,
    Zstd,
}

impl Encoding {
    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Br => "br",
            Encoding::Deflate => "deflate",
            Encoding::Gzip => "gzip",
            Encoding::Identity => "identity",
            Encoding::Zstd => "zstd",
        }
    }

    /// First coding of the client's preference list this crate can apply.
    /// `identity` selects no compression.
    pub fn negotiate<'a>(preferred: impl IntoIterator<Item = &'a str>) -> Option<Encoding> {
        preferred.into_iter().find_map(|coding| coding.parse().ok())
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Encoding {
    type Err = ();

    fn from_str(coding: &str) -> Result<Self, ()> {
        match coding.trim().to_ascii_lowercase().as_str() {
            "br" => Ok(Encoding::Br),
            "deflate" => Ok(Encoding::Deflate),
            "gzip" | "x-gzip" => Ok(Encoding::Gzip),
            "identity" => Ok(Encoding::Identity),
            "zstd" => Ok(Encoding::Zstd),
            _ => Err(()),
        }
    }
}

/// Media types outside `text/*` and the `+json`/`+xml` suffixes that
/// compress well. An approximation of the `compressible` flag of the
/// mime-db database; extend it here.
pub const COMPRESSIBLE_TYPES: &[&str] = &[
    "application/ecmascript",
    "application/graphql",
    "application/javascript",
    "application/json",
    "application/postscript",
    "application/rtf",
    "application/vnd.ms-fontobject",
    "application/wasm",
    "application/x-font-ttf",
    "application/x-javascript",
    "application/x-www-form-urlencoded",
    "application/xml",
    "font/otf",
    "font/ttf",
    "image/bmp",
    "image/svg+xml",
    "image/vnd.microsoft.icon",
    "image/x-icon",
];

/// Whether a body of this media type is worth compressing.
pub fn is_compressible(content_type: &str) -> bool {
    let Ok(media) = content_type.parse::<Mime>() else {
        return false;
    };

    if media.type_() == mime::TEXT {
        return true;
    }

    if matches!(media.suffix(), Some(suffix) if suffix == mime::JSON || suffix == mime::XML) {
        return true;
    }

    COMPRESSIBLE_TYPES.contains(&media.essence_str())
}

/// Pipes `stream` through the encoder for `encoding`. The output keeps the
/// content type; its size is unknown.
pub fn compress_stream(stream: ByteStream, encoding: Encoding, options: &CompressionOptions) -> ByteStream {
    let content_type = stream.content_type().map(str::to_owned);
    let level = options.level.map_or(Level::Default, Level::Precise);
    let reader = StreamReader::new(stream);

    let compressed = match encoding {
        Encoding::Identity => return retyped(ByteStream::new(ReaderStream::new(reader)), content_type),
        Encoding::Br => ByteStream::new(ReaderStream::new(BrotliEncoder::with_quality(reader, level))),
        Encoding::Deflate => ByteStream::new(ReaderStream::new(DeflateEncoder::with_quality(reader, level))),
        Encoding::Gzip => ByteStream::new(ReaderStream::new(GzipEncoder::with_quality(reader, level))),
        Encoding::Zstd => ByteStream::new(ReaderStream::new(ZstdEncoder::with_quality(reader, level))),
    };

    tracing::trace!(%encoding, ?level, "compressing body");
    retyped(compressed, content_type)
}

fn retyped(stream: ByteStream, content_type: Option<String>) -> ByteStream {
    match content_type {
        Some(content_type) => stream.with_content_type(content_type),
        None => stream,
    }
}

#[cfg(test)]
mod tests {
    use async_compression::tokio::bufread::GzipDecoder;
    use bytes::Bytes;
    use tokio::io::AsyncReadExt;

    use super::*;

    #[test]
    fn test_compressible() {
        for content_type in [
            "text/plain",
            "text/html; charset=utf-8",
            "application/json",
            "application/ld+json",
            "application/atom+xml",
            "image/svg+xml",
            "application/javascript",
            "APPLICATION/WASM",
            "image/x-icon; foo=bar",
            "font/ttf",
        ] {
            assert!(is_compressible(content_type), "{content_type}");
        }

        assert!(COMPRESSIBLE_TYPES.iter().all(|content_type| is_compressible(content_type)));

        for content_type in ["image/png", "video/mp4", "application/octet-stream", "application/zip", "nonsense"] {
            assert!(!is_compressible(content_type), "{content_type}");
        }
    }

    #[test]
    fn test_negotiate() {
        assert_eq!(Encoding::negotiate(["unknown", "br", "gzip"]), Some(Encoding::Br));
        assert_eq!(Encoding::negotiate(["identity", "gzip"]), Some(Encoding::Identity));
        assert_eq!(Encoding::negotiate(["compress"]), None);
        assert_eq!("X-GZIP".parse(), Ok(Encoding::Gzip));
    }

    #[tokio::test]
    async fn test_gzip_stream() {
        let text = "hello hello hello hello hello hello hello hello".repeat(100);
        let stream = ByteStream::once(Bytes::from(text.clone())).with_content_type("text/plain");

        let compressed = compress_stream(stream, Encoding::Gzip, &CompressionOptions { level: Some(9) });
        assert_eq!(compressed.size(), None);
        assert_eq!(compressed.content_type(), Some("text/plain"));

        let bytes = compressed.collect_bytes().await.unwrap();
        assert!(bytes.len() < text.len());

        let mut decoded = String::new();
        GzipDecoder::new(&bytes[..]).read_to_string(&mut decoded).await.unwrap();
        assert_eq!(decoded, text);
    }
}
