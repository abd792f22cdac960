//! Inbound request headers, parsed into the structures the response
//! pipeline consumes.

use std::time::SystemTime;

use axum::http::header::{self, HeaderMap, HeaderValue};
use axum_extra::headers::{Header, HeaderMapExt, IfModifiedSince, IfUnmodifiedSince, LastModified};

use crate::http_range::HttpRange;

/// A parsed `If-Match` / `If-None-Match` list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityTags {
    any: bool,
    tags: Vec<String>,
}

impl EntityTags {
    /// Parses a comma separated list of entity tags, or `*`.
    pub fn parse(value: &str) -> Option<Self> {
        let mut list = EntityTags::default();
        let mut rest = value.trim();

        while !rest.is_empty() {
            rest = rest.trim_start_matches(|c: char| c == ',' || c.is_ascii_whitespace());
            if rest.is_empty() {
                break;
            }

            if let Some(tail) = rest.strip_prefix('*') {
                list.any = true;
                rest = tail;
                continue;
            }

            let (weak, quoted) = match rest.strip_prefix("W/") {
                Some(quoted) => ("W/", quoted),
                None => ("", rest),
            };
            let opaque = quoted.strip_prefix('"')?;
            let close = opaque.find('"')?;

            list.tags.push(format!("{weak}\"{}\"", &opaque[..close]));
            rest = &opaque[close + 1..];
        }

        (list.any || !list.tags.is_empty()).then_some(list)
    }

    pub fn is_any(&self) -> bool {
        self.any
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Exact membership, weak tags only match themselves.
    pub fn contains(&self, etag: &str) -> bool {
        self.tags.iter().any(|tag| tag == etag)
    }

    /// Membership ignoring the weakness indicator on both sides.
    pub fn contains_weak(&self, etag: &str) -> bool {
        let opaque = strip_weak(etag);
        self.tags.iter().any(|tag| strip_weak(tag) == opaque)
    }
}

pub fn is_weak(etag: &str) -> bool {
    etag.starts_with("W/\"")
}

fn strip_weak(etag: &str) -> &str {
    etag.strip_prefix("W/").unwrap_or(etag)
}

/// `If-Range` is either an HTTP date or an entity tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IfRange {
    Date(SystemTime),
    ETag(String),
}

impl IfRange {
    pub fn parse(value: &HeaderValue) -> Option<Self> {
        let text = value.to_str().ok()?.trim();

        if text == "*" || text.starts_with('"') || text.starts_with("W/") {
            return Some(IfRange::ETag(text.to_string()));
        }

        LastModified::decode(&mut std::iter::once(value))
            .ok()
            .map(|date| IfRange::Date(date.into()))
    }
}

/// Accepted content codings in preference order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcceptEncoding {
    encodings: Vec<String>,
    any: bool,
}

impl AcceptEncoding {
    /// Parses `gzip, br;q=0.9, *;q=0.1`. Codings with `q=0` are dropped and
    /// the rest are sorted by descending quality, keeping header order on ties.
    pub fn parse(value: &str) -> Self {
        let mut weighted: Vec<(u16, String)> = Vec::new();
        let mut any = false;

        for item in value.split(',') {
            let mut params = item.split(';');
            let coding = params.next().unwrap_or_default().trim().to_ascii_lowercase();
            if coding.is_empty() {
                continue;
            }

            let quality = params
                .filter_map(|param| param.trim().strip_prefix("q="))
                .find_map(parse_quality)
                .unwrap_or(1000);

            if quality == 0 {
                continue;
            }

            if coding == "*" {
                any = true;
            } else {
                weighted.push((quality, coding));
            }
        }

        weighted.sort_by(|a, b| b.0.cmp(&a.0));

        AcceptEncoding { encodings: weighted.into_iter().map(|(_, coding)| coding).collect(), any }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.encodings.iter().map(String::as_str)
    }

    /// Whether the client sent `*`.
    pub fn accepts_any(&self) -> bool {
        self.any
    }

    pub fn is_empty(&self) -> bool {
        self.encodings.is_empty() && !self.any
    }
}

// qvalue in thousandths
fn parse_quality(value: &str) -> Option<u16> {
    let value: f32 = value.trim().parse().ok()?;
    (0.0..=1.0).contains(&value).then(|| (value * 1000.0).round() as u16)
}

/// The request headers the delivery pipeline looks at.
#[derive(Debug, Clone, Default)]
pub struct RequestHeaders {
    pub range: Option<HttpRange>,
    pub if_range: Option<IfRange>,
    pub if_match: Option<EntityTags>,
    pub if_none_match: Option<EntityTags>,
    pub if_modified_since: Option<SystemTime>,
    pub if_unmodified_since: Option<SystemTime>,
    pub accept_encoding: Option<AcceptEncoding>,
}

impl RequestHeaders {
    /// Headers that fail to parse are treated as absent.
    pub fn from_header_map(headers: &HeaderMap) -> Self {
        RequestHeaders {
            range: text(headers, header::RANGE).and_then(|value| value.parse().ok()),
            if_range: headers.get(header::IF_RANGE).and_then(IfRange::parse),
            if_match: joined(headers, header::IF_MATCH).and_then(|value| EntityTags::parse(&value)),
            if_none_match: joined(headers, header::IF_NONE_MATCH).and_then(|value| EntityTags::parse(&value)),
            if_modified_since: headers.typed_get::<IfModifiedSince>().map(SystemTime::from),
            if_unmodified_since: headers.typed_get::<IfUnmodifiedSince>().map(SystemTime::from),
            accept_encoding: joined(headers, header::ACCEPT_ENCODING).map(|value| AcceptEncoding::parse(&value)),
        }
    }
}

fn text(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

// list headers may be split over several lines
fn joined(headers: &HeaderMap, name: header::HeaderName) -> Option<String> {
    let values: Vec<&str> = headers.get_all(name).iter().filter_map(|value| value.to_str().ok()).collect();
    (!values.is_empty()).then(|| values.join(","))
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use super::*;

    #[test]
    fn test_entity_tags() {
        let tags = EntityTags::parse(r#""abc", W/"weak" ,"with,comma""#).unwrap();
        assert!(!tags.is_any());
        assert_eq!(tags.tags(), [r#""abc""#, r#"W/"weak""#, r#""with,comma""#]);
        assert!(tags.contains(r#""abc""#));
        assert!(!tags.contains(r#""weak""#));
        assert!(tags.contains_weak(r#""weak""#));

        assert!(EntityTags::parse("*").unwrap().is_any());
        assert_eq!(EntityTags::parse("no-quotes"), None);
        assert_eq!(EntityTags::parse(""), None);
    }

    #[test]
    fn test_accept_encoding() {
        let accept = AcceptEncoding::parse("deflate;q=0.5, GZIP, br;q=1.0, zstd;q=0, *;q=0.1");
        assert_eq!(accept.iter().collect::<Vec<_>>(), ["gzip", "br", "deflate"]);
        assert!(accept.accepts_any());

        let accept = AcceptEncoding::parse("identity, *;q=0");
        assert_eq!(accept.iter().collect::<Vec<_>>(), ["identity"]);
        assert!(!accept.accepts_any());

        assert!(AcceptEncoding::parse("").is_empty());
    }

    #[test]
    fn test_from_header_map() {
        let mut map = HeaderMap::new();
        map.insert(header::RANGE, HeaderValue::from_static("bytes=0-9, -5"));
        map.insert(header::IF_RANGE, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        map.append(header::IF_NONE_MATCH, HeaderValue::from_static(r#""a""#));
        map.append(header::IF_NONE_MATCH, HeaderValue::from_static(r#""b""#));
        map.insert(header::IF_MODIFIED_SINCE, HeaderValue::from_static("Wed, 21 Oct 2015 07:28:00 GMT"));
        map.insert(header::IF_UNMODIFIED_SINCE, HeaderValue::from_static("not a date"));
        map.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));

        let headers = RequestHeaders::from_header_map(&map);
        let date = UNIX_EPOCH + Duration::from_secs(1445412480);

        assert_eq!(headers.range.unwrap().to_string(), "bytes=0-9,-5");
        assert_eq!(headers.if_range, Some(IfRange::Date(date)));
        assert_eq!(headers.if_none_match.unwrap().tags(), [r#""a""#, r#""b""#]);
        assert_eq!(headers.if_modified_since, Some(date));
        assert_eq!(headers.if_unmodified_since, None);
        assert_eq!(headers.accept_encoding.unwrap().iter().collect::<Vec<_>>(), ["gzip"]);
        assert!(headers.if_match.is_none());
    }

    #[test]
    fn test_if_range_etag() {
        let parsed = IfRange::parse(&HeaderValue::from_static(r#"W/"v1""#));
        assert_eq!(parsed, Some(IfRange::ETag(r#"W/"v1""#.to_string())));
        assert_eq!(IfRange::parse(&HeaderValue::from_static("garbage")), None);
    }
}
