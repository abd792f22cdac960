//! Byte ranges that may or may not be resolved against a total size.
//!
//! A [`Range`] is built from a [`RangeSpec`]. Without a content length the
//! offsets may stay relative (negative values count from the end) and only a
//! speculative [`Range::max_length`] is known. Once the size of the source is
//! known, [`Range::create_range`] resolves every offset to an absolute,
//! clamped window with `start <= end <= content_length`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

use crate::error::RangeError;

/// Constructor input for [`Range`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RangeSpec {
    pub content_length: Option<u64>,
    pub start: Option<i64>,
    /// Exclusive unless `inclusive` is set.
    pub end: Option<i64>,
    pub length: Option<u64>,
    pub inclusive: bool,
    /// Fail instead of collapsing to a zero range when `start > end`.
    pub satisfiable: bool,
    /// Fail instead of clamping offsets that fall outside the content.
    pub strict_boundaries: bool,
}

impl RangeSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content_length(mut self, content_length: u64) -> Self {
        self.content_length = Some(content_length);
        self
    }

    pub fn start(mut self, start: i64) -> Self {
        self.start = Some(start);
        self
    }

    pub fn end(mut self, end: i64) -> Self {
        self.end = Some(end);
        self
    }

    pub fn length(mut self, length: u64) -> Self {
        self.length = Some(length);
        self
    }

    pub fn inclusive(mut self) -> Self {
        self.inclusive = true;
        self
    }

    pub fn satisfiable(mut self) -> Self {
        self.satisfiable = true;
        self
    }

    pub fn strict_boundaries(mut self) -> Self {
        self.strict_boundaries = true;
        self
    }

    pub fn build(self) -> Result<Range, RangeError> {
        Range::new(self)
    }
}

/// An immutable byte window over a source.
///
/// `end` is exclusive. Offsets are signed: while no content length is known a
/// negative value is relative to the end of the source.
#[derive(Clone)]
pub struct Range {
    content_length: Option<u64>,
    start: i64,
    end: Option<i64>,
    length: Option<u64>,
    max_length: Option<u64>,
    inclusive_end: Option<u64>,
    http_range: OnceLock<Option<String>>,
}

impl Range {
    pub fn new(spec: RangeSpec) -> Result<Self, RangeError> {
        let RangeSpec { content_length, start, end, length, inclusive, satisfiable, strict_boundaries } = spec;
        let start = start.unwrap_or(0);

        let (start, end, length, max_length) = match content_length {
            None => resolve_open(start, end, length, inclusive, satisfiable, strict_boundaries)?,
            Some(content_length) => {
                let (start, end) = resolve_sized(content_length, start, end, length, inclusive, satisfiable, strict_boundaries)?;
                let length = (end - start) as u64;
                (start, Some(end), Some(length), Some(length))
            }
        };

        let inclusive_end = match end {
            Some(end) if start >= 0 && end >= 0 && start < end => Some((end - 1) as u64),
            _ => None,
        };

        Ok(Range {
            content_length,
            start,
            end,
            length,
            max_length,
            inclusive_end,
            http_range: OnceLock::new(),
        })
    }

    /// The whole content, whatever its size.
    pub fn full() -> Self {
        Self::from_spec_unchecked(RangeSpec::new())
    }

    /// Returns `true` when `spec` describes a constructible range.
    pub fn is_valid(spec: RangeSpec) -> bool {
        Range::new(spec).is_ok()
    }

    // The default spec and specs derived from an already valid range never fail.
    fn from_spec_unchecked(spec: RangeSpec) -> Self {
        match Range::new(spec) {
            Ok(range) => range,
            Err(_) => Range {
                content_length: spec.content_length,
                start: 0,
                end: Some(0),
                length: Some(0),
                max_length: Some(0),
                inclusive_end: None,
                http_range: OnceLock::new(),
            },
        }
    }

    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn has_content_length(&self) -> bool {
        self.content_length.is_some()
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn end(&self) -> Option<i64> {
        self.end
    }

    /// Exact length, known once the range is resolved or provably empty.
    pub fn length(&self) -> Option<u64> {
        self.length
    }

    /// Upper bound of the length, known even for some open ranges.
    pub fn max_length(&self) -> Option<u64> {
        self.max_length
    }

    /// `end - 1` for absolute non-empty ranges. `None` covers open, relative
    /// and zero-length ranges alike.
    pub fn inclusive_end(&self) -> Option<u64> {
        self.inclusive_end
    }

    pub fn is_full_range(&self) -> bool {
        if self.start == 0 && self.end.is_none() {
            return true;
        }

        self.content_length.is_some() && self.content_length == self.length
    }

    pub fn is_zero_range(&self) -> bool {
        self.length == Some(0)
    }

    pub fn is_relative(&self) -> bool {
        self.start < 0 || self.end.is_some_and(|end| end < 0)
    }

    /// Absolute start offset, for resolved ranges.
    pub fn offset(&self) -> u64 {
        u64::try_from(self.start).unwrap_or(0)
    }

    pub fn is_valid_http_range(&self) -> bool {
        self.http_range().is_some()
    }

    /// Wire token for a `Range` request header: `start-inclusiveEnd`,
    /// `start-` or `-suffix`.
    pub fn http_range(&self) -> Option<&str> {
        self.http_range
            .get_or_init(|| {
                if self.start >= 0 {
                    match (self.inclusive_end, self.end) {
                        (Some(inclusive_end), _) => Some(format!("{}-{}", self.start, inclusive_end)),
                        (None, None) => Some(format!("{}-", self.start)),
                        _ => None,
                    }
                } else if self.end.is_none() {
                    Some(self.start.to_string())
                } else {
                    None
                }
            })
            .as_deref()
    }

    pub fn is_valid_http_content_range(&self) -> bool {
        self.http_content_range().is_some()
    }

    /// `Content-Range` header value, only for absolute non-empty ranges.
    pub fn http_content_range(&self) -> Option<String> {
        if self.start < 0 {
            return None;
        }

        let inclusive_end = self.inclusive_end?;

        Some(match self.content_length {
            Some(content_length) => format!("bytes {}-{}/{}", self.start, inclusive_end, content_length),
            None => format!("bytes {}-{}/*", self.start, inclusive_end),
        })
    }

    /// The spec this range would be rebuilt from: content length, start and
    /// end. Use it to derive a range with overridden fields.
    pub fn spec(&self) -> RangeSpec {
        RangeSpec {
            content_length: self.content_length,
            start: Some(self.start),
            end: self.end,
            ..RangeSpec::default()
        }
    }

    /// Derives a new range, resolving it against `content_length` when given
    /// and keeping the current one otherwise.
    pub fn create_range(&self, content_length: Option<u64>) -> Result<Range, RangeError> {
        let mut spec = self.spec();

        if content_length.is_some() {
            spec.content_length = content_length;
        }

        Range::new(spec)
    }

    /// Orders by absolute start, then by absolute end with open ends last.
    pub fn compare(&self, other: &Range) -> Ordering {
        let end = |range: &Range| range.end.map(i64::unsigned_abs).unwrap_or(u64::MAX);

        self.start
            .unsigned_abs()
            .cmp(&other.start.unsigned_abs())
            .then_with(|| end(self).cmp(&end(other)))
    }

    /// Whether `other` lies entirely within this range. Relative ranges
    /// never compare.
    pub fn includes(&self, other: &Range) -> bool {
        if self.is_relative() || other.is_relative() {
            return false;
        }

        self.start <= other.start && bound(self.end) >= bound(other.end)
    }

    pub fn inside(&self, other: &Range) -> bool {
        other.includes(self)
    }

    /// Whether the two windows share at least one byte.
    pub fn intersects(&self, other: &Range) -> bool {
        if self.is_relative() || other.is_relative() || self.is_zero_range() || other.is_zero_range() {
            return false;
        }

        self.start < bound(other.end) && other.start < bound(self.end)
    }

    /// Whether one window ends exactly where the other starts.
    pub fn is_consecutive(&self, other: &Range) -> bool {
        if self.is_relative() || other.is_relative() {
            return false;
        }

        self.end == Some(other.start) || other.end == Some(self.start)
    }

    /// Smallest range covering both windows.
    pub fn concat(&self, other: &Range) -> Result<Range, RangeError> {
        if self.includes(other) {
            Ok(self.clone())
        } else if self.inside(other) {
            Ok(other.clone())
        } else if self.intersects(other) || self.is_consecutive(other) {
            let end = match (self.end, other.end) {
                (Some(a), Some(b)) => Some(a.max(b)),
                _ => None,
            };

            Range::new(RangeSpec {
                content_length: self.content_length.or(other.content_length),
                start: Some(self.start.min(other.start)),
                end,
                ..RangeSpec::default()
            })
        } else {
            Err(RangeError::Disjoint)
        }
    }
}

fn bound(end: Option<i64>) -> i64 {
    end.unwrap_or(i64::MAX)
}

type Resolved = (i64, Option<i64>, Option<u64>, Option<u64>);

fn resolve_open(
    mut start: i64,
    end: Option<i64>,
    length: Option<u64>,
    inclusive: bool,
    satisfiable: bool,
    strict_boundaries: bool,
) -> Result<Resolved, RangeError> {
    let mut end = match (end, length) {
        (None, None) => None,
        (None, Some(length)) => {
            let end = start.saturating_add(i64::try_from(length).unwrap_or(i64::MAX));

            if start < 0 && end >= 0 {
                if strict_boundaries {
                    return Err(RangeError::OutOfRange);
                }
                None
            } else {
                Some(end)
            }
        }
        (Some(-1), _) if inclusive => None,
        (Some(end), _) if inclusive => Some(end.saturating_add(1)),
        (Some(end), _) => Some(end),
    };

    let max_length = if start < 0 {
        match end {
            None => Some(start.unsigned_abs()),
            Some(e) if e < 0 && start <= e => Some((e - start) as u64),
            Some(e) if e <= 0 => {
                if satisfiable {
                    return Err(RangeError::NotSatisfiable);
                }
                start = 0;
                end = Some(0);
                Some(0)
            }
            Some(e) => Some(e as u64),
        }
    } else {
        match end {
            None => None,
            Some(e) if e < 0 => None,
            Some(e) => {
                if start > e {
                    if satisfiable {
                        return Err(RangeError::NotSatisfiable);
                    }
                    start = 0;
                    end = Some(0);
                }
                end.map(|e| (e - start) as u64)
            }
        }
    };

    let length = if max_length == Some(0) { Some(0) } else { None };

    Ok((start, end, length, max_length))
}

fn resolve_sized(
    content_length: u64,
    start: i64,
    end: Option<i64>,
    length: Option<u64>,
    inclusive: bool,
    satisfiable: bool,
    strict_boundaries: bool,
) -> Result<(i64, i64), RangeError> {
    let size = i64::try_from(content_length).unwrap_or(i64::MAX);

    let clamp = |offset: i64| -> Result<i64, RangeError> {
        if offset < 0 {
            if strict_boundaries {
                return Err(RangeError::OutOfRange);
            }
            Ok(0)
        } else if offset > size {
            if strict_boundaries {
                return Err(RangeError::OutOfRange);
            }
            Ok(size)
        } else {
            Ok(offset)
        }
    };

    let start = clamp(if start < 0 { size + start } else { start })?;

    let end = match (end, length) {
        (None, None) => size,
        (None, Some(length)) => start.saturating_add(i64::try_from(length).unwrap_or(i64::MAX)),
        (Some(end), _) => {
            let end = match end {
                -1 if inclusive => size,
                end if inclusive => end.saturating_add(1),
                end => end,
            };

            if end < 0 { size + end } else { end }
        }
    };
    let end = clamp(end)?;

    if end < start {
        if satisfiable {
            return Err(RangeError::NotSatisfiable);
        }
        return Ok((0, 0));
    }

    Ok((start, end))
}

impl Default for Range {
    fn default() -> Self {
        Range::full()
    }
}

impl TryFrom<RangeSpec> for Range {
    type Error = RangeError;

    fn try_from(spec: RangeSpec) -> Result<Self, Self::Error> {
        Range::new(spec)
    }
}

impl PartialEq for Range {
    fn eq(&self, other: &Self) -> bool {
        self.content_length == other.content_length
            && self.start == other.start
            && self.end == other.end
            && self.length == other.length
            && self.max_length == other.max_length
    }
}

impl Eq for Range {}

impl fmt::Debug for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("Range");

        if let Some(content_length) = self.content_length {
            debug.field("content_length", &content_length);
        }
        debug.field("start", &self.start);
        if let Some(end) = self.end {
            debug.field("end", &end);
        }
        match (self.length, self.max_length) {
            (Some(length), _) => debug.field("length", &length),
            (None, Some(max_length)) => debug.field("max_length", &max_length),
            (None, None) => &mut debug,
        };

        debug.finish()
    }
}

impl Serialize for Range {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let fields = 1 + usize::from(self.content_length.is_some()) + usize::from(self.end.is_some());
        let mut state = serializer.serialize_struct("Range", fields)?;

        if let Some(content_length) = self.content_length {
            state.serialize_field("contentLength", &content_length)?;
        }
        state.serialize_field("start", &self.start)?;
        if let Some(end) = self.end {
            state.serialize_field("end", &end)?;
        }

        state.end()
    }
}

/// Parses a single byte-range-spec token: `0-499`, `500-` or `-500`.
impl FromStr for Range {
    type Err = RangeError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        let malformed = || RangeError::Malformed(token.to_string());
        let (first, last) = token.trim().split_once('-').ok_or_else(malformed)?;
        let (first, last) = (first.trim(), last.trim());

        let number = |digits: &str| -> Result<i64, RangeError> {
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return Err(malformed());
            }
            digits.parse::<i64>().map_err(|_| malformed())
        };

        let spec = match (first.is_empty(), last.is_empty()) {
            (true, true) => return Err(malformed()),
            // a zero-length suffix selects nothing
            (true, false) => match number(last)? {
                0 => RangeSpec::new().start(0).length(0),
                suffix => RangeSpec::new().start(-suffix),
            },
            (false, true) => RangeSpec::new().start(number(first)?),
            (false, false) => RangeSpec::new().start(number(first)?).end(number(last)?).inclusive(),
        };

        Range::new(spec)
    }
}
