use serde::Deserialize;

use crate::compress::Encoding;

pub const DEFAULT_MAX_RANGES: usize = 10;

/// Whether to compress: off, on, or on for bodies of at least this many
/// bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Compress {
    Enabled(bool),
    Threshold(u64),
}

impl Compress {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Compress::Enabled(false))
    }

    /// Whether a body of `content_length` bytes passes the threshold. An
    /// unknown length always does.
    pub fn admits(&self, content_length: Option<u64>) -> bool {
        match (self, content_length) {
            (Compress::Enabled(enabled), _) => *enabled,
            (Compress::Threshold(threshold), Some(length)) => length >= *threshold,
            (Compress::Threshold(_), None) => true,
        }
    }
}

impl Default for Compress {
    fn default() -> Self {
        Compress::Enabled(false)
    }
}

impl From<bool> for Compress {
    fn from(enabled: bool) -> Self {
        Compress::Enabled(enabled)
    }
}

/// Compressor tuning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CompressionOptions {
    /// Encoder specific quality, the encoder default when unset.
    pub level: Option<i32>,
}

/// Server wide delivery settings, shared by every response.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DeliveryOptions {
    pub compress: Compress,
    pub compression: CompressionOptions,
    pub max_ranges: usize,
    /// Used when the client only accepts `*`.
    pub default_encoding: Encoding,
}

impl Default for DeliveryOptions {
    fn default() -> Self {
        DeliveryOptions {
            compress: Compress::default(),
            compression: CompressionOptions::default(),
            max_ranges: DEFAULT_MAX_RANGES,
            default_encoding: Encoding::Gzip,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize() {
        let options: DeliveryOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(options, DeliveryOptions::default());
        assert_eq!(options.max_ranges, 10);

        let options: DeliveryOptions = serde_json::from_str(
            r#"{ "compress": 1024, "compression": { "level": 6 }, "max_ranges": 2, "default_encoding": "br" }"#,
        )
        .unwrap();
        assert_eq!(options.compress, Compress::Threshold(1024));
        assert_eq!(options.compression.level, Some(6));
        assert_eq!(options.max_ranges, 2);
        assert_eq!(options.default_encoding, Encoding::Br);

        let options: DeliveryOptions = serde_json::from_str(r#"{ "compress": true }"#).unwrap();
        assert_eq!(options.compress, Compress::Enabled(true));
    }

    #[test]
    fn test_threshold() {
        assert!(!Compress::Enabled(false).admits(Some(1 << 20)));
        assert!(Compress::Enabled(true).admits(Some(1)));
        assert!(Compress::Threshold(100).admits(Some(100)));
        assert!(!Compress::Threshold(100).admits(Some(99)));
        assert!(Compress::Threshold(100).admits(None));
        assert!(Compress::Threshold(0).is_enabled());
    }
}
