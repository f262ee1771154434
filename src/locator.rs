use std::fmt;
use std::path::Path;

use crate::error::{PrepError, Result};

/// Default suffix marking a perspective-corrected image
pub const DEFAULT_RECTANGLED_SUFFIX: &str = "-deskewed";

const DEFAULT_SCHEME: &str = "s3";

/// A `scheme://bucket/key` object location
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Locator {
    pub scheme: String,
    pub bucket: String,
    pub key: String,
}

impl Locator {
    pub fn new(scheme: impl Into<String>, bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Parse a locator as it appears in annotation output.
    ///
    /// The text is HTML-unescaped first. A missing scheme defaults to `s3`.
    /// The bucket is everything up to the first `/`, the key everything after.
    pub fn parse(raw: &str) -> Result<Self> {
        let text = html_unescape(raw.trim());
        let (scheme, rest) = match text.split_once("://") {
            Some((scheme, rest)) => (scheme, rest),
            None => (DEFAULT_SCHEME, text.as_str()),
        };
        let (bucket, key) = rest
            .split_once('/')
            .ok_or_else(|| PrepError::Locator(raw.to_string()))?;
        if scheme.is_empty() || bucket.is_empty() || key.is_empty() {
            return Err(PrepError::Locator(raw.to_string()));
        }
        Ok(Self::new(scheme, bucket, key))
    }

    /// Same bucket, different key
    pub fn with_key(&self, key: impl Into<String>) -> Self {
        Self::new(self.scheme.clone(), self.bucket.clone(), key)
    }

    /// Location of the rectangled copy: at the bucket root, named after the
    /// source file.
    pub fn rectangled(&self, suffix: &str) -> Self {
        self.with_key(rectangled_name(&self.key, suffix))
    }

    /// Last path segment of the key
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.bucket, self.key)
    }
}

/// Insert `suffix` before the extension, dropping any directories:
/// `scans/page.jpg` becomes `page-deskewed.jpg`.
pub fn rectangled_name(name: &str, suffix: &str) -> String {
    let base = name.rsplit('/').next().unwrap_or(name);
    let path = Path::new(base);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy())
        .unwrap_or_default();
    match path.extension() {
        Some(ext) => format!("{}{}.{}", stem, suffix, ext.to_string_lossy()),
        None => format!("{}{}", stem, suffix),
    }
}

/// Decode the character references annotation tools leave in locators
pub fn html_unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        let decoded = tail.find(';').and_then(|end| {
            let entity = &tail[1..end];
            decode_entity(entity).map(|c| (c, end + 1))
        });
        match decoded {
            Some((c, len)) => {
                out.push(c);
                rest = &tail[len..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(entity: &str) -> Option<char> {
    match entity {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        _ => {
            let number = entity.strip_prefix('#')?;
            let hex = number.strip_prefix('x').or_else(|| number.strip_prefix('X'));
            let code = match hex {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => number.parse().ok()?,
            };
            char::from_u32(code)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_s3_locator() {
        let loc = Locator::parse("s3://my-bucket/scans/page 1.jpg").unwrap();
        assert_eq!(loc.scheme, "s3");
        assert_eq!(loc.bucket, "my-bucket");
        assert_eq!(loc.key, "scans/page 1.jpg");
        assert_eq!(loc.file_name(), "page 1.jpg");
        assert_eq!(loc.to_string(), "s3://my-bucket/scans/page 1.jpg");
    }

    #[test]
    fn test_parse_unescapes_and_defaults_scheme() {
        let loc = Locator::parse("bucket/a&amp;b&#39;s.png").unwrap();
        assert_eq!(loc.scheme, "s3");
        assert_eq!(loc.key, "a&b's.png");
    }

    #[test]
    fn test_parse_rejects_missing_key() {
        assert!(Locator::parse("s3://bucket").is_err());
        assert!(Locator::parse("s3:///key").is_err());
        assert!(Locator::parse("s3://bucket/").is_err());
    }

    #[test]
    fn test_rectangled_name() {
        assert_eq!(rectangled_name("scans/page.jpg", "-deskewed"), "page-deskewed.jpg");
        assert_eq!(rectangled_name("archive.tar.gz", "-deskewed"), "archive.tar-deskewed.gz");
        assert_eq!(rectangled_name("noext", "-deskewed"), "noext-deskewed");
    }

    #[test]
    fn test_rectangled_locator_moves_to_bucket_root() {
        let loc = Locator::parse("s3://b/in/photo.png").unwrap();
        assert_eq!(loc.rectangled("-deskewed").to_string(), "s3://b/photo-deskewed.png");
    }

    #[test]
    fn test_unescape_leaves_unknown_entities() {
        assert_eq!(html_unescape("a&nbsp;b & c&#x41;"), "a&nbsp;b & cA");
    }
}
