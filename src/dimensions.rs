//! Dimension token parsing for the `WxH` / `W` convention.
//!
//! Every derivative is addressed by a dimension token that appears verbatim in
//! its cache key and URL:
//!
//! - `"800x600"` → width=800, height=Some(600) (box; crop mode decides the fit)
//! - `"800"` → width=800, height=None (proportional resize to width)
//!
//! Tokens are canonical: no leading zeros, no zero values, no units, no
//! surrounding whitespace. That keeps [`DimensionSpec`]'s `Display` output
//! byte-identical to the token it was parsed from, so a parsed spec can always
//! be turned back into the same cache key.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A token that is not `WxH` or `W` with positive, canonical integers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid dimensions: {0:?} (expected \"WxH\" or \"W\")")]
pub struct InvalidDimensions(pub String);

/// Target size of a derivative in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DimensionSpec {
    pub width: u32,
    pub height: Option<u32>,
}

impl DimensionSpec {
    pub fn new(width: u32, height: Option<u32>) -> Self {
        Self { width, height }
    }

    /// Parse a dimension token.
    pub fn parse(token: &str) -> Result<Self, InvalidDimensions> {
        let invalid = || InvalidDimensions(token.to_string());
        match token.split_once('x') {
            Some((w, h)) => Ok(Self {
                width: parse_pixels(w).ok_or_else(invalid)?,
                height: Some(parse_pixels(h).ok_or_else(invalid)?),
            }),
            None => Ok(Self {
                width: parse_pixels(token).ok_or_else(invalid)?,
                height: None,
            }),
        }
    }

    /// Pixel area used to order candidates from small to large.
    ///
    /// A width-only spec has area 0, so width-only entries sort first and
    /// keep their relative order under a stable sort.
    pub fn area(&self) -> u64 {
        self.width as u64 * self.height.unwrap_or(0) as u64
    }

    /// The token form, e.g. `"800x600"` or `"800"`.
    pub fn token(&self) -> String {
        self.to_string()
    }
}

/// Parse one axis: ASCII digits only, no leading zero, non-zero, fits in u32.
fn parse_pixels(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) || s.starts_with('0') {
        return None;
    }
    s.parse().ok()
}

impl fmt::Display for DimensionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.height {
            Some(h) => write!(f, "{}x{}", self.width, h),
            None => write!(f, "{}", self.width),
        }
    }
}

impl FromStr for DimensionSpec {
    type Err = InvalidDimensions;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for DimensionSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DimensionSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let token = String::deserialize(deserializer)?;
        Self::parse(&token).map_err(serde::de::Error::custom)
    }
}
