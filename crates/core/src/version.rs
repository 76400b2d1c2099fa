//! Chart version ordinals.
//!
//! A dotted `major.minor.patch` string is turned into a single integer by
//! zero-padding every component to a fixed width and concatenating them, so
//! plain integer comparison matches release ordering:
//!
//! - `0.2.2` at width 3 -> `000002002` -> `2002`
//! - `0.4.0` at width 3 -> `000004000` -> `4000`
//!
//! Ordinals only compare when built with the same width.

#![forbid(unsafe_code)]

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Digits reserved per component unless a caller asks otherwise.
pub const DEFAULT_ORDINAL_WIDTH: usize = 3;

/// Number of components an ordinal is built from. Shorter versions are padded
/// with zero components (`0.4` == `0.4.0`).
pub const VERSION_COMPONENTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VersionParseError {
    #[error("empty version string")]
    Empty,
    #[error("invalid version {version:?}: component {component:?} is not numeric")]
    NonNumeric { version: String, component: String },
    #[error("invalid version {version:?}: expected at most {VERSION_COMPONENTS} components")]
    TooManyComponents { version: String },
    #[error("invalid version {version:?}: component {component} does not fit in {width} digits")]
    ComponentTooWide { version: String, component: u64, width: usize },
    #[error("invalid ordinal width {0} (expected 1..=6)")]
    Width(usize),
}

/// Parsed dotted chart version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartVersion {
    raw: String,
    components: [u64; VERSION_COMPONENTS],
}

impl ChartVersion {
    pub fn parse(s: &str) -> Result<Self, VersionParseError> {
        let trimmed = s.trim();
        let body = trimmed.strip_prefix('v').unwrap_or(trimmed);
        if body.is_empty() {
            return Err(VersionParseError::Empty);
        }
        let parts: Vec<&str> = body.split('.').collect();
        // Non-numeric wins over the count so `0.4.0-rc.1` reads as a bad component.
        if let Some(bad) = parts.iter().find(|p| p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit())) {
            return Err(VersionParseError::NonNumeric { version: s.to_string(), component: (*bad).to_string() });
        }
        if parts.len() > VERSION_COMPONENTS {
            return Err(VersionParseError::TooManyComponents { version: s.to_string() });
        }
        let mut components = [0u64; VERSION_COMPONENTS];
        for (slot, part) in components.iter_mut().zip(parts.iter()) {
            *slot = part.parse::<u64>().map_err(|_| VersionParseError::NonNumeric {
                version: s.to_string(),
                component: (*part).to_string(),
            })?;
        }
        Ok(Self { raw: trimmed.to_string(), components })
    }

    pub fn as_str(&self) -> &str { &self.raw }

    pub fn components(&self) -> [u64; VERSION_COMPONENTS] { self.components }

    /// Build the padded ordinal. Components wider than `width` digits are
    /// rejected instead of silently bleeding into the next component.
    pub fn ordinal(&self, width: usize) -> Result<Ordinal, VersionParseError> {
        if width == 0 || width > 6 {
            return Err(VersionParseError::Width(width));
        }
        let limit = 10u64.pow(width as u32);
        let mut value = 0u64;
        for c in self.components {
            if c >= limit {
                return Err(VersionParseError::ComponentTooWide { version: self.raw.clone(), component: c, width });
            }
            value = value * limit + c;
        }
        Ok(Ordinal { value, width: width as u8 })
    }
}

impl fmt::Display for ChartVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.raw) }
}

/// Integer form of a [`ChartVersion`] at a given width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ordinal {
    value: u64,
    width: u8,
}

impl Ordinal {
    pub fn value(&self) -> u64 { self.value }
    pub fn width(&self) -> usize { self.width as usize }
}

impl PartialOrd for Ordinal {
    /// `None` when widths differ: such ordinals carry no ordering.
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.width != other.width {
            return None;
        }
        Some(self.value.cmp(&other.value))
    }
}

impl fmt::Display for Ordinal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{}", self.value) }
}

/// Parse `version` and build its ordinal in one step.
pub fn ordinal(version: &str, width: usize) -> Result<Ordinal, VersionParseError> {
    ChartVersion::parse(version)?.ordinal(width)
}
