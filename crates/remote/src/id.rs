//! Resource identifiers and share-URL parsing.

use crate::error::{ErrorKind, Result};
use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

static HEX_ID: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?:^|-)([0-9a-f]{32})$").expect("static regex"));

/// Stable remote identifier, always stored in the canonical lowercase
/// hyphenated `8-4-4-4-12` form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceId(String);

impl ResourceId {
    /// Parse an identifier out of a raw ID, a UUID, or a share URL.
    ///
    /// Supported inputs:
    /// - `0123456789abcdef0123456789abcdef`
    /// - `01234567-89ab-cdef-0123-456789abcdef`
    /// - `https://www.notion.so/{workspace}/{title}-{id}`
    /// - `https://www.notion.so/{id}?v={view}`
    ///
    /// # Examples
    ///
    /// ```
    /// use pagesync_remote::ResourceId;
    ///
    /// let id = ResourceId::parse("https://www.notion.so/team/Roadmap-0123456789abcdef0123456789abcdef").unwrap();
    /// assert_eq!(id.as_str(), "01234567-89ab-cdef-0123-456789abcdef");
    /// assert!(ResourceId::parse("not an id").is_err());
    /// ```
    pub fn parse(input: impl AsRef<str>) -> Result<Self> {
        let input = input.as_ref().trim();
        if input.is_empty() {
            exn::bail!(ErrorKind::InvalidId(input.to_string()));
        }
        // Drop the query string and fragment; view IDs live there and would
        // otherwise be mistaken for the resource ID.
        let path = input.split(['?', '#']).next().unwrap_or_default();
        let path = path.split_once("://").map(|(_, rest)| rest).unwrap_or(path);
        for segment in path.split('/').rev() {
            if let Some(raw) = Self::extract_raw(segment) {
                return Ok(Self::from_raw(&raw));
            }
        }
        exn::bail!(ErrorKind::InvalidId(input.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The ID without hyphens, as used in share URLs.
    pub fn compact(&self) -> String {
        self.0.replace('-', "")
    }

    fn extract_raw(candidate: &str) -> Option<String> {
        let lowered = candidate.to_ascii_lowercase();
        let compact = lowered.replace('-', "");
        if compact.len() == 32 && compact.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Some(compact);
        }
        // Title slugs end in the ID: `My-Page-0123...cdef`.
        HEX_ID.captures(&lowered).map(|c| c[1].to_string())
    }

    fn from_raw(raw: &str) -> Self {
        Self(format!("{}-{}-{}-{}-{}", &raw[0..8], &raw[8..12], &raw[12..16], &raw[16..20], &raw[20..32]))
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ResourceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl FromStr for ResourceId {
    type Err = crate::error::Error;
    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const CANONICAL: &str = "01234567-89ab-cdef-0123-456789abcdef";

    #[rstest]
    #[case("0123456789abcdef0123456789abcdef")]
    #[case("01234567-89ab-cdef-0123-456789abcdef")]
    #[case("0123456789ABCDEF0123456789ABCDEF")]
    #[case("  0123456789abcdef0123456789abcdef  ")]
    #[case("https://www.notion.so/0123456789abcdef0123456789abcdef")]
    #[case("https://www.notion.so/workspace/0123456789abcdef0123456789abcdef")]
    #[case("https://www.notion.so/workspace/My-Page-Title-0123456789abcdef0123456789abcdef")]
    #[case("https://www.notion.so/workspace/0123456789abcdef0123456789abcdef?v=fedcba9876543210fedcba9876543210")]
    #[case("https://www.notion.so/workspace/01234567-89ab-cdef-0123-456789abcdef")]
    fn test_parse_valid(#[case] input: &str) {
        assert_eq!(ResourceId::parse(input).unwrap().as_str(), CANONICAL);
    }

    #[rstest]
    #[case("")]
    #[case("   ")]
    #[case("not-an-id")]
    #[case("https://www.notion.so/workspace/Some-Page")]
    #[case("0123456789abcdef")]
    #[case("f0123456789abcdef0123456789abcdef")]
    #[case("https://www.notion.so/workspace/Page-ff0123456789abcdef0123456789abcdef")]
    #[case("https://www.notion.so/workspace/Pagef0123456789abcdef0123456789abcdef")]
    fn test_parse_invalid(#[case] input: &str) {
        let err = ResourceId::parse(input).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidId(_)));
    }

    #[test]
    fn test_compact() {
        let id = ResourceId::parse(CANONICAL).unwrap();
        assert_eq!(id.compact(), "0123456789abcdef0123456789abcdef");
        assert_eq!(id.to_string(), CANONICAL);
    }
}
