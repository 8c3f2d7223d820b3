//! Path validation and filename utilities.
//!
//! Paths handed to a backend are relative to the output root; these helpers
//! keep them there and turn remote titles into safe filenames.

use std::path::{Component, Path, PathBuf};

use crate::error::{ErrorKind, Result};

/// Longest filename (in bytes) produced by [`sanitize_filename`].
pub const MAX_FILENAME_BYTES: usize = 200;

/// Validates an output path for security and correctness.
/// Ensures that paths don't escape the output root (no `..` traversal).
///
/// > **Note:** This does **not** normalize backslashes, non-UTF8 bytes, or
/// >           platform-specific weirdness. Null bytes are explicitly rejected.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use pagesync_storage::validate_path;
/// // Valid paths
/// assert!(validate_path("Tasks/Launch plan.md").is_ok());
/// assert!(validate_path("a/../page.md").is_ok()); // (never leaves output root)
/// // Invalid paths
/// assert!(validate_path("../etc/passwd").is_err());
/// assert!(validate_path("a\0b").is_err());
/// // Paths get resolved
/// assert_eq!(
///     validate_path("wrong/.././attachments//./a.png/").unwrap(),
///     Path::new("attachments/a.png")
/// );
/// ```
pub fn validate(path: impl AsRef<Path>) -> Result<PathBuf> {
    let mut components = Vec::new();
    for component in path.as_ref().components() {
        match component {
            Component::Normal(s) => {
                // Null bytes pass through Path::components() on Unix but cause
                // truncation in C-based syscalls.
                if s.as_encoded_bytes().contains(&0) {
                    exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf()));
                }
                components.push(s)
            },
            Component::CurDir | Component::RootDir => {},
            Component::Prefix(_) => exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf())),
            Component::ParentDir => {
                if components.pop().is_none() {
                    exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf()));
                }
            },
        }
    }
    match components.is_empty() {
        true => exn::bail!(ErrorKind::InvalidPath(path.as_ref().to_path_buf())),
        false => Ok(components.into_iter().collect()),
    }
}

/// Turn a page title into a single safe path component.
///
/// Separators and colons become `-`, characters most filesystems reject are
/// dropped, newlines become spaces, and the result is trimmed and capped at
/// [`MAX_FILENAME_BYTES`] on a character boundary. Nothing left means
/// `Untitled`.
///
/// ```
/// use pagesync_storage::sanitize_filename;
///
/// assert_eq!(sanitize_filename("Q3: plans/goals?"), "Q3- plans-goals");
/// assert_eq!(sanitize_filename("  "), "Untitled");
/// ```
pub fn sanitize_filename(title: &str) -> String {
    let mut name: String = title
        .chars()
        .filter_map(|c| match c {
            '/' | '\\' | ':' => Some('-'),
            '*' | '?' | '"' | '<' | '>' | '|' | '\0' => None,
            '\n' | '\r' | '\t' => Some(' '),
            c => Some(c),
        })
        .collect();
    name = name.trim().trim_matches('.').trim().to_string();
    if name.len() > MAX_FILENAME_BYTES {
        let mut end = MAX_FILENAME_BYTES;
        while !name.is_char_boundary(end) {
            end -= 1;
        }
        name.truncate(end);
        name = name.trim_end().to_string();
    }
    if name.is_empty() { "Untitled".to_string() } else { name }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_valid_paths() {
        assert_eq!(validate(Path::new("Tasks/page.md")).unwrap(), Path::new("Tasks/page.md"));
        assert_eq!(validate(Path::new("page.md")).unwrap(), Path::new("page.md"));
        // Double slashes and current-dir references are normalized
        assert_eq!(validate(Path::new("a//b/./c")).unwrap(), Path::new("a/b/c"));
        // Traversal that stays within the root
        assert_eq!(validate(Path::new("a/b/..")).unwrap(), Path::new("a"));
    }

    #[rstest]
    #[case("../etc/passwd")]
    #[case("a/../../b")]
    #[case("..")]
    #[case("a\0b")]
    #[case("")]
    #[case("./")]
    #[case("//")]
    fn test_invalid_paths(#[case] path: &str) {
        let err = validate(Path::new(path)).unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidPath(_)));
    }

    #[rstest]
    #[case("Launch plan", "Launch plan")]
    #[case("a/b\\c:d", "a-b-c-d")]
    #[case("What? \"Now\" <here> | *", "What Now here")]
    #[case("line one\nline two", "line one line two")]
    #[case("   padded   ", "padded")]
    #[case("...", "Untitled")]
    #[case("", "Untitled")]
    #[case("???", "Untitled")]
    fn test_sanitize_filename(#[case] title: &str, #[case] expected: &str) {
        assert_eq!(sanitize_filename(title), expected);
    }

    #[test]
    fn test_sanitize_filename_truncates_on_char_boundary() {
        let title = "é".repeat(150);
        let name = sanitize_filename(&title);
        assert!(name.len() <= MAX_FILENAME_BYTES);
        assert_eq!(name.chars().count(), 100);
    }
}
