//! Naming and linking helpers for output files.

use pagesync_remote::BlockKind;
use pagesync_storage::sanitize_filename;
use std::path::{Component, Path};

/// Hex BLAKE3 digest of rendered output.
pub(crate) fn content_hash(content: &str) -> String {
    blake3::hash(content.as_bytes()).to_hex().to_string()
}

/// Local filename for a downloaded attachment.
///
/// Keeps the name from the URL path (hosted files often share generic names,
/// so a short key prefix keeps them apart); falls back to the key with an
/// extension guessed from the block kind.
pub(crate) fn attachment_file_name(url: &str, key: &str, kind: &BlockKind) -> String {
    let short = &key[..key.len().min(8)];
    let path = url.split(['?', '#']).next().unwrap_or_default();
    let path = path.split_once("://").map(|(_, rest)| rest).unwrap_or(path);
    let last = path.split_once('/').map(|(_, p)| p).unwrap_or_default();
    let last = last.rsplit('/').next().unwrap_or_default().replace("%20", " ");
    match last.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() && ext.len() <= 8 => {
            let stem = sanitize_filename(stem).replace(' ', "_");
            let ext = ext.to_ascii_lowercase();
            format!("{stem}_{short}.{ext}")
        },
        _ => format!("{}.{}", &key[..key.len().min(16)], default_extension(kind)),
    }
}

fn default_extension(kind: &BlockKind) -> &'static str {
    match kind {
        BlockKind::Image => "png",
        BlockKind::Pdf => "pdf",
        BlockKind::Audio => "mp3",
        BlockKind::Video => "mp4",
        _ => "bin",
    }
}

/// Link from a document inside `from_folder` to `target`, both relative to
/// the output root, using `/` separators.
pub(crate) fn relative_link(from_folder: &Path, target: &Path) -> String {
    let depth = from_folder.components().filter(|c| matches!(c, Component::Normal(_))).count();
    let mut link = "../".repeat(depth);
    let parts: Vec<_> = target
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect();
    link.push_str(&parts.join("/"));
    link
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const KEY: &str = "0123456789abcdef0123456789abcdef";

    #[rstest]
    #[case("https://files.example/ws/abc/Screen%20Shot.PNG?X-Amz=1", BlockKind::Image, "Screen_Shot_01234567.png")]
    #[case("https://files.example/ws/abc/report.pdf", BlockKind::File, "report_01234567.pdf")]
    #[case("https://files.example/ws/abc/download", BlockKind::Pdf, "0123456789abcdef.pdf")]
    #[case("https://files.example/", BlockKind::Image, "0123456789abcdef.png")]
    #[case("https://files.example/.hidden", BlockKind::Video, "0123456789abcdef.mp4")]
    fn test_attachment_file_name(#[case] url: &str, #[case] kind: BlockKind, #[case] expected: &str) {
        assert_eq!(attachment_file_name(url, KEY, &kind), expected);
    }

    #[rstest]
    #[case("", "attachments/a.png", "attachments/a.png")]
    #[case("Tasks", "attachments/a.png", "../attachments/a.png")]
    #[case("Tasks/Archive", "media/a b.png", "../../media/a b.png")]
    fn test_relative_link(#[case] from: &str, #[case] target: &str, #[case] expected: &str) {
        assert_eq!(relative_link(Path::new(from), Path::new(target)), expected);
    }

    #[test]
    fn test_content_hash_is_stable() {
        assert_eq!(content_hash("# Plan\n"), content_hash("# Plan\n"));
        assert_ne!(content_hash("# Plan\n"), content_hash("# Plan\n\n"));
        assert_eq!(content_hash("").len(), 64);
    }
}
