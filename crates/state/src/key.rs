/// Derive the stable key an attachment is stored under.
///
/// Remote file URLs carry expiring signatures in their query string, so the
/// query and fragment are dropped, the scheme and host are lowercased (the
/// path is case-sensitive and kept as is), and the result is hashed with
/// BLAKE3. Two URLs that differ only in their signature share a key.
///
/// ```
/// use pagesync_state::attachment_key;
///
/// assert_eq!(
///     attachment_key("https://files.example/ws/a.png?X-Amz-Signature=1"),
///     attachment_key("HTTPS://Files.Example/ws/a.png?X-Amz-Signature=2"),
/// );
/// ```
pub fn attachment_key(url: &str) -> String {
    blake3::hash(normalize_url(url).as_bytes()).to_hex().to_string()
}

fn normalize_url(url: &str) -> String {
    let url = url.trim();
    let url = url.split(['?', '#']).next().unwrap_or_default();
    match url.split_once("://") {
        Some((scheme, rest)) => {
            let (host, path) = rest.split_at(rest.find('/').unwrap_or(rest.len()));
            format!("{}://{}{}", scheme.to_ascii_lowercase(), host.to_ascii_lowercase(), path)
        },
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("https://files.example/a/B.png?sig=1", "https://files.example/a/B.png")]
    #[case("https://FILES.example/a/B.png#frag", "https://files.example/a/B.png")]
    #[case("HTTPS://files.example", "https://files.example")]
    #[case("  https://files.example/x  ", "https://files.example/x")]
    #[case("relative/path.png?x=1", "relative/path.png")]
    fn test_normalize_url(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(normalize_url(input), expected);
    }

    #[test]
    fn test_key_ignores_signature_but_not_path_case() {
        let a = attachment_key("https://files.example/ws/File.png?X-Amz-Date=20240101");
        let b = attachment_key("https://files.example/ws/File.png?X-Amz-Date=20240202");
        let c = attachment_key("https://files.example/ws/file.png");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
