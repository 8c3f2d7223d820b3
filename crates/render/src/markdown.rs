use crate::error::{ErrorKind, Result};
use crate::{Document, Render};
use exn::ResultExt;
use pagesync_remote::{Block, BlockKind};
use std::fmt::{self, Write};

const INDENT: &str = "    ";

/// Renders a page as Markdown with a YAML frontmatter header.
///
/// Output is deterministic: properties are emitted in name order and the same
/// document always produces byte-identical text, which is what makes content
/// hashing a reliable change detector.
#[derive(Debug, Clone, Default)]
pub struct MarkdownRenderer {
    strict: bool,
}

impl MarkdownRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail on block types that would otherwise be rendered as a comment.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    fn write_frontmatter(&self, out: &mut String, doc: &Document<'_>) -> fmt::Result {
        writeln!(out, "---")?;
        writeln!(out, "id: {}", doc.resource.id)?;
        writeln!(out, "title: {}", yaml_string(&doc.resource.title))?;
        for (name, value) in &doc.resource.properties {
            writeln!(out, "{}: {}", yaml_key(name), yaml_string(value))?;
        }
        writeln!(out, "---")?;
        writeln!(out)
    }

    fn write_blocks(&self, out: &mut String, blocks: &[Block], depth: usize, doc: &Document<'_>) -> fmt::Result {
        let indent = INDENT.repeat(depth);
        let mut number = 0;
        let mut in_list = false;
        for block in blocks {
            let is_list = matches!(
                block.kind,
                BlockKind::BulletedListItem | BlockKind::NumberedListItem | BlockKind::ToDo | BlockKind::Toggle
            );
            if in_list && !is_list {
                writeln!(out)?;
            }
            if block.kind != BlockKind::NumberedListItem {
                number = 0;
            }
            match &block.kind {
                BlockKind::Paragraph => {
                    if block.text.is_empty() {
                        writeln!(out)?;
                    } else {
                        writeln!(out, "{indent}{}\n", block.text)?;
                    }
                },
                BlockKind::Heading1 => writeln!(out, "{indent}# {}\n", block.text)?,
                BlockKind::Heading2 => writeln!(out, "{indent}## {}\n", block.text)?,
                BlockKind::Heading3 => writeln!(out, "{indent}### {}\n", block.text)?,
                BlockKind::BulletedListItem | BlockKind::Toggle => writeln!(out, "{indent}- {}", block.text)?,
                BlockKind::NumberedListItem => {
                    number += 1;
                    writeln!(out, "{indent}{number}. {}", block.text)?;
                },
                BlockKind::ToDo => {
                    let mark = if block.checked.unwrap_or(false) { 'x' } else { ' ' };
                    writeln!(out, "{indent}- [{mark}] {}", block.text)?;
                },
                BlockKind::Quote => {
                    for line in block.text.lines() {
                        writeln!(out, "{indent}> {line}")?;
                    }
                    writeln!(out)?;
                },
                BlockKind::Callout => {
                    writeln!(out, "{indent}> [!note]")?;
                    for line in block.text.lines() {
                        writeln!(out, "{indent}> {line}")?;
                    }
                    writeln!(out)?;
                },
                BlockKind::Code => {
                    let language = block.language.as_deref().filter(|l| *l != "plain text").unwrap_or("");
                    writeln!(out, "{indent}```{language}")?;
                    for line in block.text.lines() {
                        writeln!(out, "{indent}{line}")?;
                    }
                    writeln!(out, "{indent}```\n")?;
                },
                BlockKind::Divider => writeln!(out, "{indent}---\n")?,
                BlockKind::Bookmark => {
                    let url = block.url.as_deref().unwrap_or_default();
                    let label = if block.text.is_empty() { url } else { block.text.as_str() };
                    writeln!(out, "{indent}[{label}]({url})\n")?;
                },
                BlockKind::ChildPage | BlockKind::ChildCollection => writeln!(out, "{indent}[[{}]]\n", block.text)?,
                BlockKind::Image => {
                    let target = attachment_target(block, doc);
                    writeln!(out, "{indent}![{}]({target})\n", block.text)?;
                },
                BlockKind::File | BlockKind::Pdf | BlockKind::Audio | BlockKind::Video => {
                    let target = attachment_target(block, doc);
                    let label = if block.text.is_empty() { file_name(&target) } else { block.text.clone() };
                    writeln!(out, "{indent}[{label}]({target})\n")?;
                },
                BlockKind::Unsupported(name) => {
                    tracing::debug!(block = %name, "Rendering unsupported block as a comment");
                    writeln!(out, "{indent}<!-- unsupported block: {name} -->\n")?;
                },
            }
            if !block.children.is_empty() {
                self.write_blocks(out, &block.children, depth + 1, doc)?;
            }
            in_list = is_list;
        }
        if in_list && depth == 0 {
            writeln!(out)?;
        }
        Ok(())
    }
}

impl Render for MarkdownRenderer {
    fn extension(&self) -> &'static str {
        "md"
    }

    fn render(&self, doc: &Document<'_>) -> Result<String> {
        if self.strict
            && let Some(name) = doc.blocks.iter().flat_map(Block::walk).find_map(|b| match &b.kind {
                BlockKind::Unsupported(name) => Some(name.clone()),
                _ => None,
            })
        {
            exn::bail!(ErrorKind::Unsupported(name));
        }
        let mut out = String::new();
        self.write_frontmatter(&mut out, doc).or_raise(|| ErrorKind::Format)?;
        self.write_blocks(&mut out, doc.blocks, 0, doc).or_raise(|| ErrorKind::Format)?;
        // Exactly one trailing newline.
        let trimmed = out.trim_end().len();
        out.truncate(trimmed);
        out.push('\n');
        Ok(out)
    }
}

/// Local link when the attachment was downloaded, remote URL otherwise.
fn attachment_target(block: &Block, doc: &Document<'_>) -> String {
    let url = block.url.as_deref().unwrap_or_default();
    match doc.attachments.get(url) {
        Some(local) => local.replace(' ', "%20"),
        None => url.to_string(),
    }
}

fn file_name(target: &str) -> String {
    let path = target.split(['?', '#']).next().unwrap_or_default();
    path.rsplit('/').next().unwrap_or(path).to_string()
}

fn yaml_string(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        match c {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            '\t' => quoted.push_str("\\t"),
            c => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}

fn yaml_key(name: &str) -> String {
    let plain = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == ' ')
        && !name.starts_with([' ', '-'])
        && !name.ends_with(' ');
    if plain { name.to_string() } else { yaml_string(name) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagesync_remote::{Resource, ResourceId};
    use rstest::rstest;
    use std::collections::BTreeMap;
    use time::macros::datetime;

    fn resource() -> Resource {
        Resource::page(
            ResourceId::parse("0123456789abcdef0123456789abcdef").unwrap(),
            "Launch \"plan\"",
            datetime!(2024-03-01 10:00 UTC),
        )
        .with_property("Status", "Done")
        .with_property("Due: date", "2024-04-01")
    }

    fn render(blocks: &[Block], attachments: &BTreeMap<String, String>) -> String {
        let resource = resource();
        let doc = Document {
            resource: &resource,
            blocks,
            attachments,
        };
        MarkdownRenderer::new().render(&doc).unwrap()
    }

    #[test]
    fn test_frontmatter() {
        let out = render(&[], &BTreeMap::new());
        assert_eq!(
            out,
            "---\nid: 01234567-89ab-cdef-0123-456789abcdef\ntitle: \"Launch \\\"plan\\\"\"\n\"Due: date\": \"2024-04-01\"\nStatus: \"Done\"\n---\n"
        );
    }

    #[test]
    fn test_lists_and_nesting() {
        let blocks = vec![
            Block::new("1", BlockKind::Heading1, "Tasks"),
            Block::new("2", BlockKind::NumberedListItem, "first"),
            Block::new("3", BlockKind::NumberedListItem, "second")
                .with_children(vec![Block::new("4", BlockKind::BulletedListItem, "nested")]),
            Block::new("5", BlockKind::Paragraph, "after"),
            Block::new("6", BlockKind::ToDo, "open"),
        ];
        let out = render(&blocks, &BTreeMap::new());
        let body = out.split("---\n\n").nth(1).unwrap();
        assert_eq!(body, "# Tasks\n\n1. first\n2. second\n    - nested\n\nafter\n\n- [ ] open\n");
    }

    #[test]
    fn test_code_block() {
        let mut code = Block::new("1", BlockKind::Code, "fn main() {}\n");
        code.language = Some("rust".to_string());
        let out = render(&[code], &BTreeMap::new());
        assert!(out.ends_with("```rust\nfn main() {}\n```\n"));
    }

    #[rstest]
    #[case(true, "![diagram](attachments/abc%20def.png)")]
    #[case(false, "![diagram](https://files.example/a.png?sig=1)")]
    fn test_image_links_local_when_downloaded(#[case] downloaded: bool, #[case] expected: &str) {
        let url = "https://files.example/a.png?sig=1";
        let mut attachments = BTreeMap::new();
        if downloaded {
            attachments.insert(url.to_string(), "attachments/abc def.png".to_string());
        }
        let out = render(&[Block::new("1", BlockKind::Image, "diagram").with_url(url)], &attachments);
        assert!(out.contains(expected), "{out}");
    }

    #[test]
    fn test_file_label_defaults_to_name() {
        let block = Block::new("1", BlockKind::Pdf, "").with_url("https://files.example/dir/report.pdf?sig=2");
        let out = render(&[block], &BTreeMap::new());
        assert!(out.contains("[report.pdf](https://files.example/dir/report.pdf?sig=2)"));
    }

    #[test]
    fn test_deterministic() {
        let blocks = vec![Block::new("1", BlockKind::Quote, "a\nb"), Block::new("2", BlockKind::Divider, "")];
        assert_eq!(render(&blocks, &BTreeMap::new()), render(&blocks, &BTreeMap::new()));
    }

    #[test]
    fn test_unsupported_block() {
        let blocks = vec![Block::new("1", BlockKind::Toggle, "outer")
            .with_children(vec![Block::new("2", BlockKind::from_wire("synced_block"), "")])];
        assert!(render(&blocks, &BTreeMap::new()).contains("<!-- unsupported block: synced_block -->"));

        let resource = resource();
        let attachments = BTreeMap::new();
        let doc = Document {
            resource: &resource,
            blocks: &blocks,
            attachments: &attachments,
        };
        let err = MarkdownRenderer::new().strict(true).render(&doc).unwrap_err();
        assert_eq!(*err, ErrorKind::Unsupported("synced_block".to_string()));
    }
}
