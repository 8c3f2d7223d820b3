use crate::id::ResourceId;
use std::collections::BTreeMap;
use time::OffsetDateTime;

/// Whether a resource is a single page or a collection of entry pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Page,
    Collection,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Page => "page",
            Self::Collection => "collection",
        }
    }
}

/// Metadata for a page, a collection, or an entry inside a collection.
///
/// Collection entries are pages too; they come back from
/// [`RemoteSource::query_collection`](crate::RemoteSource::query_collection)
/// with `parent` set to the collection they belong to.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    pub id: ResourceId,
    pub kind: ResourceKind,
    pub title: String,
    pub last_modified: OffsetDateTime,
    pub parent: Option<ResourceId>,
    /// Flattened property values, already rendered to plain text.
    pub properties: BTreeMap<String, String>,
}

impl Resource {
    pub fn page(id: ResourceId, title: impl Into<String>, last_modified: OffsetDateTime) -> Self {
        Self {
            id,
            kind: ResourceKind::Page,
            title: title.into(),
            last_modified,
            parent: None,
            properties: BTreeMap::new(),
        }
    }

    pub fn collection(id: ResourceId, title: impl Into<String>, last_modified: OffsetDateTime) -> Self {
        Self {
            kind: ResourceKind::Collection,
            ..Self::page(id, title, last_modified)
        }
    }

    pub fn with_parent(mut self, parent: ResourceId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockKind {
    Paragraph,
    Heading1,
    Heading2,
    Heading3,
    BulletedListItem,
    NumberedListItem,
    ToDo,
    Toggle,
    Quote,
    Callout,
    Code,
    Divider,
    Bookmark,
    ChildPage,
    ChildCollection,
    Image,
    File,
    Pdf,
    Audio,
    Video,
    /// Anything else; the wire name is kept for diagnostics.
    Unsupported(String),
}

impl BlockKind {
    /// Map a wire type name onto a block kind.
    pub fn from_wire(name: &str) -> Self {
        match name {
            "paragraph" => Self::Paragraph,
            "heading_1" => Self::Heading1,
            "heading_2" => Self::Heading2,
            "heading_3" => Self::Heading3,
            "bulleted_list_item" => Self::BulletedListItem,
            "numbered_list_item" => Self::NumberedListItem,
            "to_do" => Self::ToDo,
            "toggle" => Self::Toggle,
            "quote" => Self::Quote,
            "callout" => Self::Callout,
            "code" => Self::Code,
            "divider" => Self::Divider,
            "bookmark" | "link_preview" | "embed" => Self::Bookmark,
            "child_page" => Self::ChildPage,
            "child_database" => Self::ChildCollection,
            "image" => Self::Image,
            "file" => Self::File,
            "pdf" => Self::Pdf,
            "audio" => Self::Audio,
            "video" => Self::Video,
            other => Self::Unsupported(other.to_string()),
        }
    }

    /// Blocks whose payload is a downloadable file.
    pub fn is_attachment(&self) -> bool {
        matches!(self, Self::Image | Self::File | Self::Pdf | Self::Audio | Self::Video)
    }
}

/// One content block of a page, with its nested children already fetched.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub id: String,
    pub kind: BlockKind,
    /// Plain text content (rich text flattened).
    pub text: String,
    /// Link target for bookmarks, or file location for attachments.
    pub url: Option<String>,
    pub checked: Option<bool>,
    pub language: Option<String>,
    pub children: Vec<Block>,
}

impl Block {
    pub fn new(id: impl Into<String>, kind: BlockKind, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            text: text.into(),
            url: None,
            checked: None,
            language: None,
            children: Vec::new(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_children(mut self, children: Vec<Block>) -> Self {
        self.children = children;
        self
    }

    /// The remote location of this block's file, if it carries one.
    pub fn attachment_url(&self) -> Option<&str> {
        if self.kind.is_attachment() { self.url.as_deref() } else { None }
    }

    /// Depth-first walk over this block and every nested child.
    pub fn walk(&self) -> Vec<&Block> {
        let mut out = vec![self];
        for child in &self.children {
            out.extend(child.walk());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("image", true)]
    #[case("file", true)]
    #[case("pdf", true)]
    #[case("video", true)]
    #[case("audio", true)]
    #[case("paragraph", false)]
    #[case("bookmark", false)]
    fn test_attachment_kinds(#[case] wire: &str, #[case] attachment: bool) {
        let block = Block::new("b", BlockKind::from_wire(wire), "").with_url("https://files.example/a.png");
        assert_eq!(block.attachment_url().is_some(), attachment);
    }

    #[test]
    fn test_unsupported_kind_keeps_name() {
        assert_eq!(BlockKind::from_wire("synced_block"), BlockKind::Unsupported("synced_block".to_string()));
    }

    #[test]
    fn test_walk_visits_nested_children() {
        let tree = Block::new("a", BlockKind::Toggle, "outer").with_children(vec![
            Block::new("b", BlockKind::Paragraph, "inner")
                .with_children(vec![Block::new("c", BlockKind::Image, "").with_url("https://x/y.png")]),
        ]);
        let ids: Vec<_> = tree.walk().iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
