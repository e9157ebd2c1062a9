//! Content model shared by every component
//!
//! Sites, content items, classification terms and attachments as the
//! engine sees them. The host platform owns the storage; these are the
//! snapshots it hands over and accepts back.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Tenant identifier
pub type SiteId = u64;

/// Content item identifier, local to one site
pub type ItemId = u64;

/// Classification term identifier, local to one site
pub type TermId = u64;

/// Metadata values keyed by metadata key. A key may hold several values.
pub type MetaMap = BTreeMap<String, Vec<String>>;

/// Well-known metadata keys
pub mod meta_keys {
    /// Representative image of an item (structural binding field)
    pub const THUMBNAIL_ID: &str = "_thumbnail_id";

    /// Relative path of an attachment's binary file
    pub const ATTACHED_FILE: &str = "_attached_file";

    /// Serialized attachment metadata (dimensions, variants)
    pub const ATTACHMENT_METADATA: &str = "_attachment_metadata";

    /// Check if a key points into the uploads directory and must be
    /// rewritten when an attachment moves to another site
    pub fn is_path_dependent(key: &str) -> bool {
        key == ATTACHED_FILE || key == ATTACHMENT_METADATA
    }
}

/// A (site, item) pair; the identity of an item across the network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemRef {
    pub site: SiteId,
    pub item: ItemId,
}

impl ItemRef {
    pub fn new(site: SiteId, item: ItemId) -> Self {
        Self { site, item }
    }
}

impl fmt::Display for ItemRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.site, self.item)
    }
}

/// Publication status of a content item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    #[default]
    Publish,
    Draft,
    Pending,
    Future,
    Private,
    Trash,
}

impl ItemStatus {
    /// Draft-like statuses are gated behind `allow_draft`
    pub fn is_draft(self) -> bool {
        matches!(self, ItemStatus::Draft | ItemStatus::Pending)
    }

    /// Scheduled items are gated behind `allow_scheduled`
    pub fn is_scheduled(self) -> bool {
        self == ItemStatus::Future
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ItemStatus::Publish => "publish",
            ItemStatus::Draft => "draft",
            ItemStatus::Pending => "pending",
            ItemStatus::Future => "future",
            ItemStatus::Private => "private",
            ItemStatus::Trash => "trash",
        };
        f.write_str(s)
    }
}

/// A tenant-scoped document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    /// Item ID (0 for an item not yet inserted)
    pub id: ItemId,
    /// Owning site
    pub site: SiteId,
    /// Item type, e.g. `post` or `page`
    pub item_type: String,
    pub status: ItemStatus,
    pub title: String,
    /// URL-safe name, used with `item_type` to find unlinked siblings
    pub name: String,
    pub body: String,
    /// Hierarchy parent on the same site
    #[serde(default)]
    pub parent: Option<ItemId>,
    /// Globally-unique identifier; never copied to another site
    #[serde(default)]
    pub guid: Option<String>,
    /// Pinned to the front of listings
    #[serde(default)]
    pub sticky: bool,
    /// Assigned term IDs by taxonomy
    #[serde(default)]
    pub terms: BTreeMap<String, Vec<TermId>>,
}

impl ContentItem {
    /// Create a new, not yet inserted item
    pub fn new(site: SiteId, item_type: impl Into<String>, title: impl Into<String>) -> Self {
        let title = title.into();
        Self {
            id: 0,
            site,
            item_type: item_type.into(),
            status: ItemStatus::Publish,
            name: slugify(&title),
            title,
            body: String::new(),
            parent: None,
            guid: None,
            sticky: false,
            terms: BTreeMap::new(),
        }
    }

    pub fn item_ref(&self) -> ItemRef {
        ItemRef::new(self.site, self.id)
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_status(mut self, status: ItemStatus) -> Self {
        self.status = status;
        self
    }
}

/// A classification term. Matched across sites by `slug`, never by `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Term {
    pub id: TermId,
    pub slug: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parent: Option<TermId>,
}

impl Term {
    pub fn new(id: TermId, slug: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id,
            slug: slug.into(),
            name: name.into(),
            description: String::new(),
            parent: None,
        }
    }

    pub fn with_parent(mut self, parent: TermId) -> Self {
        self.parent = Some(parent);
        self
    }
}

/// Fields of a term that may be rewritten on an existing target term
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermUpdate {
    pub name: String,
    pub description: String,
    pub parent: Option<TermId>,
}

/// Metadata regenerated from an attachment's binary file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentMetadata {
    /// File path relative to the site's uploads directory
    pub file: String,
    pub size: u64,
    /// Hex-encoded SHA-256 of the file contents
    pub sha256: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    /// Generated variants: size name -> file name
    #[serde(default)]
    pub variants: BTreeMap<String, String>,
}

/// A binary resource belonging to a site
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentDescriptor {
    pub id: ItemId,
    pub site: SiteId,
    /// Item the attachment is structurally attached to
    #[serde(default)]
    pub parent: Option<ItemId>,
    pub title: String,
    /// Derived base filename; the deduplication key across sites
    pub slug: String,
    /// File path relative to the site's uploads directory
    pub file: PathBuf,
    /// Public reference token embedded in item bodies
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub metadata: AttachmentMetadata,
    /// Custom fields of the attachment
    #[serde(default)]
    pub meta: MetaMap,
    /// Structurally attached to the broadcast item, as opposed to
    /// referenced from its body or thumbnail
    #[serde(default)]
    pub attached: bool,
}

impl AttachmentDescriptor {
    /// File name component of `file`
    pub fn file_name(&self) -> String {
        self.file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Turn a title or file stem into a lowercase, dash-separated slug
pub fn slugify(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut dash = false;
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
            dash = false;
        } else if !dash && !slug.is_empty() {
            slug.push('-');
            dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}
