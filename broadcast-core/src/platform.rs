//! Host platform interfaces
//!
//! The engine never owns content. It reads and writes through these
//! traits, which a host implements over its own storage. All site-scoped
//! calls take the site explicitly; [`SiteSwitcher`] exists for hosts whose
//! side effects (caches, hooks) depend on the active site.

use std::path::{Path, PathBuf};

use crate::context::SiteSwitcher;
use crate::error::Result;
use crate::types::{
    AttachmentDescriptor, AttachmentMetadata, ContentItem, ItemId, MetaMap, SiteId, Term, TermId,
    TermUpdate,
};

/// Content item storage
pub trait ContentStore {
    /// Get an item, `None` if it does not exist
    fn get_item(&self, site: SiteId, id: ItemId) -> Result<Option<ContentItem>>;

    /// Insert a new item (its `id` is ignored) and return the assigned ID
    fn insert_item(&self, site: SiteId, item: &ContentItem) -> Result<ItemId>;

    /// Overwrite an existing item
    fn update_item(&self, site: SiteId, item: &ContentItem) -> Result<()>;

    /// Permanently delete an item and its metadata
    fn delete_item(&self, site: SiteId, id: ItemId) -> Result<()>;

    /// Move an item to the trash, remembering its status
    fn trash_item(&self, site: SiteId, id: ItemId) -> Result<()>;

    /// Bring an item back from the trash
    fn restore_item(&self, site: SiteId, id: ItemId) -> Result<()>;

    /// Items with the given name and type
    fn list_by_name_and_type(&self, site: SiteId, name: &str, item_type: &str)
    -> Result<Vec<ContentItem>>;
}

/// Attachment storage and binary file handling
pub trait AttachmentStore {
    fn get_attachment(&self, site: SiteId, id: ItemId) -> Result<Option<AttachmentDescriptor>>;

    /// Attachments structurally attached to `item`
    fn list_attached(&self, site: SiteId, item: ItemId) -> Result<Vec<AttachmentDescriptor>>;

    /// Attachment with the given derived slug, if any
    fn find_by_slug(&self, site: SiteId, slug: &str) -> Result<Option<AttachmentDescriptor>>;

    /// Absolute path of an attachment's binary file
    fn source_path(&self, attachment: &AttachmentDescriptor) -> PathBuf;

    /// Absolute path a new file named `file_name` would get on `site`
    fn upload_path(&self, site: SiteId, file_name: &str) -> PathBuf;

    fn copy_binary(&self, source: &Path, target: &Path) -> Result<()>;

    /// Regenerate dimensions and variants from a file on `site`
    fn generate_metadata(&self, site: SiteId, path: &Path) -> Result<AttachmentMetadata>;

    /// Insert a new attachment (its `id` and `url` are assigned) and return its ID
    fn insert_attachment(&self, site: SiteId, attachment: &AttachmentDescriptor) -> Result<ItemId>;

    /// Delete an attachment and its binary file
    fn delete_attachment(&self, site: SiteId, id: ItemId) -> Result<()>;
}

/// Classification term storage
pub trait TermStore {
    /// Taxonomies that apply to an item type
    fn taxonomies_for(&self, site: SiteId, item_type: &str) -> Result<Vec<String>>;

    fn list_terms(&self, site: SiteId, taxonomy: &str) -> Result<Vec<Term>>;

    /// Create a term (its `id` is ignored) and return the assigned ID
    fn create_term(&self, site: SiteId, taxonomy: &str, term: &Term) -> Result<TermId>;

    fn update_term(&self, site: SiteId, taxonomy: &str, id: TermId, fields: &TermUpdate)
    -> Result<()>;

    /// Replace the terms of `taxonomy` assigned to an item
    fn assign_terms(&self, site: SiteId, item: ItemId, taxonomy: &str, ids: &[TermId])
    -> Result<()>;

    /// Drop any cached hierarchy for a taxonomy after its tree changed
    fn invalidate_term_cache(&self, _site: SiteId, _taxonomy: &str) {}
}

/// Key-value metadata storage
pub trait MetaStore {
    fn get_all_meta(&self, site: SiteId, item: ItemId) -> Result<MetaMap>;

    fn set_meta(&self, site: SiteId, item: ItemId, key: &str, values: &[String]) -> Result<()>;

    fn delete_meta(&self, site: SiteId, item: ItemId, key: &str) -> Result<()>;
}

/// Everything the engine needs from a host
pub trait Platform: SiteSwitcher + ContentStore + AttachmentStore + TermStore + MetaStore {}

impl<T> Platform for T where
    T: SiteSwitcher + ContentStore + AttachmentStore + TermStore + MetaStore
{
}
