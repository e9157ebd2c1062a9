//! In-process host platform
//!
//! Implements every host interface over an in-memory model of the network
//! (sites, items, metadata, terms, attachments) that can be loaded from and
//! saved to a JSON snapshot. Attachment binaries live on disk under
//! `<uploads_root>/<site>/`.
//!
//! Two hooks model host behaviour the engine has to cope with: an insert
//! hook fired after every item insert (the host's save event), and per-site
//! insert rejection (the host's validation).

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::context::SiteSwitcher;
use crate::error::{BroadcastError, Result};
use crate::platform::{AttachmentStore, ContentStore, MetaStore, TermStore};
use crate::types::{
    AttachmentDescriptor, AttachmentMetadata, ContentItem, ItemId, ItemRef, ItemStatus, MetaMap,
    SiteId, Term, TermId, TermUpdate,
};

const PNG_SIGNATURE: &[u8] = b"\x89PNG\r\n\x1a\n";

/// Called with every newly inserted item
pub type InsertHook = Arc<dyn Fn(&ContentItem) + Send + Sync>;

/// Everything stored for one site
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SiteData {
    #[serde(default)]
    pub items: BTreeMap<ItemId, ContentItem>,
    #[serde(default)]
    pub meta: BTreeMap<ItemId, MetaMap>,
    /// Item type -> taxonomies that apply to it
    #[serde(default)]
    pub taxonomies: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub terms: BTreeMap<String, BTreeMap<TermId, Term>>,
    #[serde(default)]
    pub attachments: BTreeMap<ItemId, AttachmentDescriptor>,
    /// Status an item had before it was trashed
    #[serde(default)]
    pub trashed: BTreeMap<ItemId, ItemStatus>,
    #[serde(default = "first_id")]
    pub next_id: u64,
}

fn first_id() -> u64 {
    1
}

impl SiteData {
    fn allocate_id(&mut self) -> u64 {
        if self.next_id == 0 {
            self.next_id = 1;
        }
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

/// Serializable state of a whole network
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlatformSnapshot {
    #[serde(default)]
    pub sites: BTreeMap<SiteId, SiteData>,
}

impl PlatformSnapshot {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Save as JSON (write to a temp file, then rename)
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, serde_json::to_string_pretty(self)?)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }
}

/// In-process implementation of the host platform
pub struct LocalPlatform {
    uploads_root: PathBuf,
    state: Mutex<PlatformSnapshot>,
    context: Mutex<Vec<SiteId>>,
    insert_hook: Mutex<Option<InsertHook>>,
    rejected_sites: Mutex<HashSet<SiteId>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl LocalPlatform {
    /// Empty network; the home site is 1
    pub fn new(uploads_root: impl Into<PathBuf>) -> Self {
        Self::from_snapshot(PlatformSnapshot::default(), uploads_root)
    }

    pub fn from_snapshot(snapshot: PlatformSnapshot, uploads_root: impl Into<PathBuf>) -> Self {
        Self {
            uploads_root: uploads_root.into(),
            state: Mutex::new(snapshot),
            context: Mutex::new(vec![1]),
            insert_hook: Mutex::new(None),
            rejected_sites: Mutex::new(HashSet::new()),
        }
    }

    /// Load a snapshot file
    pub fn load(snapshot: &Path, uploads_root: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self::from_snapshot(PlatformSnapshot::load(snapshot)?, uploads_root))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.snapshot().save(path)
    }

    pub fn snapshot(&self) -> PlatformSnapshot {
        lock(&self.state).clone()
    }

    pub fn uploads_root(&self) -> &Path {
        &self.uploads_root
    }

    fn site_dir(&self, site: SiteId) -> PathBuf {
        self.uploads_root.join(site.to_string())
    }

    // Fixtures and inspection

    pub fn add_site(&self, site: SiteId) {
        lock(&self.state).sites.entry(site).or_default();
    }

    /// Declare the taxonomies that apply to `item_type` on `site`
    pub fn set_taxonomies(&self, site: SiteId, item_type: &str, taxonomies: &[&str]) {
        lock(&self.state)
            .sites
            .entry(site)
            .or_default()
            .taxonomies
            .insert(
                item_type.to_string(),
                taxonomies.iter().map(|t| t.to_string()).collect(),
            );
    }

    /// Install the hook fired after each item insert
    pub fn set_insert_hook(&self, hook: InsertHook) {
        *lock(&self.insert_hook) = Some(hook);
    }

    /// Make every item insert on `site` fail
    pub fn reject_inserts_on(&self, site: SiteId) {
        lock(&self.rejected_sites).insert(site);
    }

    /// Write a file into the uploads directory and register it as an attachment
    pub fn add_attachment_file(
        &self,
        site: SiteId,
        parent: Option<ItemId>,
        file_name: &str,
        contents: &[u8],
        meta: MetaMap,
    ) -> Result<ItemId> {
        let path = self.upload_path(site, file_name);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(&path, contents)?;
        let metadata = self.generate_metadata(site, &path)?;
        let attachment = AttachmentDescriptor {
            id: 0,
            site,
            parent,
            title: file_name.to_string(),
            slug: crate::attachments::derive_slug(file_name),
            file: PathBuf::from(file_name),
            url: String::new(),
            mime_type: mime_for(file_name).to_string(),
            metadata,
            meta,
            attached: parent.is_some(),
        };
        self.insert_attachment(site, &attachment)
    }

    pub fn items_on(&self, site: SiteId) -> Vec<ContentItem> {
        lock(&self.state)
            .sites
            .get(&site)
            .map(|s| s.items.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn attachments_on(&self, site: SiteId) -> Vec<AttachmentDescriptor> {
        lock(&self.state)
            .sites
            .get(&site)
            .map(|s| s.attachments.values().cloned().collect())
            .unwrap_or_default()
    }

    fn with_site<T>(&self, site: SiteId, f: impl FnOnce(&SiteData) -> Result<T>) -> Result<T> {
        let state = lock(&self.state);
        let data = state.sites.get(&site).ok_or(BroadcastError::SiteNotFound(site))?;
        f(data)
    }

    fn with_site_mut<T>(
        &self,
        site: SiteId,
        f: impl FnOnce(&mut SiteData) -> Result<T>,
    ) -> Result<T> {
        let mut state = lock(&self.state);
        let data = state
            .sites
            .get_mut(&site)
            .ok_or(BroadcastError::SiteNotFound(site))?;
        f(data)
    }
}

fn mime_for(file_name: &str) -> &'static str {
    let ext = Path::new(file_name)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

fn png_dimensions(bytes: &[u8]) -> Option<(u32, u32)> {
    if bytes.len() < 24 || !bytes.starts_with(PNG_SIGNATURE) || &bytes[12..16] != b"IHDR" {
        return None;
    }
    let width = u32::from_be_bytes(bytes[16..20].try_into().ok()?);
    let height = u32::from_be_bytes(bytes[20..24].try_into().ok()?);
    Some((width, height))
}

impl SiteSwitcher for LocalPlatform {
    fn current_site(&self) -> SiteId {
        lock(&self.context).last().copied().unwrap_or(1)
    }

    fn switch_to(&self, site: SiteId) -> Result<()> {
        if !lock(&self.state).sites.contains_key(&site) {
            return Err(BroadcastError::SiteNotFound(site));
        }
        lock(&self.context).push(site);
        Ok(())
    }

    fn restore(&self) -> Result<()> {
        let mut context = lock(&self.context);
        if context.len() > 1 {
            context.pop();
        }
        Ok(())
    }
}

impl ContentStore for LocalPlatform {
    fn get_item(&self, site: SiteId, id: ItemId) -> Result<Option<ContentItem>> {
        self.with_site(site, |data| Ok(data.items.get(&id).cloned()))
    }

    fn insert_item(&self, site: SiteId, item: &ContentItem) -> Result<ItemId> {
        if lock(&self.rejected_sites).contains(&site) {
            return Err(BroadcastError::ItemCreation {
                site,
                reason: "rejected by host validation".into(),
            });
        }
        let stored = self.with_site_mut(site, |data| {
            let id = data.allocate_id();
            let mut stored = item.clone();
            stored.id = id;
            stored.site = site;
            if stored.guid.is_none() {
                stored.guid = Some(format!("/sites/{}/?p={}", site, id));
            }
            data.items.insert(id, stored.clone());
            Ok(stored)
        })?;

        let hook = lock(&self.insert_hook).clone();
        if let Some(hook) = hook {
            hook(&stored);
        }
        Ok(stored.id)
    }

    fn update_item(&self, site: SiteId, item: &ContentItem) -> Result<()> {
        self.with_site_mut(site, |data| {
            let slot = data
                .items
                .get_mut(&item.id)
                .ok_or(BroadcastError::NotFound(ItemRef::new(site, item.id)))?;
            let guid = slot.guid.clone();
            *slot = item.clone();
            slot.site = site;
            if slot.guid.is_none() {
                slot.guid = guid;
            }
            Ok(())
        })
    }

    fn delete_item(&self, site: SiteId, id: ItemId) -> Result<()> {
        self.with_site_mut(site, |data| {
            data.items
                .remove(&id)
                .ok_or(BroadcastError::NotFound(ItemRef::new(site, id)))?;
            data.meta.remove(&id);
            data.trashed.remove(&id);
            for attachment in data.attachments.values_mut() {
                if attachment.parent == Some(id) {
                    attachment.parent = None;
                    attachment.attached = false;
                }
            }
            Ok(())
        })
    }

    fn trash_item(&self, site: SiteId, id: ItemId) -> Result<()> {
        self.with_site_mut(site, |data| {
            let item = data
                .items
                .get_mut(&id)
                .ok_or(BroadcastError::NotFound(ItemRef::new(site, id)))?;
            if item.status != ItemStatus::Trash {
                data.trashed.insert(id, item.status);
                item.status = ItemStatus::Trash;
            }
            Ok(())
        })
    }

    fn restore_item(&self, site: SiteId, id: ItemId) -> Result<()> {
        self.with_site_mut(site, |data| {
            let previous = data.trashed.remove(&id);
            let item = data
                .items
                .get_mut(&id)
                .ok_or(BroadcastError::NotFound(ItemRef::new(site, id)))?;
            if item.status == ItemStatus::Trash {
                item.status = previous.unwrap_or(ItemStatus::Draft);
            }
            Ok(())
        })
    }

    fn list_by_name_and_type(
        &self,
        site: SiteId,
        name: &str,
        item_type: &str,
    ) -> Result<Vec<ContentItem>> {
        self.with_site(site, |data| {
            Ok(data
                .items
                .values()
                .filter(|i| i.name == name && i.item_type == item_type)
                .cloned()
                .collect())
        })
    }
}

impl AttachmentStore for LocalPlatform {
    fn get_attachment(&self, site: SiteId, id: ItemId) -> Result<Option<AttachmentDescriptor>> {
        self.with_site(site, |data| Ok(data.attachments.get(&id).cloned()))
    }

    fn list_attached(&self, site: SiteId, item: ItemId) -> Result<Vec<AttachmentDescriptor>> {
        self.with_site(site, |data| {
            Ok(data
                .attachments
                .values()
                .filter(|a| a.parent == Some(item))
                .cloned()
                .collect())
        })
    }

    fn find_by_slug(&self, site: SiteId, slug: &str) -> Result<Option<AttachmentDescriptor>> {
        self.with_site(site, |data| {
            Ok(data.attachments.values().find(|a| a.slug == slug).cloned())
        })
    }

    fn source_path(&self, attachment: &AttachmentDescriptor) -> PathBuf {
        self.site_dir(attachment.site).join(&attachment.file)
    }

    fn upload_path(&self, site: SiteId, file_name: &str) -> PathBuf {
        self.site_dir(site).join(file_name)
    }

    fn copy_binary(&self, source: &Path, target: &Path) -> Result<()> {
        if let Some(dir) = target.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::copy(source, target)?;
        Ok(())
    }

    fn generate_metadata(&self, site: SiteId, path: &Path) -> Result<AttachmentMetadata> {
        let bytes = fs::read(path).map_err(|e| BroadcastError::AttachmentSource {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let file = path
            .strip_prefix(self.site_dir(site))
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned();
        let (width, height) = match png_dimensions(&bytes) {
            Some((w, h)) => (Some(w), Some(h)),
            None => (None, None),
        };
        Ok(AttachmentMetadata {
            file,
            size: bytes.len() as u64,
            sha256: hex::encode(Sha256::digest(&bytes)),
            width,
            height,
            variants: BTreeMap::new(),
        })
    }

    fn insert_attachment(&self, site: SiteId, attachment: &AttachmentDescriptor) -> Result<ItemId> {
        self.with_site_mut(site, |data| {
            let id = data.allocate_id();
            let mut stored = attachment.clone();
            stored.id = id;
            stored.site = site;
            stored.url = format!("/sites/{}/uploads/{}", site, stored.file.display());
            data.attachments.insert(id, stored);
            Ok(id)
        })
    }

    fn delete_attachment(&self, site: SiteId, id: ItemId) -> Result<()> {
        let removed = self.with_site_mut(site, |data| {
            data.meta.remove(&id);
            Ok(data.attachments.remove(&id))
        })?;
        if let Some(attachment) = removed {
            let path = self.source_path(&attachment);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

impl TermStore for LocalPlatform {
    fn taxonomies_for(&self, site: SiteId, item_type: &str) -> Result<Vec<String>> {
        self.with_site(site, |data| {
            Ok(data.taxonomies.get(item_type).cloned().unwrap_or_default())
        })
    }

    fn list_terms(&self, site: SiteId, taxonomy: &str) -> Result<Vec<Term>> {
        self.with_site(site, |data| {
            Ok(data
                .terms
                .get(taxonomy)
                .map(|t| t.values().cloned().collect())
                .unwrap_or_default())
        })
    }

    fn create_term(&self, site: SiteId, taxonomy: &str, term: &Term) -> Result<TermId> {
        self.with_site_mut(site, |data| {
            let id = data.allocate_id();
            let mut stored = term.clone();
            stored.id = id;
            data.terms
                .entry(taxonomy.to_string())
                .or_default()
                .insert(id, stored);
            Ok(id)
        })
    }

    fn update_term(
        &self,
        site: SiteId,
        taxonomy: &str,
        id: TermId,
        fields: &TermUpdate,
    ) -> Result<()> {
        self.with_site_mut(site, |data| {
            let term = data
                .terms
                .get_mut(taxonomy)
                .and_then(|t| t.get_mut(&id))
                .ok_or_else(|| {
                    BroadcastError::Store(format!("term {} not found in {}", id, taxonomy))
                })?;
            term.name = fields.name.clone();
            term.description = fields.description.clone();
            term.parent = fields.parent;
            Ok(())
        })
    }

    fn assign_terms(
        &self,
        site: SiteId,
        item: ItemId,
        taxonomy: &str,
        ids: &[TermId],
    ) -> Result<()> {
        self.with_site_mut(site, |data| {
            let stored = data
                .items
                .get_mut(&item)
                .ok_or(BroadcastError::NotFound(ItemRef::new(site, item)))?;
            if ids.is_empty() {
                stored.terms.remove(taxonomy);
            } else {
                stored.terms.insert(taxonomy.to_string(), ids.to_vec());
            }
            Ok(())
        })
    }
}

impl MetaStore for LocalPlatform {
    fn get_all_meta(&self, site: SiteId, item: ItemId) -> Result<MetaMap> {
        self.with_site(site, |data| Ok(data.meta.get(&item).cloned().unwrap_or_default()))
    }

    fn set_meta(&self, site: SiteId, item: ItemId, key: &str, values: &[String]) -> Result<()> {
        self.with_site_mut(site, |data| {
            data.meta
                .entry(item)
                .or_default()
                .insert(key.to_string(), values.to_vec());
            Ok(())
        })
    }

    fn delete_meta(&self, site: SiteId, item: ItemId, key: &str) -> Result<()> {
        self.with_site_mut(site, |data| {
            if let Some(meta) = data.meta.get_mut(&item) {
                meta.remove(key);
                if meta.is_empty() {
                    data.meta.remove(&item);
                }
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn platform(tmp: &TempDir) -> LocalPlatform {
        let p = LocalPlatform::new(tmp.path().join("uploads"));
        p.add_site(1);
        p.add_site(2);
        p
    }

    #[test]
    fn test_insert_assigns_id_and_guid() {
        let tmp = TempDir::new().unwrap();
        let p = platform(&tmp);
        let id = p.insert_item(1, &ContentItem::new(1, "post", "Hello")).unwrap();
        let item = p.get_item(1, id).unwrap().unwrap();
        assert_eq!(item.id, id);
        assert_eq!(item.guid.as_deref(), Some(format!("/sites/1/?p={}", id).as_str()));
        assert!(p.get_item(1, id + 100).unwrap().is_none());
        assert!(matches!(p.get_item(9, id), Err(BroadcastError::SiteNotFound(9))));
    }

    #[test]
    fn test_trash_and_restore_remember_status() {
        let tmp = TempDir::new().unwrap();
        let p = platform(&tmp);
        let item = ContentItem::new(1, "post", "Private").with_status(ItemStatus::Private);
        let id = p.insert_item(1, &item).unwrap();
        p.trash_item(1, id).unwrap();
        p.trash_item(1, id).unwrap();
        assert_eq!(p.get_item(1, id).unwrap().unwrap().status, ItemStatus::Trash);
        p.restore_item(1, id).unwrap();
        assert_eq!(p.get_item(1, id).unwrap().unwrap().status, ItemStatus::Private);
    }

    #[test]
    fn test_insert_hook_and_rejection() {
        let tmp = TempDir::new().unwrap();
        let p = platform(&tmp);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        p.set_insert_hook(Arc::new(move |item: &ContentItem| {
            sink.lock().unwrap().push(item.item_ref());
        }));
        let id = p.insert_item(1, &ContentItem::new(1, "post", "A")).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![ItemRef::new(1, id)]);

        p.reject_inserts_on(2);
        let err = p.insert_item(2, &ContentItem::new(2, "post", "B")).unwrap_err();
        assert!(matches!(err, BroadcastError::ItemCreation { site: 2, .. }));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_png_metadata() {
        let tmp = TempDir::new().unwrap();
        let p = platform(&tmp);
        let mut png = PNG_SIGNATURE.to_vec();
        png.extend_from_slice(&[0, 0, 0, 13]);
        png.extend_from_slice(b"IHDR");
        png.extend_from_slice(&640u32.to_be_bytes());
        png.extend_from_slice(&480u32.to_be_bytes());
        let id = p
            .add_attachment_file(1, None, "pic.png", &png, MetaMap::new())
            .unwrap();
        let attachment = p.get_attachment(1, id).unwrap().unwrap();
        assert_eq!(attachment.metadata.width, Some(640));
        assert_eq!(attachment.metadata.height, Some(480));
        assert_eq!(attachment.metadata.file, "pic.png");
        assert_eq!(attachment.mime_type, "image/png");
        assert_eq!(attachment.url, "/sites/1/uploads/pic.png");
        assert_eq!(attachment.slug, "pic");
    }

    #[test]
    fn test_delete_attachment_removes_file() {
        let tmp = TempDir::new().unwrap();
        let p = platform(&tmp);
        let id = p
            .add_attachment_file(1, Some(5), "doc.pdf", b"%PDF", MetaMap::new())
            .unwrap();
        let attachment = p.get_attachment(1, id).unwrap().unwrap();
        let path = p.source_path(&attachment);
        assert!(path.exists());
        assert_eq!(p.list_attached(1, 5).unwrap().len(), 1);
        p.delete_attachment(1, id).unwrap();
        assert!(!path.exists());
        assert!(p.list_attached(1, 5).unwrap().is_empty());
    }

    #[test]
    fn test_switch_to_unknown_site_fails() {
        let tmp = TempDir::new().unwrap();
        let p = platform(&tmp);
        assert!(p.switch_to(42).is_err());
        assert_eq!(p.current_site(), 1);
        p.switch_to(2).unwrap();
        assert_eq!(p.current_site(), 2);
        p.restore().unwrap();
        p.restore().unwrap();
        assert_eq!(p.current_site(), 1);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let p = platform(&tmp);
        let id = p.insert_item(2, &ContentItem::new(2, "page", "About")).unwrap();
        p.set_meta(2, id, "color", &["red".to_string()]).unwrap();
        let path = tmp.path().join("state").join("network.json");
        p.save(&path).unwrap();

        let loaded = LocalPlatform::load(&path, tmp.path().join("uploads")).unwrap();
        assert_eq!(loaded.get_item(2, id).unwrap().unwrap().title, "About");
        assert_eq!(loaded.get_all_meta(2, id).unwrap()["color"], vec!["red"]);
        let next = loaded.insert_item(2, &ContentItem::new(2, "page", "Next")).unwrap();
        assert!(next > id);
    }
}
