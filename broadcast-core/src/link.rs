//! Link registry
//!
//! One entry per (site, item) recording an optional parent and the linked
//! children on other sites. Entries are persisted as opaque bincode blobs
//! through a [`LinkStore`] and decoded into [`LinkEntry`] at the boundary.
//!
//! Relationships are two-sided: when X lists Y as a child, Y lists X as its
//! parent. Every helper on [`LinkRegistry`] that changes a relationship
//! writes both entries before returning.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::error::{BroadcastError, Result};
use crate::types::{ItemId, ItemRef, SiteId};

/// Persistence for encoded registry entries
pub trait LinkStore {
    fn read(&self, item: ItemRef) -> Result<Option<Vec<u8>>>;

    fn write(&self, item: ItemRef, data: &[u8]) -> Result<()>;

    fn remove(&self, item: ItemRef) -> Result<()>;
}

/// On-disk shape of an entry
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoredLinks {
    parent: Option<ItemRef>,
    children: BTreeMap<SiteId, ItemId>,
}

/// Decoded registry entry for one item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEntry {
    owner: ItemRef,
    parent: Option<ItemRef>,
    children: BTreeMap<SiteId, ItemId>,
}

impl LinkEntry {
    /// Empty entry for `owner`
    pub fn new(owner: ItemRef) -> Self {
        Self {
            owner,
            parent: None,
            children: BTreeMap::new(),
        }
    }

    pub fn owner(&self) -> ItemRef {
        self.owner
    }

    pub fn parent(&self) -> Option<ItemRef> {
        self.parent
    }

    pub fn has_parent(&self) -> bool {
        self.parent.is_some()
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.parent.is_none() && self.children.is_empty()
    }

    /// Linked child on `site`, if any
    pub fn child_on(&self, site: SiteId) -> Option<ItemId> {
        self.children.get(&site).copied()
    }

    /// All children as item references
    pub fn children(&self) -> impl Iterator<Item = ItemRef> + '_ {
        self.children
            .iter()
            .map(|(&site, &item)| ItemRef::new(site, item))
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Record a child. Refused for the owner's own site and for entries
    /// that are themselves children.
    pub fn add_child(&mut self, child: ItemRef) -> bool {
        if child.site == self.owner.site || self.parent.is_some() {
            return false;
        }
        self.children.insert(child.site, child.item);
        true
    }

    pub fn remove_child(&mut self, site: SiteId) -> Option<ItemId> {
        self.children.remove(&site)
    }

    /// Record a parent. Refused for the owner's own site and for entries
    /// that already have children.
    pub fn set_parent(&mut self, parent: ItemRef) -> bool {
        if parent.site == self.owner.site || !self.children.is_empty() {
            return false;
        }
        self.parent = Some(parent);
        true
    }

    pub fn clear_parent(&mut self) -> Option<ItemRef> {
        self.parent.take()
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let stored = StoredLinks {
            parent: self.parent,
            children: self.children.clone(),
        };
        Ok(bincode::serialize(&stored)?)
    }

    fn decode(owner: ItemRef, data: &[u8]) -> Result<Self> {
        let stored: StoredLinks = bincode::deserialize(data)?;
        let mut entry = Self::new(owner);
        entry.parent = stored.parent.filter(|p| p.site != owner.site);
        entry.children = stored.children;
        entry.children.remove(&owner.site);
        Ok(entry)
    }
}

/// Typed access to registry entries
pub struct LinkRegistry<L> {
    store: L,
}

impl<L: LinkStore> LinkRegistry<L> {
    pub fn new(store: L) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &L {
        &self.store
    }

    /// Entry for `item`. Missing and undecodable blobs yield an empty entry.
    pub fn get(&self, item: ItemRef) -> Result<LinkEntry> {
        match self.store.read(item)? {
            None => Ok(LinkEntry::new(item)),
            Some(data) => match LinkEntry::decode(item, &data) {
                Ok(entry) => Ok(entry),
                Err(e) => {
                    tracing::warn!(%item, "discarding corrupt link entry: {}", e);
                    Ok(LinkEntry::new(item))
                }
            },
        }
    }

    /// Persist an entry; empty entries are removed instead
    pub fn put(&self, entry: &LinkEntry) -> Result<()> {
        if entry.is_empty() {
            self.store.remove(entry.owner)
        } else {
            self.store.write(entry.owner, &entry.encode()?)
        }
    }

    pub fn delete(&self, item: ItemRef) -> Result<()> {
        self.store.remove(item)
    }

    /// Link `child` under `parent` and persist both sides
    pub fn link(&self, parent: &mut LinkEntry, child: ItemRef) -> Result<()> {
        let mut child_entry = self.get(child)?;
        if let Some(old) = child_entry.parent() {
            if old != parent.owner() {
                tracing::warn!(%child, old_parent = %old, "relinking child to a new parent");
                self.detach_from(old, child)?;
                child_entry.clear_parent();
            }
        }
        if !child_entry.set_parent(parent.owner()) {
            return Err(BroadcastError::Store(format!(
                "{} cannot become a child of {}",
                child,
                parent.owner()
            )));
        }
        if !parent.add_child(child) {
            return Err(BroadcastError::Store(format!(
                "{} cannot take {} as a child",
                parent.owner(),
                child
            )));
        }
        self.put(&child_entry)?;
        self.put(parent)
    }

    /// Remove the relationship with the child on `site` from both sides.
    /// Content is left untouched. Returns the former child.
    pub fn unlink_child(&self, parent: &mut LinkEntry, site: SiteId) -> Result<Option<ItemRef>> {
        let Some(item) = parent.remove_child(site) else {
            return Ok(None);
        };
        let child = ItemRef::new(site, item);
        let mut child_entry = self.get(child)?;
        if child_entry.parent() == Some(parent.owner()) {
            child_entry.clear_parent();
            self.put(&child_entry)?;
        }
        self.put(parent)?;
        Ok(Some(child))
    }

    /// Whether the entry of `child` names `parent` back. A pointer the
    /// other side does not confirm is no relationship.
    pub fn links_back(&self, parent: ItemRef, child: ItemRef) -> Result<bool> {
        Ok(self.get(child)?.parent() == Some(parent))
    }

    /// Drop a one-sided pointer from `parent` to its child on `site`.
    /// The child's own entry is left alone. Returns the dropped child.
    pub fn drop_one_sided(&self, parent: &mut LinkEntry, site: SiteId) -> Result<Option<ItemRef>> {
        let Some(item) = parent.remove_child(site) else {
            return Ok(None);
        };
        let child = ItemRef::new(site, item);
        tracing::warn!(
            parent = %parent.owner(),
            %child,
            "child does not link back; dropping pointer"
        );
        self.put(parent)?;
        Ok(Some(child))
    }

    /// Cut `child` loose from its parent, updating both sides.
    /// Returns the former parent.
    pub fn remove_child(&self, child: ItemRef) -> Result<Option<ItemRef>> {
        let mut child_entry = self.get(child)?;
        let Some(parent) = child_entry.clear_parent() else {
            return Ok(None);
        };
        self.detach_from(parent, child)?;
        self.put(&child_entry)?;
        Ok(Some(parent))
    }

    fn detach_from(&self, parent: ItemRef, child: ItemRef) -> Result<()> {
        let mut parent_entry = self.get(parent)?;
        if parent_entry.child_on(child.site) == Some(child.item) {
            parent_entry.remove_child(child.site);
            self.put(&parent_entry)?;
        }
        Ok(())
    }
}

/// In-memory link store
#[derive(Default)]
pub struct MemoryLinkStore {
    entries: Mutex<HashMap<ItemRef, Vec<u8>>>,
}

impl MemoryLinkStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted entries
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ItemRef, Vec<u8>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl LinkStore for MemoryLinkStore {
    fn read(&self, item: ItemRef) -> Result<Option<Vec<u8>>> {
        Ok(self.lock().get(&item).cloned())
    }

    fn write(&self, item: ItemRef, data: &[u8]) -> Result<()> {
        self.lock().insert(item, data.to_vec());
        Ok(())
    }

    fn remove(&self, item: ItemRef) -> Result<()> {
        self.lock().remove(&item);
        Ok(())
    }
}

impl<T: LinkStore + ?Sized> LinkStore for &T {
    fn read(&self, item: ItemRef) -> Result<Option<Vec<u8>>> {
        (**self).read(item)
    }

    fn write(&self, item: ItemRef, data: &[u8]) -> Result<()> {
        (**self).write(item, data)
    }

    fn remove(&self, item: ItemRef) -> Result<()> {
        (**self).remove(item)
    }
}

impl<T: LinkStore + ?Sized> LinkStore for std::sync::Arc<T> {
    fn read(&self, item: ItemRef) -> Result<Option<Vec<u8>>> {
        (**self).read(item)
    }

    fn write(&self, item: ItemRef, data: &[u8]) -> Result<()> {
        (**self).write(item, data)
    }

    fn remove(&self, item: ItemRef) -> Result<()> {
        (**self).remove(item)
    }
}
