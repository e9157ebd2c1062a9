//! Cascading action executor
//!
//! Applies a lifecycle action taken on a linked item to the rest of its
//! link group. On a parent the action walks every child (or the one child
//! on `only_site`); on a child only the registry is touched.
//!
//! | action  | parent                                  | child                          |
//! |---------|-----------------------------------------|--------------------------------|
//! | delete  | delete children, drop all their entries | detach from parent, drop entry |
//! | trash   | trash children                          | nothing                        |
//! | restore | restore children                        | nothing                        |
//! | unlink  | drop both sides, content untouched      | drop both sides                |
//!
//! The action on the item itself is the host's business; the executor runs
//! from the host's lifecycle event, after or before the host acts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::context::{BroadcastGuard, SiteScope};
use crate::error::Result;
use crate::link::{LinkEntry, LinkRegistry, LinkStore};
use crate::platform::Platform;
use crate::types::{ItemRef, SiteId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkAction {
    Delete,
    Trash,
    Restore,
    Unlink,
}

impl fmt::Display for LinkAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkAction::Delete => "delete",
            LinkAction::Trash => "trash",
            LinkAction::Restore => "restore",
            LinkAction::Unlink => "unlink",
        };
        f.write_str(s)
    }
}

/// A child the action could not be applied to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedChild {
    pub child: ItemRef,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeReport {
    pub action: LinkAction,
    pub item: ItemRef,
    pub started_at: DateTime<Utc>,
    /// The cascade ran inside a broadcast or another cascade and did nothing
    pub suppressed: bool,
    /// Children the action was applied to
    pub touched: Vec<ItemRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<SkippedChild>,
    /// Parent the item was detached from, when it was a child
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detached_from: Option<ItemRef>,
}

impl CascadeReport {
    fn new(action: LinkAction, item: ItemRef) -> Self {
        Self {
            action,
            item,
            started_at: Utc::now(),
            suppressed: false,
            touched: Vec::new(),
            skipped: Vec::new(),
            detached_from: None,
        }
    }

    fn skip(&mut self, child: ItemRef, reason: impl Into<String>) {
        self.skipped.push(SkippedChild {
            child,
            reason: reason.into(),
        });
    }
}

pub struct CascadeExecutor<'a, P: ?Sized, L> {
    platform: &'a P,
    registry: &'a LinkRegistry<L>,
    guard: BroadcastGuard,
}

impl<'a, P: Platform + ?Sized, L: LinkStore> CascadeExecutor<'a, P, L> {
    pub fn new(platform: &'a P, registry: &'a LinkRegistry<L>, guard: BroadcastGuard) -> Self {
        Self {
            platform,
            registry,
            guard,
        }
    }

    /// Apply `action` to the link group of `item`. With `only_site`, a
    /// parent cascades to its child on that site alone.
    pub fn execute(
        &self,
        action: LinkAction,
        item: ItemRef,
        only_site: Option<SiteId>,
    ) -> Result<CascadeReport> {
        let mut report = CascadeReport::new(action, item);
        let Some(_token) = self.guard.enter() else {
            tracing::debug!(%item, %action, "cascade inside a running broadcast; ignored");
            report.suppressed = true;
            return Ok(report);
        };

        let entry = self.registry.get(item)?;
        if entry.has_parent() {
            self.execute_on_child(action, entry, &mut report)?;
        } else {
            self.execute_on_parent(action, entry, only_site, &mut report)?;
        }

        tracing::info!(
            %item,
            %action,
            touched = report.touched.len(),
            skipped = report.skipped.len(),
            "cascade finished"
        );
        Ok(report)
    }

    fn execute_on_parent(
        &self,
        action: LinkAction,
        mut entry: LinkEntry,
        only_site: Option<SiteId>,
        report: &mut CascadeReport,
    ) -> Result<()> {
        let children: Vec<ItemRef> = entry
            .children()
            .filter(|c| only_site.is_none_or(|site| c.site == site))
            .collect();

        for child in children {
            if !self.registry.links_back(entry.owner(), child)? {
                self.registry.drop_one_sided(&mut entry, child.site)?;
                report.skip(child, "child does not link back");
                continue;
            }

            if action != LinkAction::Unlink {
                match self.apply(action, child) {
                    Ok(true) => report.touched.push(child),
                    Ok(false) => report.skip(child, "item no longer exists"),
                    Err(e) => {
                        tracing::warn!(%child, %action, "cascade to child failed: {}", e);
                        report.skip(child, e.to_string());
                        // A failed delete keeps the link so it can be retried
                        if action == LinkAction::Delete {
                            continue;
                        }
                    }
                }
            } else {
                report.touched.push(child);
            }

            if matches!(action, LinkAction::Delete | LinkAction::Unlink) {
                self.registry.unlink_child(&mut entry, child.site)?;
                if action == LinkAction::Delete {
                    self.registry.delete(child)?;
                }
            }
        }

        if action == LinkAction::Delete && only_site.is_none() && !entry.has_children() {
            self.registry.delete(entry.owner())?;
        }
        Ok(())
    }

    fn execute_on_child(
        &self,
        action: LinkAction,
        entry: LinkEntry,
        report: &mut CascadeReport,
    ) -> Result<()> {
        let item = entry.owner();
        match action {
            LinkAction::Delete => {
                report.detached_from = self.registry.remove_child(item)?;
                self.registry.delete(item)?;
            }
            LinkAction::Unlink => {
                report.detached_from = self.registry.remove_child(item)?;
            }
            LinkAction::Trash | LinkAction::Restore => {}
        }
        Ok(())
    }

    /// Apply the action to one child inside its site context.
    /// Returns false when the child item is gone.
    fn apply(&self, action: LinkAction, child: ItemRef) -> Result<bool> {
        let _scope = SiteScope::enter(self.platform, child.site)?;
        if self.platform.get_item(child.site, child.item)?.is_none() {
            return Ok(false);
        }
        match action {
            LinkAction::Delete => self.platform.delete_item(child.site, child.item)?,
            LinkAction::Trash => self.platform.trash_item(child.site, child.item)?,
            LinkAction::Restore => self.platform.restore_item(child.site, child.item)?,
            LinkAction::Unlink => {}
        }
        tracing::debug!(%child, %action, "applied to child");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::MemoryLinkStore;
    use crate::local::LocalPlatform;
    use crate::platform::ContentStore;
    use crate::types::{ContentItem, ItemStatus};
    use tempfile::TempDir;

    struct Group {
        _tmp: TempDir,
        platform: LocalPlatform,
        registry: LinkRegistry<MemoryLinkStore>,
        parent: ItemRef,
        children: Vec<ItemRef>,
    }

    /// Parent on site 1 with children on sites 2 and 3
    fn group() -> Group {
        let tmp = TempDir::new().unwrap();
        let platform = LocalPlatform::new(tmp.path().join("uploads"));
        let registry = LinkRegistry::new(MemoryLinkStore::new());
        let mut refs = Vec::new();
        for site in 1..=3 {
            platform.add_site(site);
            let id = platform
                .insert_item(site, &ContentItem::new(site, "post", "Linked"))
                .unwrap();
            refs.push(ItemRef::new(site, id));
        }
        let parent = refs[0];
        let mut entry = registry.get(parent).unwrap();
        for child in &refs[1..] {
            registry.link(&mut entry, *child).unwrap();
        }
        Group {
            _tmp: tmp,
            platform,
            registry,
            parent,
            children: refs[1..].to_vec(),
        }
    }

    fn executor(g: &Group) -> CascadeExecutor<'_, LocalPlatform, MemoryLinkStore> {
        CascadeExecutor::new(&g.platform, &g.registry, BroadcastGuard::new())
    }

    #[test]
    fn test_trash_and_restore_reach_every_child() {
        let g = group();
        let report = executor(&g).execute(LinkAction::Trash, g.parent, None).unwrap();
        assert_eq!(report.touched, g.children);
        for child in &g.children {
            let item = g.platform.get_item(child.site, child.item).unwrap().unwrap();
            assert_eq!(item.status, ItemStatus::Trash);
        }
        executor(&g).execute(LinkAction::Restore, g.parent, None).unwrap();
        for child in &g.children {
            let item = g.platform.get_item(child.site, child.item).unwrap().unwrap();
            assert_eq!(item.status, ItemStatus::Publish);
        }
        assert_eq!(g.registry.get(g.parent).unwrap().child_count(), 2);
    }

    #[test]
    fn test_delete_removes_children_and_entries() {
        let g = group();
        let report = executor(&g).execute(LinkAction::Delete, g.parent, None).unwrap();
        assert_eq!(report.touched.len(), 2);
        for child in &g.children {
            assert!(g.platform.get_item(child.site, child.item).unwrap().is_none());
            assert!(g.registry.get(*child).unwrap().is_empty());
        }
        assert!(g.registry.store().is_empty());
    }

    #[test]
    fn test_only_site_limits_the_cascade() {
        let g = group();
        let report = executor(&g)
            .execute(LinkAction::Delete, g.parent, Some(2))
            .unwrap();
        assert_eq!(report.touched, vec![g.children[0]]);
        let entry = g.registry.get(g.parent).unwrap();
        assert_eq!(entry.child_on(2), None);
        assert_eq!(entry.child_on(3), Some(g.children[1].item));
        let third = g.children[1];
        assert!(g.platform.get_item(third.site, third.item).unwrap().is_some());
    }

    #[test]
    fn test_unlink_keeps_content() {
        let g = group();
        executor(&g).execute(LinkAction::Unlink, g.parent, None).unwrap();
        assert!(g.registry.store().is_empty());
        for child in &g.children {
            assert!(g.platform.get_item(child.site, child.item).unwrap().is_some());
        }
    }

    #[test]
    fn test_child_side_delete_detaches_from_parent() {
        let g = group();
        let child = g.children[0];
        let report = executor(&g).execute(LinkAction::Delete, child, None).unwrap();
        assert_eq!(report.detached_from, Some(g.parent));
        assert!(report.touched.is_empty());
        assert_eq!(g.registry.get(g.parent).unwrap().child_on(2), None);
        assert!(g.registry.get(child).unwrap().is_empty());
        // Child-side actions never touch content
        assert!(g.platform.get_item(child.site, child.item).unwrap().is_some());
    }

    #[test]
    fn test_child_side_trash_touches_nothing() {
        let g = group();
        let report = executor(&g).execute(LinkAction::Trash, g.children[1], None).unwrap();
        assert!(report.touched.is_empty());
        assert_eq!(report.detached_from, None);
        assert_eq!(g.registry.get(g.parent).unwrap().child_count(), 2);
    }

    #[test]
    fn test_missing_child_is_reported_and_unlinked_on_delete() {
        let g = group();
        let gone = g.children[0];
        g.platform.delete_item(gone.site, gone.item).unwrap();
        let report = executor(&g).execute(LinkAction::Delete, g.parent, None).unwrap();
        assert_eq!(report.touched, vec![g.children[1]]);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].child, gone);
        assert!(g.registry.store().is_empty());
    }

    #[test]
    fn test_unlinked_item_touches_nothing() {
        let g = group();
        let loner = g
            .platform
            .insert_item(1, &ContentItem::new(1, "post", "Alone"))
            .unwrap();
        let report = executor(&g)
            .execute(LinkAction::Delete, ItemRef::new(1, loner), None)
            .unwrap();
        assert!(report.touched.is_empty());
        assert_eq!(g.registry.store().len(), 3);
    }

    #[test]
    fn test_one_sided_pointer_is_skipped_and_dropped() {
        let g = group();
        let claimant = ItemRef::new(
            1,
            g.platform
                .insert_item(1, &ContentItem::new(1, "post", "Claimant"))
                .unwrap(),
        );
        let unrelated = ItemRef::new(
            2,
            g.platform
                .insert_item(2, &ContentItem::new(2, "post", "Unrelated"))
                .unwrap(),
        );
        let mut entry = g.registry.get(claimant).unwrap();
        assert!(entry.add_child(unrelated));
        assert!(entry.add_child(g.children[1]));
        g.registry.put(&entry).unwrap();

        let report = executor(&g).execute(LinkAction::Delete, claimant, None).unwrap();
        assert!(report.touched.is_empty());
        let skipped: Vec<ItemRef> = report.skipped.iter().map(|s| s.child).collect();
        assert_eq!(skipped, vec![unrelated, g.children[1]]);

        assert!(g.platform.get_item(2, unrelated.item).unwrap().is_some());
        let third = g.children[1];
        assert!(g.platform.get_item(third.site, third.item).unwrap().is_some());
        assert!(g.registry.get(claimant).unwrap().is_empty());
        assert_eq!(g.registry.get(third).unwrap().parent(), Some(g.parent));
        assert_eq!(g.registry.get(g.parent).unwrap().child_count(), 2);
    }

    #[test]
    fn test_suppressed_while_guard_is_held() {
        let g = group();
        let guard = BroadcastGuard::new();
        let _token = guard.enter().unwrap();
        let exec = CascadeExecutor::new(&g.platform, &g.registry, guard.clone());
        let report = exec.execute(LinkAction::Delete, g.parent, None).unwrap();
        assert!(report.suppressed);
        assert_eq!(g.registry.store().len(), 3);
    }
}
