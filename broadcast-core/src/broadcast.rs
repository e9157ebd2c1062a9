//! Broadcast orchestrator
//!
//! One [`Broadcaster::run`] propagates an origin item to a set of target
//! sites. Each target is processed inside its own [`SiteScope`]:
//!
//! 1. resolve the target item (linked child, adopted sibling or new insert)
//! 2. write the item fields (hierarchy parent mapped, globally-unique
//!    fields cleared)
//! 3. sync classification terms and assign them
//! 4. replicate attachments (structurally attached, gallery and thumbnail)
//! 5. rewrite the body against the copied attachments
//! 6. apply the metadata plan and the representative image
//! 7. link both sides in the registry
//!
//! A failure on one target is recorded in that target's report and the run
//! moves on. Nested runs (a host save event firing while a run is in
//! progress) are suppressed by the shared [`BroadcastGuard`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use crate::attachments::AttachmentReplicator;
use crate::cascade::CascadeExecutor;
use crate::config::{BroadcastOptions, EngineConfig};
use crate::context::{BroadcastGuard, SiteScope};
use crate::error::{BroadcastError, Result};
use crate::link::{LinkEntry, LinkRegistry, LinkStore};
use crate::meta_filter::MetaFilter;
use crate::platform::Platform;
use crate::rewrite::{ContentRewriter, CopiedAttachment, CopiedAttachments};
use crate::terms::TermSynchronizer;
use crate::types::{
    AttachmentDescriptor, ContentItem, ItemId, ItemRef, MetaMap, SiteId, Term, TermId, meta_keys,
};

/// One propagation run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastRequest {
    pub origin: ItemRef,
    pub targets: BTreeSet<SiteId>,
    pub options: BroadcastOptions,
}

impl BroadcastRequest {
    pub fn new(origin: ItemRef) -> Self {
        Self {
            origin,
            targets: BTreeSet::new(),
            options: BroadcastOptions::default(),
        }
    }

    pub fn to(mut self, site: SiteId) -> Self {
        self.targets.insert(site);
        self
    }

    pub fn to_sites(mut self, sites: impl IntoIterator<Item = SiteId>) -> Self {
        self.targets.extend(sites);
        self
    }

    pub fn with_options(mut self, options: BroadcastOptions) -> Self {
        self.options = options;
        self
    }
}

/// Outcome of one target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    Created,
    Updated,
    Skipped,
    Failed,
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TargetStatus::Created => "created",
            TargetStatus::Updated => "updated",
            TargetStatus::Skipped => "skipped",
            TargetStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetReport {
    pub site: SiteId,
    pub status: TargetStatus,
    /// Item on the target, when one was written
    pub item: Option<ItemId>,
    /// Skip reason or error text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Recovered sub-operation failures
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl TargetReport {
    fn skipped(site: SiteId, reason: impl Into<String>) -> Self {
        Self {
            site,
            status: TargetStatus::Skipped,
            item: None,
            message: Some(reason.into()),
            warnings: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, TargetStatus::Created | TargetStatus::Updated)
    }
}

/// Per-target outcomes of one run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastReport {
    pub origin: ItemRef,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// The run was nested inside another and did nothing
    pub suppressed: bool,
    pub targets: Vec<TargetReport>,
}

impl BroadcastReport {
    fn new(origin: ItemRef, started_at: DateTime<Utc>) -> Self {
        Self {
            origin,
            started_at,
            finished_at: started_at,
            suppressed: false,
            targets: Vec::new(),
        }
    }

    pub fn target(&self, site: SiteId) -> Option<&TargetReport> {
        self.targets.iter().find(|t| t.site == site)
    }

    pub fn count(&self, status: TargetStatus) -> usize {
        self.targets.iter().filter(|t| t.status == status).count()
    }

    fn finish(mut self) -> Self {
        self.finished_at = Utc::now();
        self
    }
}

/// Origin item -> equivalent item on each target, accumulated during a run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EquivalenceMap {
    entries: BTreeMap<(ItemRef, SiteId), ItemId>,
}

impl EquivalenceMap {
    pub fn insert(&mut self, origin: ItemRef, site: SiteId, item: ItemId) {
        self.entries.insert((origin, site), item);
    }

    pub fn get(&self, origin: ItemRef, site: SiteId) -> Option<ItemId> {
        self.entries.get(&(origin, site)).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Source-side data gathered once per run
struct SourceSnapshot {
    item: ContentItem,
    meta: MetaMap,
    attachments: Vec<AttachmentDescriptor>,
    thumbnail: Option<ItemId>,
    taxonomies: Vec<SourceTaxonomy>,
    warnings: Vec<String>,
}

struct SourceTaxonomy {
    name: String,
    terms: Vec<Term>,
    wanted: Vec<TermId>,
}

/// Propagates items across sites
pub struct Broadcaster<P: ?Sized, L> {
    platform: Arc<P>,
    registry: LinkRegistry<L>,
    config: EngineConfig,
    meta_filter: MetaFilter,
    rewriter: ContentRewriter,
    guard: BroadcastGuard,
}

impl<P: Platform + ?Sized, L: LinkStore> Broadcaster<P, L> {
    pub fn new(platform: Arc<P>, links: L, config: EngineConfig) -> Result<Self> {
        let meta_filter = MetaFilter::from_config(&config.meta)?;
        let rewriter = ContentRewriter::new(config.content.gallery_directives.as_slice())?;
        Ok(Self {
            platform,
            registry: LinkRegistry::new(links),
            config,
            meta_filter,
            rewriter,
            guard: BroadcastGuard::new(),
        })
    }

    /// Share an existing guard (e.g. with a host-side cascade handler)
    pub fn with_guard(mut self, guard: BroadcastGuard) -> Self {
        self.guard = guard;
        self
    }

    pub fn platform(&self) -> &Arc<P> {
        &self.platform
    }

    pub fn registry(&self) -> &LinkRegistry<L> {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn guard(&self) -> &BroadcastGuard {
        &self.guard
    }

    /// Check if a broadcast or cascade is in progress
    pub fn is_running(&self) -> bool {
        self.guard.is_active()
    }

    /// Cascade executor over the same platform, registry and guard
    pub fn cascade(&self) -> CascadeExecutor<'_, P, L> {
        CascadeExecutor::new(self.platform.as_ref(), &self.registry, self.guard.clone())
    }

    pub fn run(&self, request: &BroadcastRequest) -> Result<BroadcastReport> {
        let origin = request.origin;
        let mut report = BroadcastReport::new(origin, Utc::now());

        let Some(_token) = self.guard.enter() else {
            tracing::warn!(%origin, "broadcast already in progress; ignoring nested run");
            report.suppressed = true;
            return Ok(report.finish());
        };

        let platform = self.platform.as_ref();
        let item = platform
            .get_item(origin.site, origin.item)?
            .ok_or(BroadcastError::NotFound(origin))?;

        if let Some(reason) = publication_gate(&item, &request.options) {
            tracing::info!(%origin, status = %item.status, "not broadcasting: {}", reason);
            report.targets = request
                .targets
                .iter()
                .map(|&site| TargetReport::skipped(site, reason))
                .collect();
            return Ok(report.finish());
        }

        let mut origin_entry = self.registry.get(origin)?;
        if origin_entry.has_parent() {
            return Err(BroadcastError::LinkedChild(origin));
        }

        tracing::info!(%origin, targets = request.targets.len(), "broadcast started");

        let mut terms = TermSynchronizer::new(platform, self.config.terms.cache_capacity);
        let source = self.collect_source(item, &request.options, &mut terms)?;
        let mut equivalence = EquivalenceMap::default();

        for &site in &request.targets {
            if site == origin.site {
                report
                    .targets
                    .push(TargetReport::skipped(site, "target is the origin site"));
                continue;
            }

            let mut warnings = source.warnings.clone();
            let outcome = self.broadcast_to(
                site,
                &source,
                &mut origin_entry,
                &request.options,
                &mut terms,
                &mut equivalence,
                &mut warnings,
            );
            let target = match outcome {
                Ok((status, id)) => {
                    tracing::info!(%origin, site, item = id, %status, "target done");
                    TargetReport {
                        site,
                        status,
                        item: Some(id),
                        message: None,
                        warnings,
                    }
                }
                Err(e) => {
                    tracing::warn!(%origin, site, "target failed: {}", e);
                    TargetReport {
                        site,
                        status: TargetStatus::Failed,
                        item: None,
                        message: Some(e.to_string()),
                        warnings,
                    }
                }
            };
            report.targets.push(target);
        }

        let report = report.finish();
        tracing::info!(
            %origin,
            created = report.count(TargetStatus::Created),
            updated = report.count(TargetStatus::Updated),
            failed = report.count(TargetStatus::Failed),
            "broadcast finished"
        );
        Ok(report)
    }

    fn collect_source(
        &self,
        item: ContentItem,
        options: &BroadcastOptions,
        terms: &mut TermSynchronizer<'_, P>,
    ) -> Result<SourceSnapshot> {
        let platform = self.platform.as_ref();
        let site = item.site;
        let mut warnings = Vec::new();

        let meta = platform.get_all_meta(site, item.id)?;
        let thumbnail = if options.propagate_metadata {
            meta.get(meta_keys::THUMBNAIL_ID)
                .and_then(|v| v.first())
                .and_then(|v| v.trim().parse::<ItemId>().ok())
        } else {
            None
        };

        let mut attachments = platform.list_attached(site, item.id)?;
        let mut referenced: Vec<ItemId> = self.rewriter.gallery_ids(&item.body);
        referenced.extend(thumbnail);
        for id in referenced {
            if attachments.iter().any(|a| a.id == id) {
                continue;
            }
            match platform.get_attachment(site, id)? {
                Some(attachment) => attachments.push(attachment),
                None => {
                    tracing::warn!(site, attachment = id, "referenced attachment not found");
                    warnings.push(format!("attachment {} not found on origin", id));
                }
            }
        }
        for attachment in &mut attachments {
            attachment.attached = attachment.parent == Some(item.id);
        }

        let mut taxonomies = Vec::new();
        if options.propagate_classifications {
            for name in platform.taxonomies_for(site, &item.item_type)? {
                let source_terms = terms.terms(site, &name)?;
                let wanted = item.terms.get(&name).cloned().unwrap_or_default();
                taxonomies.push(SourceTaxonomy {
                    name,
                    terms: source_terms,
                    wanted,
                });
            }
        }

        Ok(SourceSnapshot {
            item,
            meta,
            attachments,
            thumbnail,
            taxonomies,
            warnings,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn broadcast_to(
        &self,
        site: SiteId,
        source: &SourceSnapshot,
        origin_entry: &mut LinkEntry,
        options: &BroadcastOptions,
        terms: &mut TermSynchronizer<'_, P>,
        equivalence: &mut EquivalenceMap,
        warnings: &mut Vec<String>,
    ) -> Result<(TargetStatus, ItemId)> {
        let platform = self.platform.as_ref();
        let scope = SiteScope::enter(platform, site)?;
        let origin = source.item.item_ref();

        let existing = self.resolve_existing(site, source, origin_entry, options, warnings)?;

        let mut target_item = source.item.clone();
        target_item.site = site;
        target_item.guid = None;
        target_item.parent =
            self.map_parent(origin.site, source.item.parent, site, equivalence, warnings)?;

        let (status, id) = match existing {
            Some(id) => {
                let current = platform
                    .get_item(site, id)?
                    .ok_or(BroadcastError::NotFound(ItemRef::new(site, id)))?;
                target_item.id = id;
                target_item.terms = current.terms;
                platform.update_item(site, &target_item)?;
                (TargetStatus::Updated, id)
            }
            None => {
                target_item.id = 0;
                target_item.terms.clear();
                let id = platform.insert_item(site, &target_item)?;
                (TargetStatus::Created, id)
            }
        };
        equivalence.insert(origin, site, id);
        tracing::debug!(%origin, site, item = id, %status, "target item written");

        if options.propagate_classifications {
            let available = platform.taxonomies_for(site, &source.item.item_type)?;
            for taxonomy in &source.taxonomies {
                if !available.contains(&taxonomy.name) {
                    warnings.push(format!(
                        "taxonomy {} not available on site {}",
                        taxonomy.name, site
                    ));
                    continue;
                }
                let outcome = terms.sync(
                    &taxonomy.name,
                    &taxonomy.terms,
                    &taxonomy.wanted,
                    site,
                    options.create_terms,
                )?;
                for slug in &outcome.missing {
                    warnings.push(format!("{}: term {} not resolved", taxonomy.name, slug));
                }
                let assigned = outcome.map_ids(&taxonomy.wanted);
                platform.assign_terms(site, id, &taxonomy.name, &assigned)?;
            }
        }

        if status == TargetStatus::Updated && options.delete_child_attachments {
            for old in platform.list_attached(site, id)? {
                tracing::debug!(site, attachment = old.id, "deleting previous child attachment");
                platform.delete_attachment(site, old.id)?;
            }
        }

        let policy = self.config.attachments.policy;
        let replicator = AttachmentReplicator::new(platform, policy);
        let mut copied = CopiedAttachments::new();
        for attachment in &source.attachments {
            let parent = (attachment.attached || policy.fresh_copies()).then_some(id);
            match replicator.replicate(attachment, site, parent) {
                Ok(replicated) => copied.insert(
                    attachment.id,
                    CopiedAttachment {
                        target_id: replicated.id,
                        source_url: attachment.url.clone(),
                        target_url: replicated.url,
                    },
                ),
                Err(e) => {
                    tracing::warn!(site, attachment = attachment.id, "attachment skipped: {}", e);
                    warnings.push(format!("attachment {} skipped: {}", attachment.id, e));
                }
            }
        }

        let body = self.rewriter.rewrite(&source.item.body, &copied);
        if body != source.item.body {
            let mut stored = platform
                .get_item(site, id)?
                .ok_or(BroadcastError::NotFound(ItemRef::new(site, id)))?;
            stored.body = body;
            platform.update_item(site, &stored)?;
        }

        if options.propagate_metadata {
            let target_meta = platform.get_all_meta(site, id)?;
            let plan = self.meta_filter.plan(&source.meta, &target_meta);
            for (key, values) in &plan.set {
                platform.set_meta(site, id, key, values)?;
            }
            for key in &plan.delete {
                platform.delete_meta(site, id, key)?;
            }
            if !plan.protected.is_empty() {
                tracing::debug!(site, item = id, keys = ?plan.protected, "protected keys kept");
            }

            match source.thumbnail.and_then(|t| copied.target_id(t)) {
                Some(thumbnail) => {
                    platform.set_meta(site, id, meta_keys::THUMBNAIL_ID, &[thumbnail.to_string()])?
                }
                None if target_meta.contains_key(meta_keys::THUMBNAIL_ID) => {
                    platform.delete_meta(site, id, meta_keys::THUMBNAIL_ID)?
                }
                None => {}
            }
        }

        if options.link {
            self.registry.link(origin_entry, ItemRef::new(site, id))?;
        }

        drop(scope);
        Ok((status, id))
    }

    /// Existing target item to update, if any
    fn resolve_existing(
        &self,
        site: SiteId,
        source: &SourceSnapshot,
        origin_entry: &mut LinkEntry,
        options: &BroadcastOptions,
        warnings: &mut Vec<String>,
    ) -> Result<Option<ItemId>> {
        let platform = self.platform.as_ref();

        if let Some(child) = origin_entry.child_on(site) {
            let linked = ItemRef::new(site, child);
            if !self.registry.links_back(origin_entry.owner(), linked)? {
                self.registry.drop_one_sided(origin_entry, site)?;
                warnings.push(format!("{} does not link back; treated as unlinked", linked));
            } else if platform.get_item(site, child)?.is_some() {
                return Ok(Some(child));
            } else {
                tracing::warn!(
                    origin = %origin_entry.owner(),
                    stale = %linked,
                    "linked child is gone; dropping link"
                );
                warnings.push(format!("linked child {} no longer exists", linked));
                origin_entry.remove_child(site);
                self.registry.put(origin_entry)?;
                self.registry.delete(linked)?;
            }
        }

        if options.adopt_unlinked_siblings {
            let candidates =
                platform.list_by_name_and_type(site, &source.item.name, &source.item.item_type)?;
            for candidate in candidates {
                if self.registry.get(candidate.item_ref())?.is_empty() {
                    tracing::debug!(site, item = candidate.id, "adopting unlinked sibling");
                    return Ok(Some(candidate.id));
                }
            }
        }

        Ok(None)
    }

    /// Equivalent of the origin's hierarchy parent on `site`
    fn map_parent(
        &self,
        origin_site: SiteId,
        parent: Option<ItemId>,
        site: SiteId,
        equivalence: &mut EquivalenceMap,
        warnings: &mut Vec<String>,
    ) -> Result<Option<ItemId>> {
        let Some(parent) = parent else {
            return Ok(None);
        };
        let parent_ref = ItemRef::new(origin_site, parent);
        if let Some(id) = equivalence.get(parent_ref, site) {
            return Ok(Some(id));
        }

        let entry = self.registry.get(parent_ref)?;
        let mapped = match entry.parent() {
            Some(p) if p.site == site => {
                let confirmed = self.registry.get(p)?.child_on(origin_site) == Some(parent);
                confirmed.then_some(p.item)
            }
            _ => match entry.child_on(site) {
                Some(id) if self.registry.links_back(parent_ref, ItemRef::new(site, id))? => {
                    Some(id)
                }
                _ => None,
            },
        };
        match mapped {
            Some(id) => {
                equivalence.insert(parent_ref, site, id);
                Ok(Some(id))
            }
            None => {
                warnings.push(format!("parent {} has no equivalent on site {}", parent_ref, site));
                Ok(None)
            }
        }
    }
}

/// Reason an item must not be broadcast in its current status
fn publication_gate(item: &ContentItem, options: &BroadcastOptions) -> Option<&'static str> {
    use crate::types::ItemStatus;
    match item.status {
        ItemStatus::Trash => Some("item is in the trash"),
        s if s.is_draft() && !options.allow_draft => Some("drafts are not broadcast"),
        s if s.is_scheduled() && !options.allow_scheduled => {
            Some("scheduled items are not broadcast")
        }
        _ => None,
    }
}
