//! Command implementations
//!
//! Every command loads the network snapshot, the engine configuration and
//! the SQLite link registry, does its work synchronously and returns a JSON
//! value for `main` to print. Commands that change content save the
//! snapshot back.

use anyhow::{Context, Result, bail};
use broadcast_core::{
    BroadcastOptions, BroadcastRequest, Broadcaster, ContentStore, EngineConfig, ItemId, ItemRef,
    LinkAction, LocalPlatform, PlatformSnapshot, SiteId, SqliteLinkStore,
};
use clap::Args;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;

/// Per-run flags, mapped onto [`BroadcastOptions`]
#[derive(Args, Debug, Clone, Copy, Default)]
pub struct RunFlags {
    /// Do not link the copies to the origin
    #[arg(long)]
    pub no_link: bool,
    /// Do not copy metadata
    #[arg(long)]
    pub no_meta: bool,
    /// Do not sync classification terms
    #[arg(long)]
    pub no_terms: bool,
    /// Skip terms missing on a target instead of creating them
    #[arg(long)]
    pub no_create_terms: bool,
    /// Broadcast drafts and pending items
    #[arg(long)]
    pub allow_draft: bool,
    /// Broadcast scheduled items
    #[arg(long)]
    pub allow_scheduled: bool,
    /// Keep the attachments of existing copies on update
    #[arg(long)]
    pub keep_child_attachments: bool,
    /// Adopt an unlinked item with the same name and type on a target
    #[arg(long)]
    pub adopt_siblings: bool,
}

impl RunFlags {
    pub fn options(&self) -> BroadcastOptions {
        BroadcastOptions {
            link: !self.no_link,
            propagate_metadata: !self.no_meta,
            propagate_classifications: !self.no_terms,
            create_terms: !self.no_create_terms,
            allow_draft: self.allow_draft,
            allow_scheduled: self.allow_scheduled,
            delete_child_attachments: !self.keep_child_attachments,
            adopt_unlinked_siblings: self.adopt_siblings,
        }
    }
}

/// Files a command works on
#[derive(Debug, Clone)]
pub struct Workspace {
    pub state: PathBuf,
    pub uploads: PathBuf,
    pub registry: PathBuf,
    pub config: PathBuf,
}

type Engine = Broadcaster<LocalPlatform, SqliteLinkStore>;

impl Workspace {
    fn open(&self) -> Result<Engine> {
        let platform = LocalPlatform::load(&self.state, self.uploads.clone())
            .with_context(|| format!("failed to load snapshot {}", self.state.display()))?;
        let config = EngineConfig::load(&self.config)
            .with_context(|| format!("failed to load config {}", self.config.display()))?;
        let links = SqliteLinkStore::open(&self.registry)
            .with_context(|| format!("failed to open registry {}", self.registry.display()))?;
        Ok(Broadcaster::new(Arc::new(platform), links, config)?)
    }

    fn save(&self, engine: &Engine) -> Result<()> {
        engine
            .platform()
            .save(&self.state)
            .with_context(|| format!("failed to save snapshot {}", self.state.display()))
    }

    pub fn init(&self, sites: &[SiteId]) -> Result<Value> {
        if self.state.exists() {
            bail!("snapshot {} already exists", self.state.display());
        }
        let mut snapshot = PlatformSnapshot::default();
        for &site in sites {
            snapshot.sites.entry(site).or_default();
        }
        snapshot
            .save(&self.state)
            .with_context(|| format!("failed to write snapshot {}", self.state.display()))?;
        if !self.config.exists() {
            EngineConfig::default()
                .save(&self.config)
                .with_context(|| format!("failed to write config {}", self.config.display()))?;
        }
        tracing::info!(state = %self.state.display(), "network initialized");
        Ok(json!({
            "state": self.state.display().to_string(),
            "sites": sites,
        }))
    }

    pub fn run(&self, site: SiteId, item: ItemId, to: &[SiteId], flags: RunFlags) -> Result<Value> {
        let engine = self.open()?;
        let request = BroadcastRequest::new(ItemRef::new(site, item))
            .to_sites(to.iter().copied())
            .with_options(flags.options());
        let report = engine
            .run(&request)
            .with_context(|| format!("broadcast of {} failed", request.origin))?;
        self.save(&engine)?;
        Ok(serde_json::to_value(&report)?)
    }

    pub fn links(&self, site: SiteId, item: ItemId) -> Result<Value> {
        let engine = self.open()?;
        let entry = engine.registry().get(ItemRef::new(site, item))?;
        let children: Vec<ItemRef> = entry.children().collect();
        Ok(json!({
            "item": entry.owner(),
            "parent": entry.parent(),
            "children": children,
        }))
    }

    /// Run a lifecycle action. Without `only`, the item itself gets the
    /// action too (except for unlink); with it, only that site's copy does.
    pub fn cascade(
        &self,
        action: LinkAction,
        site: SiteId,
        item: ItemId,
        only: Option<SiteId>,
    ) -> Result<Value> {
        let engine = self.open()?;
        let target = ItemRef::new(site, item);
        let platform = engine.platform();
        if platform.get_item(site, item)?.is_none() && action != LinkAction::Delete {
            bail!("item {} not found", target);
        }

        let report = engine.cascade().execute(action, target, only)?;

        if only.is_none() {
            match action {
                LinkAction::Delete => {
                    if platform.get_item(site, item)?.is_some() {
                        platform.delete_item(site, item)?;
                    }
                }
                LinkAction::Trash => platform.trash_item(site, item)?,
                LinkAction::Restore => platform.restore_item(site, item)?,
                LinkAction::Unlink => {}
            }
        }
        self.save(&engine)?;
        Ok(serde_json::to_value(&report)?)
    }
}
