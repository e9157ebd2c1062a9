//! Broadcast Core Library
//!
//! Propagates content items between the sites of a multi-tenant platform
//! and keeps the copies linked:
//! - Content model and host platform interfaces
//! - Site context scoping and reentrancy guard
//! - Link registry (in-memory and SQLite persistence)
//! - Metadata filter pipeline
//! - Classification term synchronizer
//! - Attachment replication and content rewriting
//! - Broadcast orchestrator and cascading lifecycle actions
//! - In-process host platform backed by a JSON snapshot

pub mod attachments;
pub mod broadcast;
pub mod cascade;
pub mod config;
pub mod context;
pub mod error;
pub mod link;
pub mod local;
pub mod meta_filter;
pub mod platform;
pub mod rewrite;
pub mod sqlite_links;
pub mod terms;
pub mod types;

pub use attachments::{AttachmentReplicator, ReplicationPolicy, Replicated};
pub use broadcast::{
    BroadcastReport, BroadcastRequest, Broadcaster, EquivalenceMap, TargetReport, TargetStatus,
};
pub use cascade::{CascadeExecutor, CascadeReport, LinkAction, SkippedChild};
pub use config::{BroadcastOptions, EngineConfig};
pub use context::{BroadcastGuard, GuardToken, SiteScope, SiteSwitcher};
pub use error::{BroadcastError, Result};
pub use link::{LinkEntry, LinkRegistry, LinkStore, MemoryLinkStore};
pub use local::{LocalPlatform, PlatformSnapshot};
pub use meta_filter::{MetaFilter, MetaPlan, PatternList};
pub use platform::{AttachmentStore, ContentStore, MetaStore, Platform, TermStore};
pub use rewrite::{ContentRewriter, CopiedAttachment, CopiedAttachments};
pub use sqlite_links::SqliteLinkStore;
pub use terms::{TermSyncOutcome, TermSynchronizer};
pub use types::{
    AttachmentDescriptor, AttachmentMetadata, ContentItem, ItemId, ItemRef, ItemStatus, MetaMap,
    SiteId, Term, TermId, TermUpdate, meta_keys,
};
