//! Attachment replication engine
//!
//! Copies an attachment's binary file to a target site, regenerates its
//! metadata from the copy and carries its custom fields over, rewriting the
//! ones that point into the uploads directory. Attachments are deduplicated
//! on the target by their derived slug, according to a
//! [`ReplicationPolicy`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{BroadcastError, Result};
use crate::platform::AttachmentStore;
use crate::types::{AttachmentDescriptor, ItemId, SiteId, meta_keys, slugify};

/// What to do when the target already has an attachment with the same slug
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationPolicy {
    /// Reuse the existing attachment
    #[default]
    Use,
    /// Delete the existing attachment, then copy fresh
    Overwrite,
    /// Copy under a suffixed file name so nothing collides
    Randomize,
}

impl ReplicationPolicy {
    /// Every replication makes a new copy that nothing else shares
    pub fn fresh_copies(self) -> bool {
        self == ReplicationPolicy::Randomize
    }
}

impl fmt::Display for ReplicationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReplicationPolicy::Use => "use",
            ReplicationPolicy::Overwrite => "overwrite",
            ReplicationPolicy::Randomize => "randomize",
        };
        f.write_str(s)
    }
}

/// Result of replicating one attachment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replicated {
    /// Attachment ID on the target
    pub id: ItemId,
    /// Reference token of the target attachment
    pub url: String,
    /// An existing attachment was reused instead of copied
    pub reused: bool,
}

/// Derive the deduplication slug from a file name
pub fn derive_slug(file_name: &str) -> String {
    let stem = Path::new(file_name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    slugify(&stem)
}

/// `photo.jpg` -> `photo-1a2b3c4d.jpg`
fn randomized_name(file_name: &str) -> String {
    let path = Path::new(file_name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    match path.extension() {
        Some(ext) => format!("{}-{}.{}", stem, &suffix[..8], ext.to_string_lossy()),
        None => format!("{}-{}", stem, &suffix[..8]),
    }
}

/// Replicates attachments to target sites under one policy
pub struct AttachmentReplicator<'p, P: ?Sized> {
    store: &'p P,
    policy: ReplicationPolicy,
}

impl<'p, P: AttachmentStore + ?Sized> AttachmentReplicator<'p, P> {
    pub fn new(store: &'p P, policy: ReplicationPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> ReplicationPolicy {
        self.policy
    }

    /// Replicate `attachment` to `target`, attached to `parent` when given
    pub fn replicate(
        &self,
        attachment: &AttachmentDescriptor,
        target: SiteId,
        parent: Option<ItemId>,
    ) -> Result<Replicated> {
        let file_name = attachment.file_name();
        let slug = if attachment.slug.is_empty() {
            derive_slug(&file_name)
        } else {
            attachment.slug.clone()
        };

        match self.policy {
            ReplicationPolicy::Use => {
                if let Some(existing) = self.store.find_by_slug(target, &slug)? {
                    tracing::debug!(target, slug = %slug, id = existing.id, "reusing attachment");
                    return Ok(Replicated {
                        id: existing.id,
                        url: existing.url,
                        reused: true,
                    });
                }
            }
            ReplicationPolicy::Overwrite => {
                if let Some(existing) = self.store.find_by_slug(target, &slug)? {
                    tracing::debug!(
                        target,
                        slug = %slug,
                        id = existing.id,
                        "overwriting attachment"
                    );
                    self.store.delete_attachment(target, existing.id)?;
                }
            }
            ReplicationPolicy::Randomize => {}
        }

        let (file_name, slug) = match self.policy {
            ReplicationPolicy::Randomize => {
                let name = randomized_name(&file_name);
                let slug = derive_slug(&name);
                (name, slug)
            }
            _ => (file_name, slug),
        };

        let source = self.store.source_path(attachment);
        if !source.is_file() {
            return Err(BroadcastError::AttachmentSource {
                path: source,
                reason: "file does not exist".into(),
            });
        }
        let target_path = self.store.upload_path(target, &file_name);
        self.store
            .copy_binary(&source, &target_path)
            .map_err(|e| BroadcastError::AttachmentSource {
                path: source.clone(),
                reason: e.to_string(),
            })?;
        let metadata = self.store.generate_metadata(target, &target_path)?;

        let mut meta = attachment.meta.clone();
        for (key, values) in meta.iter_mut() {
            if !meta_keys::is_path_dependent(key) {
                continue;
            }
            *values = if key == meta_keys::ATTACHED_FILE {
                vec![metadata.file.clone()]
            } else {
                vec![serde_json::to_string(&metadata)?]
            };
        }

        let copy = AttachmentDescriptor {
            id: 0,
            site: target,
            parent,
            title: attachment.title.clone(),
            slug,
            file: PathBuf::from(&metadata.file),
            url: String::new(),
            mime_type: attachment.mime_type.clone(),
            metadata,
            meta,
            attached: parent.is_some(),
        };
        let id = self.store.insert_attachment(target, &copy)?;
        let url = self
            .store
            .get_attachment(target, id)?
            .map(|a| a.url)
            .unwrap_or_default();
        tracing::debug!(target, id, file = %copy.file.display(), "copied attachment");

        Ok(Replicated {
            id,
            url,
            reused: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalPlatform;
    use crate::types::MetaMap;
    use std::fs;
    use tempfile::TempDir;

    fn setup(policy_file: &str) -> (TempDir, LocalPlatform, AttachmentDescriptor) {
        let tmp = TempDir::new().unwrap();
        let platform = LocalPlatform::new(tmp.path().join("uploads"));
        platform.add_site(1);
        platform.add_site(2);
        let mut meta = MetaMap::new();
        meta.insert("credit".into(), vec!["Jane".into()]);
        meta.insert(meta_keys::ATTACHED_FILE.into(), vec!["stale/path.png".into()]);
        let id = platform
            .add_attachment_file(1, None, policy_file, b"not really a png", meta)
            .unwrap();
        let attachment = platform.get_attachment(1, id).unwrap().unwrap();
        (tmp, platform, attachment)
    }

    #[test]
    fn test_derive_slug() {
        assert_eq!(derive_slug("Summer Photo.JPG"), "summer-photo");
        assert_eq!(derive_slug("archive.tar.gz"), "archive-tar");
        assert_eq!(derive_slug("README"), "readme");
    }

    #[test]
    fn test_randomized_name_keeps_extension() {
        let name = randomized_name("photo.jpg");
        assert!(name.starts_with("photo-"));
        assert!(name.ends_with(".jpg"));
        assert_eq!(name.len(), "photo-12345678.jpg".len());
        assert_ne!(randomized_name("photo.jpg"), name);
    }

    #[test]
    fn test_copy_rewrites_path_dependent_fields() {
        let (_tmp, platform, attachment) = setup("photo.png");
        let replicator = AttachmentReplicator::new(&platform, ReplicationPolicy::Use);
        let copied = replicator.replicate(&attachment, 2, Some(7)).unwrap();
        assert!(!copied.reused);

        let on_target = platform.get_attachment(2, copied.id).unwrap().unwrap();
        assert_eq!(on_target.slug, "photo");
        assert_eq!(on_target.parent, Some(7));
        assert!(on_target.attached);
        assert_eq!(on_target.meta["credit"], vec!["Jane"]);
        assert_eq!(on_target.meta[meta_keys::ATTACHED_FILE], vec!["photo.png"]);
        assert_eq!(on_target.metadata.size, 16);
        assert_eq!(on_target.metadata.sha256, attachment.metadata.sha256);
        assert_eq!(copied.url, on_target.url);
        let bytes = fs::read(platform.source_path(&on_target)).unwrap();
        assert_eq!(bytes, b"not really a png");
    }

    #[test]
    fn test_use_policy_reuses_same_slug() {
        let (_tmp, platform, attachment) = setup("photo.png");
        let replicator = AttachmentReplicator::new(&platform, ReplicationPolicy::Use);
        let first = replicator.replicate(&attachment, 2, None).unwrap();
        let second = replicator.replicate(&attachment, 2, None).unwrap();
        assert!(second.reused);
        assert_eq!(first.id, second.id);
        assert_eq!(platform.attachments_on(2).len(), 1);
    }

    #[test]
    fn test_overwrite_policy_replaces_existing() {
        let (_tmp, platform, attachment) = setup("photo.png");
        let replicator = AttachmentReplicator::new(&platform, ReplicationPolicy::Overwrite);
        let first = replicator.replicate(&attachment, 2, None).unwrap();
        let second = replicator.replicate(&attachment, 2, None).unwrap();
        assert_ne!(first.id, second.id);
        assert!(platform.get_attachment(2, first.id).unwrap().is_none());
        assert_eq!(platform.attachments_on(2).len(), 1);
    }

    #[test]
    fn test_randomize_policy_never_collides() {
        let (_tmp, platform, attachment) = setup("photo.png");
        let replicator = AttachmentReplicator::new(&platform, ReplicationPolicy::Randomize);
        let first = replicator.replicate(&attachment, 2, None).unwrap();
        let second = replicator.replicate(&attachment, 2, None).unwrap();
        assert_ne!(first.id, second.id);
        let a = platform.get_attachment(2, first.id).unwrap().unwrap();
        let b = platform.get_attachment(2, second.id).unwrap().unwrap();
        assert_ne!(a.file, b.file);
        assert_ne!(a.slug, b.slug);
        assert!(a.slug.starts_with("photo-"));
    }

    #[test]
    fn test_missing_source_file_is_reported() {
        let (_tmp, platform, attachment) = setup("photo.png");
        fs::remove_file(platform.source_path(&attachment)).unwrap();
        let replicator = AttachmentReplicator::new(&platform, ReplicationPolicy::Use);
        let err = replicator.replicate(&attachment, 2, None).unwrap_err();
        assert!(matches!(err, BroadcastError::AttachmentSource { .. }));
        assert!(platform.attachments_on(2).is_empty());
    }

    #[test]
    fn test_policy_serde() {
        let p: ReplicationPolicy = serde_json::from_str("\"overwrite\"").unwrap();
        assert_eq!(p, ReplicationPolicy::Overwrite);
        assert_eq!(ReplicationPolicy::Randomize.to_string(), "randomize");
    }
}
