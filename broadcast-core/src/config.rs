//! Engine configuration
//!
//! [`EngineConfig`] carries the deployment-wide settings (metadata pattern
//! lists, attachment policy, gallery directives) loaded from a TOML file.
//! [`BroadcastOptions`] is the per-run flag set.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::attachments::ReplicationPolicy;
use crate::error::{BroadcastError, Result};

/// Deployment-wide settings, stored as `broadcast.toml`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub meta: MetaConfig,
    pub attachments: AttachmentConfig,
    pub content: ContentConfig,
    pub terms: TermConfig,
}

/// Metadata pattern lists. Patterns are separated by whitespace or commas
/// and may use `*` and `?` wildcards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaConfig {
    pub blacklist: String,
    pub whitelist: String,
    pub protect: String,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            blacklist: "_edit_lock _edit_last".to_string(),
            whitelist: String::new(),
            protect: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttachmentConfig {
    /// What to do when an attachment with the same slug already exists
    pub policy: ReplicationPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentConfig {
    /// Embedded directives whose `ids` attribute lists attachment IDs
    pub gallery_directives: Vec<String>,
}

impl Default for ContentConfig {
    fn default() -> Self {
        Self {
            gallery_directives: vec!["gallery".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TermConfig {
    /// Number of (site, taxonomy) term listings kept during a run
    pub cache_capacity: usize,
}

impl Default for TermConfig {
    fn default() -> Self {
        Self { cache_capacity: 64 }
    }
}

impl EngineConfig {
    /// Load from a TOML file; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read_to_string(path)?;
        Self::from_toml(&data)
    }

    pub fn from_toml(data: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    /// Save as TOML (write to a temp file, then rename)
    pub fn save(&self, path: &Path) -> Result<()> {
        let data =
            toml::to_string_pretty(self).map_err(|e| BroadcastError::Config(e.to_string()))?;
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, data)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.terms.cache_capacity == 0 {
            return Err(BroadcastError::Config(
                "terms.cache_capacity must be at least 1".into(),
            ));
        }
        if let Some(bad) = self
            .content
            .gallery_directives
            .iter()
            .find(|d| !valid_directive(d))
        {
            return Err(BroadcastError::Config(format!(
                "invalid gallery directive name: {:?}",
                bad
            )));
        }
        Ok(())
    }
}

fn valid_directive(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Flags for one broadcast run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastOptions {
    /// Keep origin and copies linked in the registry
    pub link: bool,
    pub propagate_metadata: bool,
    pub propagate_classifications: bool,
    /// Create terms missing on a target (otherwise they are skipped)
    pub create_terms: bool,
    /// Broadcast draft and pending items
    pub allow_draft: bool,
    /// Broadcast items scheduled for the future
    pub allow_scheduled: bool,
    /// On an update, delete the child's attachments before copying fresh ones
    pub delete_child_attachments: bool,
    /// On an insert, adopt an unlinked item with the same name and type
    pub adopt_unlinked_siblings: bool,
}

impl Default for BroadcastOptions {
    fn default() -> Self {
        Self {
            link: true,
            propagate_metadata: true,
            propagate_classifications: true,
            create_terms: true,
            allow_draft: false,
            allow_scheduled: false,
            delete_child_attachments: true,
            adopt_unlinked_siblings: false,
        }
    }
}
