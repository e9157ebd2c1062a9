//! Metadata filter pipeline
//!
//! Decides which metadata keys travel with a broadcast item:
//! - a key matching the blacklist is dropped, unless it also matches the
//!   whitelist;
//! - a key matching the protect list that already exists on the target is
//!   neither overwritten nor deleted;
//! - the representative image key is never copied verbatim. Its value is an
//!   attachment ID, which the orchestrator resolves through the copied
//!   attachments map.

use regex::RegexSet;
use std::collections::BTreeMap;

use crate::config::MetaConfig;
use crate::error::Result;
use crate::types::{MetaMap, meta_keys};

/// Ordered list of wildcard patterns (`*` any run, `?` one character)
#[derive(Debug, Clone)]
pub struct PatternList {
    patterns: Vec<String>,
    set: RegexSet,
}

impl PatternList {
    /// Parse a whitespace- or comma-separated pattern string
    pub fn parse(spec: &str) -> Result<Self> {
        let patterns: Vec<String> = spec
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect();
        let set = RegexSet::new(patterns.iter().map(|p| wildcard_to_regex(p)))?;
        Ok(Self { patterns, set })
    }

    pub fn empty() -> Self {
        Self {
            patterns: Vec::new(),
            set: RegexSet::empty(),
        }
    }

    pub fn matches(&self, key: &str) -> bool {
        self.set.is_match(key)
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

fn wildcard_to_regex(pattern: &str) -> String {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            c => re.push_str(&regex::escape(c.encode_utf8(&mut [0u8; 4]))),
        }
    }
    re.push('$');
    re
}

/// Changes to apply to a target item's metadata
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaPlan {
    /// Keys to write, with their new values
    pub set: MetaMap,
    /// Keys to delete from the target
    pub delete: Vec<String>,
    /// Keys left as they are because the protect list covers them
    pub protected: Vec<String>,
}

impl MetaPlan {
    pub fn is_noop(&self) -> bool {
        self.set.is_empty() && self.delete.is_empty()
    }
}

/// Stateless metadata classifier
#[derive(Debug, Clone)]
pub struct MetaFilter {
    blacklist: PatternList,
    whitelist: PatternList,
    protect: PatternList,
}

impl MetaFilter {
    pub fn new(blacklist: PatternList, whitelist: PatternList, protect: PatternList) -> Self {
        Self {
            blacklist,
            whitelist,
            protect,
        }
    }

    pub fn from_config(config: &MetaConfig) -> Result<Self> {
        Ok(Self::new(
            PatternList::parse(&config.blacklist)?,
            PatternList::parse(&config.whitelist)?,
            PatternList::parse(&config.protect)?,
        ))
    }

    /// Blacklisted and not carved out by the whitelist
    pub fn is_blocked(&self, key: &str) -> bool {
        self.blacklist.matches(key) && !self.whitelist.matches(key)
    }

    /// Excluded from generic copying, either blocked or a binding field
    pub fn is_excluded(&self, key: &str) -> bool {
        key == meta_keys::THUMBNAIL_ID || self.is_blocked(key)
    }

    pub fn is_protected(&self, key: &str) -> bool {
        self.protect.matches(key)
    }

    /// Keys that survive filtering, in input order
    pub fn filter<'a, I>(&self, keys: I) -> Vec<&'a str>
    where
        I: IntoIterator<Item = &'a str>,
    {
        keys.into_iter().filter(|k| !self.is_excluded(k)).collect()
    }

    /// Subset of `source` that survives filtering
    pub fn filter_map(&self, source: &MetaMap) -> MetaMap {
        source
            .iter()
            .filter(|(k, _)| !self.is_excluded(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect::<BTreeMap<_, _>>()
    }

    /// Compute the writes and deletes that bring `target` in line with
    /// `source`. Blocked keys already on the target belong to the target
    /// site and are left alone.
    pub fn plan(&self, source: &MetaMap, target: &MetaMap) -> MetaPlan {
        let mut plan = MetaPlan::default();

        for (key, values) in source {
            if self.is_excluded(key) {
                continue;
            }
            if target.contains_key(key) && self.is_protected(key) {
                plan.protected.push(key.clone());
                continue;
            }
            if target.get(key) != Some(values) {
                plan.set.insert(key.clone(), values.clone());
            }
        }

        for key in target.keys() {
            if source.contains_key(key) || self.is_excluded(key) {
                continue;
            }
            if self.is_protected(key) {
                plan.protected.push(key.clone());
            } else {
                plan.delete.push(key.clone());
            }
        }

        plan
    }
}

impl Default for MetaFilter {
    fn default() -> Self {
        Self::new(PatternList::empty(), PatternList::empty(), PatternList::empty())
    }
}
