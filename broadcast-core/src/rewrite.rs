//! Content rewriter
//!
//! After attachments are replicated, the item body still refers to the
//! origin's attachments. Two passes fix that, both keyed by the copied
//! attachments map:
//! 1. reference tokens: attachment URLs and `attachment-<id>` markers;
//! 2. gallery directives: the `ids` list of every `[gallery ...]` (or other
//!    configured directive) is mapped to target IDs. IDs without a mapping
//!    are dropped from the list.

use regex::{Captures, Regex};
use std::collections::BTreeMap;

use crate::error::Result;
use crate::types::ItemId;

/// One replicated attachment as seen by the rewriter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopiedAttachment {
    pub target_id: ItemId,
    pub source_url: String,
    pub target_url: String,
}

/// Origin attachment ID -> replicated attachment, for one target site
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopiedAttachments {
    entries: BTreeMap<ItemId, CopiedAttachment>,
}

impl CopiedAttachments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, source_id: ItemId, copied: CopiedAttachment) {
        self.entries.insert(source_id, copied);
    }

    /// Insert an ID-only mapping
    pub fn insert_id(&mut self, source_id: ItemId, target_id: ItemId) {
        self.insert(
            source_id,
            CopiedAttachment {
                target_id,
                source_url: String::new(),
                target_url: String::new(),
            },
        );
    }

    pub fn target_id(&self, source_id: ItemId) -> Option<ItemId> {
        self.entries.get(&source_id).map(|c| c.target_id)
    }

    pub fn contains(&self, source_id: ItemId) -> bool {
        self.entries.contains_key(&source_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ItemId, &CopiedAttachment)> {
        self.entries.iter().map(|(id, c)| (*id, c))
    }
}

/// Rewrites item bodies for a target site
#[derive(Debug, Clone)]
pub struct ContentRewriter {
    directive_re: Option<Regex>,
    ids_re: Regex,
    marker_re: Regex,
}

impl ContentRewriter {
    /// Build a rewriter recognising the given directive names
    pub fn new<S: AsRef<str>>(directives: &[S]) -> Result<Self> {
        let names: Vec<String> = directives
            .iter()
            .map(|d| regex::escape(d.as_ref()))
            .collect();
        let directive_re = if names.is_empty() {
            None
        } else {
            Some(Regex::new(&format!(r"\[(?:{})\b[^\]]*\]", names.join("|")))?)
        };
        Ok(Self {
            directive_re,
            ids_re: Regex::new(r#"\bids\s*=\s*["']([^"']*)["']"#)?,
            marker_re: Regex::new(r"\battachment-(\d+)\b")?,
        })
    }

    /// Attachment IDs referenced by gallery directives, in order, deduplicated
    pub fn gallery_ids(&self, body: &str) -> Vec<ItemId> {
        let mut ids = Vec::new();
        let Some(directive_re) = &self.directive_re else {
            return ids;
        };
        for directive in directive_re.find_iter(body) {
            for caps in self.ids_re.captures_iter(directive.as_str()) {
                for id in parse_ids(&caps[1]) {
                    if !ids.contains(&id) {
                        ids.push(id);
                    }
                }
            }
        }
        ids
    }

    /// Apply both rewrite passes
    pub fn rewrite(&self, body: &str, copied: &CopiedAttachments) -> String {
        let body = self.rewrite_references(body, copied);
        self.rewrite_galleries(&body, copied)
    }

    fn rewrite_references(&self, body: &str, copied: &CopiedAttachments) -> String {
        let mut urls: Vec<(&str, &str)> = copied
            .iter()
            .filter(|(_, c)| !c.source_url.is_empty() && !c.target_url.is_empty())
            .map(|(_, c)| (c.source_url.as_str(), c.target_url.as_str()))
            .collect();
        // Longest first, so a URL that prefixes another is not replaced inside it
        urls.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        let mut out = body.to_string();
        for (from, to) in urls {
            if from != to {
                out = out.replace(from, to);
            }
        }

        self.marker_re
            .replace_all(&out, |caps: &Captures| {
                let mapped = caps[1]
                    .parse::<ItemId>()
                    .ok()
                    .and_then(|id| copied.target_id(id));
                match mapped {
                    Some(id) => format!("attachment-{}", id),
                    None => caps[0].to_string(),
                }
            })
            .into_owned()
    }

    fn rewrite_galleries(&self, body: &str, copied: &CopiedAttachments) -> String {
        let Some(directive_re) = &self.directive_re else {
            return body.to_string();
        };
        directive_re
            .replace_all(body, |directive: &Captures| {
                self.ids_re
                    .replace_all(&directive[0], |caps: &Captures| {
                        let ids: Vec<String> = parse_ids(&caps[1])
                            .into_iter()
                            .filter_map(|id| copied.target_id(id))
                            .map(|id| id.to_string())
                            .collect();
                        format!("ids=\"{}\"", ids.join(","))
                    })
                    .into_owned()
            })
            .into_owned()
    }
}

fn parse_ids(list: &str) -> Vec<ItemId> {
    list.split(',')
        .filter_map(|s| s.trim().parse::<ItemId>().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rewriter() -> ContentRewriter {
        ContentRewriter::new(&["gallery"]).unwrap()
    }

    fn ids(pairs: &[(ItemId, ItemId)]) -> CopiedAttachments {
        let mut copied = CopiedAttachments::new();
        for (from, to) in pairs {
            copied.insert_id(*from, *to);
        }
        copied
    }

    #[test]
    fn test_gallery_drops_unmapped_ids() {
        let out = rewriter().rewrite(r#"[gallery ids="1,2,3"]"#, &ids(&[(1, 101), (2, 102)]));
        assert_eq!(out, r#"[gallery ids="101,102"]"#);
    }

    #[test]
    fn test_gallery_keeps_other_attributes_and_text() {
        let body = r#"Intro [gallery columns="2" ids="4, 5" size="large"] outro [gallery ids='5']"#;
        let out = rewriter().rewrite(body, &ids(&[(4, 40), (5, 50)]));
        assert_eq!(
            out,
            r#"Intro [gallery columns="2" ids="40,50" size="large"] outro [gallery ids="50"]"#
        );
    }

    #[test]
    fn test_gallery_with_nothing_mapped_is_emptied() {
        let out = rewriter().rewrite(r#"[gallery ids="8,9"]"#, &CopiedAttachments::new());
        assert_eq!(out, r#"[gallery ids=""]"#);
    }

    #[test]
    fn test_other_directives_untouched() {
        let body = r#"[galleryx ids="1"] [video ids="1"]"#;
        assert_eq!(rewriter().rewrite(body, &ids(&[(1, 2)])), body);
    }

    #[test]
    fn test_custom_directives() {
        let rw = ContentRewriter::new(&["gallery", "slideshow"]).unwrap();
        let out = rw.rewrite(r#"[slideshow ids="1"]"#, &ids(&[(1, 9)]));
        assert_eq!(out, r#"[slideshow ids="9"]"#);
        let none = ContentRewriter::new::<&str>(&[]).unwrap();
        assert!(none.gallery_ids(r#"[gallery ids="1"]"#).is_empty());
    }

    #[test]
    fn test_gallery_ids_extraction() {
        let body = r#"[gallery ids="3,1"] text [gallery ids="1,7,x"]"#;
        assert_eq!(rewriter().gallery_ids(body), vec![3, 1, 7]);
    }

    #[test]
    fn test_reference_tokens() {
        let mut copied = CopiedAttachments::new();
        copied.insert(
            12,
            CopiedAttachment {
                target_id: 77,
                source_url: "/sites/1/uploads/a.png".into(),
                target_url: "/sites/2/uploads/a.png".into(),
            },
        );
        let body = r#"<img src="/sites/1/uploads/a.png" class="attachment-12 attachment-120">"#;
        let out = rewriter().rewrite(body, &copied);
        assert_eq!(
            out,
            r#"<img src="/sites/2/uploads/a.png" class="attachment-77 attachment-120">"#
        );
    }

    #[test]
    fn test_prefix_urls_replaced_longest_first() {
        let mut copied = CopiedAttachments::new();
        copied.insert(
            1,
            CopiedAttachment {
                target_id: 10,
                source_url: "/u/a.png".into(),
                target_url: "/v/a.png".into(),
            },
        );
        copied.insert(
            2,
            CopiedAttachment {
                target_id: 20,
                source_url: "/u/a.png.webp".into(),
                target_url: "/w/b.webp".into(),
            },
        );
        let out = rewriter().rewrite("/u/a.png.webp /u/a.png", &copied);
        assert_eq!(out, "/w/b.webp /v/a.png");
    }
}
