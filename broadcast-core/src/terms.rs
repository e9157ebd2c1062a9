//! Classification term synchronizer
//!
//! Term IDs are local to a site, so terms are matched across sites by
//! slug. Matching is unconditional: a target term with the same slug is
//! the same term, even if it sits in an unrelated part of the tree.
//!
//! A sync pass covers the wanted terms plus their ancestor chains. Matched
//! terms whose name, description or parent differ are updated. Unmatched
//! terms are created parent-first; every term is created at most once per
//! pass, so shared ancestors are not duplicated.

use lru::LruCache;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::num::NonZeroUsize;

use crate::error::Result;
use crate::platform::TermStore;
use crate::types::{SiteId, Term, TermId, TermUpdate};

/// Outcome of syncing one taxonomy to one target site
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TermSyncOutcome {
    /// Source term ID -> target term ID
    pub mapping: BTreeMap<TermId, TermId>,
    /// Target IDs of terms created during the pass, in creation order
    pub created: Vec<TermId>,
    /// Target IDs of existing terms that were updated
    pub updated: Vec<TermId>,
    /// Slugs that could not be resolved on the target
    pub missing: Vec<String>,
}

impl TermSyncOutcome {
    /// Target IDs for the given source IDs, dropping unresolved ones
    pub fn map_ids(&self, source_ids: &[TermId]) -> Vec<TermId> {
        source_ids
            .iter()
            .filter_map(|id| self.mapping.get(id).copied())
            .collect()
    }

    fn changed_tree(&self) -> bool {
        !self.created.is_empty() || !self.updated.is_empty()
    }
}

/// Syncs terms between sites, caching term listings per (site, taxonomy)
pub struct TermSynchronizer<'p, P: ?Sized> {
    store: &'p P,
    cache: LruCache<(SiteId, String), Vec<Term>>,
}

impl<'p, P: TermStore + ?Sized> TermSynchronizer<'p, P> {
    pub fn new(store: &'p P, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            store,
            cache: LruCache::new(capacity),
        }
    }

    /// All terms of `taxonomy` on `site`
    pub fn terms(&mut self, site: SiteId, taxonomy: &str) -> Result<Vec<Term>> {
        let key = (site, taxonomy.to_string());
        if let Some(terms) = self.cache.get(&key) {
            return Ok(terms.clone());
        }
        let terms = self.store.list_terms(site, taxonomy)?;
        self.cache.put(key, terms.clone());
        Ok(terms)
    }

    /// Forget the cached listing after the tree on `site` changed
    pub fn invalidate(&mut self, site: SiteId, taxonomy: &str) {
        self.cache.pop(&(site, taxonomy.to_string()));
        self.store.invalidate_term_cache(site, taxonomy);
    }

    /// Sync the `wanted` source terms (and their ancestors) to `target`.
    /// `source_terms` is the full source taxonomy, used to walk parents.
    pub fn sync(
        &mut self,
        taxonomy: &str,
        source_terms: &[Term],
        wanted: &[TermId],
        target: SiteId,
        create: bool,
    ) -> Result<TermSyncOutcome> {
        let source_by_id: HashMap<TermId, &Term> =
            source_terms.iter().map(|t| (t.id, t)).collect();
        let mut outcome = TermSyncOutcome::default();

        let scope = ancestor_closure(&source_by_id, wanted, &mut outcome.missing);

        let target_terms = self.terms(target, taxonomy)?;
        let target_by_slug: HashMap<&str, &Term> =
            target_terms.iter().map(|t| (t.slug.as_str(), t)).collect();

        let mut matched = Vec::new();
        for id in &scope {
            let source = source_by_id[id];
            if let Some(existing) = target_by_slug.get(source.slug.as_str()) {
                outcome.mapping.insert(source.id, existing.id);
                matched.push((source, *existing));
            }
        }

        if create {
            let mut pass = CreatePass {
                store: self.store,
                taxonomy,
                target,
                source_by_id: &source_by_id,
                in_progress: HashSet::new(),
                outcome: &mut outcome,
            };
            for id in &scope {
                pass.resolve(*id)?;
            }
        } else {
            for id in &scope {
                if !outcome.mapping.contains_key(id) {
                    outcome.missing.push(source_by_id[id].slug.clone());
                }
            }
        }

        for (source, existing) in matched {
            let parent = match source.parent {
                None => None,
                Some(p) => match outcome.mapping.get(&p) {
                    Some(mapped) => Some(*mapped),
                    // Parent not present on the target; leave it as it is
                    None => existing.parent,
                },
            };
            let wanted = TermUpdate {
                name: source.name.clone(),
                description: source.description.clone(),
                parent,
            };
            if wanted.name != existing.name
                || wanted.description != existing.description
                || wanted.parent != existing.parent
            {
                tracing::debug!(taxonomy, target, slug = %source.slug, "updating term");
                self.store.update_term(target, taxonomy, existing.id, &wanted)?;
                outcome.updated.push(existing.id);
            }
        }

        if outcome.changed_tree() {
            self.invalidate(target, taxonomy);
        }
        Ok(outcome)
    }
}

/// Wanted IDs plus every ancestor reachable through the source tree
fn ancestor_closure(
    source_by_id: &HashMap<TermId, &Term>,
    wanted: &[TermId],
    missing: &mut Vec<String>,
) -> BTreeSet<TermId> {
    let mut scope = BTreeSet::new();
    for &id in wanted {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let Some(term) = source_by_id.get(&current) else {
                tracing::warn!(term = current, "term missing from source taxonomy");
                missing.push(format!("#{}", current));
                break;
            };
            if !scope.insert(current) {
                break;
            }
            cursor = term.parent;
        }
    }
    scope
}

struct CreatePass<'a, P: ?Sized> {
    store: &'a P,
    taxonomy: &'a str,
    target: SiteId,
    source_by_id: &'a HashMap<TermId, &'a Term>,
    in_progress: HashSet<TermId>,
    outcome: &'a mut TermSyncOutcome,
}

impl<P: TermStore + ?Sized> CreatePass<'_, P> {
    /// Target ID for a source term, creating it and its ancestors as needed
    fn resolve(&mut self, id: TermId) -> Result<Option<TermId>> {
        if let Some(mapped) = self.outcome.mapping.get(&id) {
            return Ok(Some(*mapped));
        }
        let Some(source) = self.source_by_id.get(&id).copied() else {
            return Ok(None);
        };
        if !self.in_progress.insert(id) {
            tracing::warn!(slug = %source.slug, "term parent cycle; creating at root");
            return Ok(None);
        }

        let parent = match source.parent {
            Some(p) => self.resolve(p)?,
            None => None,
        };
        // A cycle may have resolved this term further down the recursion
        if let Some(mapped) = self.outcome.mapping.get(&id) {
            return Ok(Some(*mapped));
        }

        let new_term = Term {
            id: 0,
            slug: source.slug.clone(),
            name: source.name.clone(),
            description: source.description.clone(),
            parent,
        };
        let new_id = self.store.create_term(self.target, self.taxonomy, &new_term)?;
        tracing::debug!(
            taxonomy = self.taxonomy,
            target = self.target,
            slug = %source.slug,
            id = new_id,
            "created term"
        );
        self.outcome.mapping.insert(id, new_id);
        self.outcome.created.push(new_id);
        Ok(Some(new_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ItemId;
    use std::cell::{Cell, RefCell};

    /// Term store over a fixed set of sites, counting listings
    #[derive(Default)]
    struct FakeTerms {
        sites: RefCell<HashMap<SiteId, Vec<Term>>>,
        next_id: Cell<TermId>,
        listings: Cell<usize>,
    }

    impl FakeTerms {
        fn with(site: SiteId, terms: Vec<Term>) -> Self {
            let store = FakeTerms {
                next_id: Cell::new(1000),
                ..Default::default()
            };
            store.sites.borrow_mut().insert(site, terms);
            store
        }

        fn on(&self, site: SiteId) -> Vec<Term> {
            self.sites.borrow().get(&site).cloned().unwrap_or_default()
        }

        fn by_slug(&self, site: SiteId, slug: &str) -> Option<Term> {
            self.on(site).into_iter().find(|t| t.slug == slug)
        }
    }

    impl TermStore for FakeTerms {
        fn taxonomies_for(&self, _site: SiteId, _item_type: &str) -> Result<Vec<String>> {
            Ok(vec!["category".into()])
        }

        fn list_terms(&self, site: SiteId, _taxonomy: &str) -> Result<Vec<Term>> {
            self.listings.set(self.listings.get() + 1);
            Ok(self.on(site))
        }

        fn create_term(&self, site: SiteId, _taxonomy: &str, term: &Term) -> Result<TermId> {
            let id = self.next_id.get();
            self.next_id.set(id + 1);
            let mut created = term.clone();
            created.id = id;
            self.sites.borrow_mut().entry(site).or_default().push(created);
            Ok(id)
        }

        fn update_term(
            &self,
            site: SiteId,
            _taxonomy: &str,
            id: TermId,
            fields: &TermUpdate,
        ) -> Result<()> {
            let mut sites = self.sites.borrow_mut();
            let term = sites
                .get_mut(&site)
                .and_then(|terms| terms.iter_mut().find(|t| t.id == id))
                .expect("term exists");
            term.name = fields.name.clone();
            term.description = fields.description.clone();
            term.parent = fields.parent;
            Ok(())
        }

        fn assign_terms(&self, _: SiteId, _: ItemId, _: &str, _: &[TermId]) -> Result<()> {
            Ok(())
        }
    }

    fn chain() -> Vec<Term> {
        vec![
            Term::new(1, "root", "Root"),
            Term::new(2, "mid", "Mid").with_parent(1),
            Term::new(3, "leaf", "Leaf").with_parent(2),
        ]
    }

    #[test]
    fn test_creates_ancestor_chain_parent_first() {
        let store = FakeTerms::with(1, chain());
        let mut sync = TermSynchronizer::new(&store, 8);
        let source = sync.terms(1, "category").unwrap();

        let outcome = sync.sync("category", &source, &[3], 2, true).unwrap();

        let root = store.by_slug(2, "root").unwrap();
        let mid = store.by_slug(2, "mid").unwrap();
        let leaf = store.by_slug(2, "leaf").unwrap();
        assert_eq!(outcome.created, vec![root.id, mid.id, leaf.id]);
        assert_eq!(store.on(2).len(), 3);
        assert_eq!(root.parent, None);
        assert_eq!(mid.parent, Some(root.id));
        assert_eq!(leaf.parent, Some(mid.id));
        assert_eq!(outcome.map_ids(&[3]), vec![leaf.id]);
    }

    #[test]
    fn test_shared_ancestor_created_once() {
        let mut terms = chain();
        terms.push(Term::new(4, "sibling", "Sibling").with_parent(2));
        let store = FakeTerms::with(1, terms);
        let mut sync = TermSynchronizer::new(&store, 8);
        let source = sync.terms(1, "category").unwrap();

        let outcome = sync.sync("category", &source, &[3, 4], 2, true).unwrap();
        assert_eq!(outcome.created.len(), 4);
        let mid = store.by_slug(2, "mid").unwrap();
        assert_eq!(store.by_slug(2, "sibling").unwrap().parent, Some(mid.id));
        assert_eq!(store.by_slug(2, "leaf").unwrap().parent, Some(mid.id));
    }

    #[test]
    fn test_matches_by_slug_and_updates_changed_fields() {
        let store = FakeTerms::with(1, chain());
        store.sites.borrow_mut().insert(
            2,
            vec![
                Term::new(50, "root", "Root"),
                Term::new(51, "mid", "Old Name"),
            ],
        );
        let mut sync = TermSynchronizer::new(&store, 8);
        let source = sync.terms(1, "category").unwrap();

        let outcome = sync.sync("category", &source, &[3], 2, true).unwrap();
        assert_eq!(outcome.mapping[&1], 50);
        assert_eq!(outcome.mapping[&2], 51);
        assert_eq!(outcome.updated, vec![51]);
        let mid = store.by_slug(2, "mid").unwrap();
        assert_eq!(mid.name, "Mid");
        assert_eq!(mid.parent, Some(50));
        assert_eq!(store.by_slug(2, "leaf").unwrap().parent, Some(51));
    }

    #[test]
    fn test_unchanged_terms_are_not_updated() {
        let store = FakeTerms::with(1, vec![Term::new(1, "news", "News")]);
        store
            .sites
            .borrow_mut()
            .insert(2, vec![Term::new(9, "news", "News")]);
        let mut sync = TermSynchronizer::new(&store, 8);
        let source = sync.terms(1, "category").unwrap();
        let outcome = sync.sync("category", &source, &[1], 2, true).unwrap();
        assert!(outcome.updated.is_empty());
        assert!(outcome.created.is_empty());
        assert_eq!(outcome.map_ids(&[1]), vec![9]);
    }

    #[test]
    fn test_creation_disabled_reports_missing() {
        let store = FakeTerms::with(1, chain());
        let mut sync = TermSynchronizer::new(&store, 8);
        let source = sync.terms(1, "category").unwrap();
        let outcome = sync.sync("category", &source, &[3], 2, false).unwrap();
        assert!(outcome.mapping.is_empty());
        assert_eq!(outcome.missing.len(), 3);
        assert!(store.on(2).is_empty());
    }

    #[test]
    fn test_missing_ancestor_becomes_root() {
        let store = FakeTerms::with(1, vec![Term::new(3, "orphan", "Orphan").with_parent(77)]);
        let mut sync = TermSynchronizer::new(&store, 8);
        let source = sync.terms(1, "category").unwrap();
        let outcome = sync.sync("category", &source, &[3], 2, true).unwrap();
        assert_eq!(outcome.missing, vec!["#77"]);
        assert_eq!(store.by_slug(2, "orphan").unwrap().parent, None);
    }

    #[test]
    fn test_parent_cycle_terminates() {
        let store = FakeTerms::with(
            1,
            vec![
                Term::new(1, "a", "A").with_parent(2),
                Term::new(2, "b", "B").with_parent(1),
            ],
        );
        let mut sync = TermSynchronizer::new(&store, 8);
        let source = sync.terms(1, "category").unwrap();
        let outcome = sync.sync("category", &source, &[1], 2, true).unwrap();
        assert_eq!(outcome.created.len(), 2);
        assert_eq!(store.on(2).len(), 2);
    }

    #[test]
    fn test_cache_invalidated_after_creation() {
        let store = FakeTerms::with(1, chain());
        let mut sync = TermSynchronizer::new(&store, 8);
        let source = sync.terms(1, "category").unwrap();
        sync.terms(1, "category").unwrap();
        assert_eq!(store.listings.get(), 1);

        sync.sync("category", &source, &[3], 2, true).unwrap();
        let listings = store.listings.get();
        // Second pass sees the created terms and creates nothing
        let outcome = sync.sync("category", &source, &[3], 2, true).unwrap();
        assert_eq!(store.listings.get(), listings + 1);
        assert!(outcome.created.is_empty());
        assert_eq!(store.on(2).len(), 3);
    }
}
