//! Site context and reentrancy control
//!
//! The host has one active site at a time. Every operation that touches a
//! target site enters it through a [`SiteScope`], which restores the
//! previous site when dropped, on every exit path.
//!
//! Creating or trashing an item on a target can fire the host's own save
//! and lifecycle events, which would call straight back into the engine.
//! [`BroadcastGuard`] is the depth counter that turns those nested calls
//! into no-ops.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::Result;
use crate::types::SiteId;

/// Switches the host's active site
pub trait SiteSwitcher {
    /// Site currently active
    fn current_site(&self) -> SiteId;

    /// Make `site` active, remembering the previous one
    fn switch_to(&self, site: SiteId) -> Result<()>;

    /// Return to the site that was active before the last `switch_to`
    fn restore(&self) -> Result<()>;
}

/// Scoped handle on an active site. Restores the previous site on drop.
pub struct SiteScope<'a, S: SiteSwitcher + ?Sized> {
    switcher: &'a S,
    site: SiteId,
}

impl<'a, S: SiteSwitcher + ?Sized> SiteScope<'a, S> {
    /// Switch to `site` for the lifetime of the returned scope
    pub fn enter(switcher: &'a S, site: SiteId) -> Result<Self> {
        switcher.switch_to(site)?;
        tracing::trace!(site, "entered site context");
        Ok(Self { switcher, site })
    }

    /// Site this scope holds active
    pub fn site(&self) -> SiteId {
        self.site
    }
}

impl<S: SiteSwitcher + ?Sized> Drop for SiteScope<'_, S> {
    fn drop(&mut self) {
        if let Err(e) = self.switcher.restore() {
            tracing::error!(site = self.site, "failed to restore site context: {}", e);
        }
    }
}

/// Depth counter guarding against recursive broadcast and cascade runs
#[derive(Debug, Clone, Default)]
pub struct BroadcastGuard {
    depth: Arc<AtomicUsize>,
}

impl BroadcastGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push one level. Returns `None` when a run is already in progress.
    pub fn enter(&self) -> Option<GuardToken> {
        self.depth
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| GuardToken {
                depth: Arc::clone(&self.depth),
            })
    }

    /// Whether a run is in progress
    pub fn is_active(&self) -> bool {
        self.depth() > 0
    }

    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }
}

/// Held for the duration of one run; pops the guard on drop
#[derive(Debug)]
pub struct GuardToken {
    depth: Arc<AtomicUsize>,
}

impl Drop for GuardToken {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BroadcastError;
    use std::sync::Mutex;

    struct StackSwitcher {
        stack: Mutex<Vec<SiteId>>,
    }

    impl StackSwitcher {
        fn new(home: SiteId) -> Self {
            Self {
                stack: Mutex::new(vec![home]),
            }
        }
    }

    impl SiteSwitcher for StackSwitcher {
        fn current_site(&self) -> SiteId {
            *self.stack.lock().unwrap().last().unwrap()
        }

        fn switch_to(&self, site: SiteId) -> Result<()> {
            if site == 99 {
                return Err(BroadcastError::SiteNotFound(site));
            }
            self.stack.lock().unwrap().push(site);
            Ok(())
        }

        fn restore(&self) -> Result<()> {
            let mut stack = self.stack.lock().unwrap();
            if stack.len() > 1 {
                stack.pop();
            }
            Ok(())
        }
    }

    fn fallible_work(switcher: &StackSwitcher, fail: bool) -> Result<()> {
        let scope = SiteScope::enter(switcher, 2)?;
        assert_eq!(switcher.current_site(), scope.site());
        if fail {
            return Err(BroadcastError::Store("boom".into()));
        }
        Ok(())
    }

    #[test]
    fn test_scope_restores_on_success_and_error() {
        let switcher = StackSwitcher::new(1);
        fallible_work(&switcher, false).unwrap();
        assert_eq!(switcher.current_site(), 1);
        assert!(fallible_work(&switcher, true).is_err());
        assert_eq!(switcher.current_site(), 1);
    }

    #[test]
    fn test_nested_scopes() {
        let switcher = StackSwitcher::new(1);
        {
            let _a = SiteScope::enter(&switcher, 2).unwrap();
            {
                let _b = SiteScope::enter(&switcher, 3).unwrap();
                assert_eq!(switcher.current_site(), 3);
            }
            assert_eq!(switcher.current_site(), 2);
        }
        assert_eq!(switcher.current_site(), 1);
    }

    #[test]
    fn test_failed_switch_does_not_restore() {
        let switcher = StackSwitcher::new(1);
        let _outer = SiteScope::enter(&switcher, 2).unwrap();
        assert!(SiteScope::enter(&switcher, 99).is_err());
        assert_eq!(switcher.current_site(), 2);
    }

    #[test]
    fn test_guard_rejects_nested_entry() {
        let guard = BroadcastGuard::new();
        assert!(!guard.is_active());
        let token = guard.enter().expect("first entry");
        assert!(guard.is_active());
        assert!(guard.clone().enter().is_none());
        drop(token);
        assert_eq!(guard.depth(), 0);
        assert!(guard.enter().is_some());
    }
}
