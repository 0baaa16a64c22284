//! Vnode pools: a Mom may declare membership in a pool (`vnode_pool` >
//! 0), with exactly one Mom per pool acting as the *inventory reporter*
//! whose topology report the others echo, in the style of
//! `vnode_pool_mom_list` and the reporter-handoff logic run when a Mom
//! goes down.

use std::collections::HashMap;

use crate::ids::Handle;
use crate::node::mom::MomRecord;

/// This vnode's membership in a pool: which pool, and whether its parent
/// Mom is currently the one designated to report inventory for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolMembership {
    pub pool_id: u32,
    pub is_reporter: bool,
}

/// The registry of pools: for each `vnode_pool` id, the ordered list of
/// member Moms and which one currently holds the inventory-reporter
/// role. Mirrors `vnode_pool_mom_list` but keyed by pool id rather than
/// threaded through a raw linked list.
#[derive(Debug, Default)]
pub struct VnodePoolRegistry {
    pools: HashMap<u32, Vec<Handle<MomRecord>>>,
    reporters: HashMap<u32, Handle<MomRecord>>,
}

impl VnodePoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join `mom` to `pool_id`. The first Mom to join a given pool
    /// becomes its inventory reporter automatically; later joiners are
    /// plain members. Returns whether `mom` became the reporter.
    pub fn join(&mut self, pool_id: u32, mom: Handle<MomRecord>) -> bool {
        let members = self.pools.entry(pool_id).or_default();
        if !members.contains(&mom) {
            members.push(mom);
        }
        self.reporters.entry(pool_id).or_insert(mom);
        self.reporters.get(&pool_id) == Some(&mom)
    }

    pub fn is_reporter(&self, pool_id: u32, mom: Handle<MomRecord>) -> bool {
        self.reporters.get(&pool_id) == Some(&mom)
    }

    pub fn members(&self, pool_id: u32) -> &[Handle<MomRecord>] {
        self.pools.get(&pool_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Handle a Mom going down: if it was the pool's inventory reporter,
    /// hand the role to the next surviving member (list order), or clear
    /// the pool entirely if it was the last member. Returns the new
    /// reporter, if any.
    pub fn on_mom_down(&mut self, pool_id: u32, down_mom: Handle<MomRecord>) -> Option<Handle<MomRecord>> {
        if let Some(members) = self.pools.get_mut(&pool_id) {
            members.retain(|&m| m != down_mom);
        }
        let was_reporter = self.reporters.get(&pool_id) == Some(&down_mom);
        if !was_reporter {
            return self.reporters.get(&pool_id).copied();
        }
        let next = self.pools.get(&pool_id).and_then(|m| m.first().copied());
        match next {
            Some(new_reporter) => {
                self.reporters.insert(pool_id, new_reporter);
                Some(new_reporter)
            }
            None => {
                self.reporters.remove(&pool_id);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::Arena;

    fn mom_handles(n: usize) -> Vec<Handle<MomRecord>> {
        let mut arena: Arena<MomRecord> = Arena::new();
        (0..n)
            .map(|i| arena.insert(MomRecord::new(format!("mom{i}"), 15002)))
            .collect()
    }

    #[test]
    fn first_joiner_becomes_reporter() {
        let moms = mom_handles(2);
        let mut registry = VnodePoolRegistry::new();
        assert!(registry.join(1, moms[0]));
        assert!(!registry.join(1, moms[1]));
        assert!(registry.is_reporter(1, moms[0]));
    }

    #[test]
    fn reporter_handoff_on_mom_down() {
        let moms = mom_handles(3);
        let mut registry = VnodePoolRegistry::new();
        for m in &moms {
            registry.join(1, *m);
        }
        assert!(registry.is_reporter(1, moms[0]));

        let new_reporter = registry.on_mom_down(1, moms[0]);
        assert_eq!(new_reporter, Some(moms[1]));
        assert!(registry.is_reporter(1, moms[1]));
    }

    #[test]
    fn last_member_leaving_clears_reporter() {
        let moms = mom_handles(1);
        let mut registry = VnodePoolRegistry::new();
        registry.join(1, moms[0]);
        let new_reporter = registry.on_mom_down(1, moms[0]);
        assert_eq!(new_reporter, None);
    }

    #[test]
    fn non_reporter_going_down_does_not_change_reporter() {
        let moms = mom_handles(2);
        let mut registry = VnodePoolRegistry::new();
        registry.join(1, moms[0]);
        registry.join(1, moms[1]);
        let reporter = registry.on_mom_down(1, moms[1]);
        assert_eq!(reporter, Some(moms[0]));
    }
}
