//! Vnode lifecycle: the table of execution targets the scheduler draws
//! from. A `Node` is the unit the Server names and assigns jobs to; a
//! `Subnode` is one of its virtual-CPU slots, resized whenever the
//! reported `ncpus` changes.

pub mod indirect;
pub mod mom;
pub mod pool;

use std::collections::HashSet;
use std::sync::OnceLock;

use bitflags::bitflags;

use crate::attribute::{AttrArray, AttrDef, AttrDefFlags, AttrRegistry, AttrValue, ResourceList};
use crate::error::{CoreError, Result as CoreResult};
use crate::ids::Handle;
use crate::store::Named;

use mom::MomRecord;

/// The vnode's attribute table: additional per-vnode bookkeeping not
/// already carried as typed fields on [`Node`] (state, resource lists,
/// subnodes, ...).
pub fn node_registry() -> &'static AttrRegistry {
    static REGISTRY: OnceLock<AttrRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        AttrRegistry::builder()
            .attr(
                AttrDef::new("Priority", AttrDefFlags::MGRD | AttrDefFlags::MGWR | AttrDefFlags::OPRD),
                AttrValue::Long(0),
            )
            .attr(
                AttrDef::new("pbs_version", AttrDefFlags::USRD | AttrDefFlags::SVWR),
                AttrValue::Str(String::new()),
            )
            .attr(
                AttrDef::new("license", AttrDefFlags::MGRD | AttrDefFlags::SVWR),
                AttrValue::Str(String::new()),
            )
            .build()
    })
}

bitflags! {
    /// The `INUSE_*` bits on `nd_state`. Several are derived
    /// predicates rather than ever set directly (see `is_unavailable`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NodeState: u32 {
        const FREE           = 0;
        const OFFLINE        = 1 << 1;
        const DOWN           = 1 << 2;
        const DELETED        = 1 << 3;
        const JOB            = 1 << 4;
        const JOBEXCL        = 1 << 8;
        const BUSY           = 1 << 9;
        const BEING_PROVISIONED = 1 << 10;
        const UNRESOLVABLE   = 1 << 11;
        const PROVISIONING   = 1 << 12;
        const STALE          = 1 << 13;
        const RESERVE        = 1 << 14;
        const MARKEDDOWN     = 1 << 15;
        const UNKNOWN        = 1 << 16;
        const OFFLINE_BY_MOM = 1 << 17;
        const MAINTENANCE    = 1 << 18;
        const SLEEP          = 1 << 19;
    }
}

/// `VNODE_UNAVAILABLE`: the bit-OR a scheduler-facing availability check
/// tests against, exactly as `pbs_nodes.h` defines it.
const VNODE_UNAVAILABLE: NodeState = NodeState::STALE
    .union(NodeState::OFFLINE)
    .union(NodeState::DOWN)
    .union(NodeState::DELETED)
    .union(NodeState::UNKNOWN)
    .union(NodeState::UNRESOLVABLE)
    .union(NodeState::OFFLINE_BY_MOM)
    .union(NodeState::MAINTENANCE)
    .union(NodeState::SLEEP);

/// Which vendor/platform emitted the topology report this node's
/// subnode layout was derived from. Recorded so a later re-ingest of the
/// same format can be diffed cheaply rather than requiring a full
/// resource list re-derivation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyFormat {
    Hwloc,
    CrayV1,
    Windows,
}

/// One virtual CPU slot within a node. Resized to track `ncpus` in
/// `resources_available` whenever that resource changes.
#[derive(Debug, Clone)]
pub struct Subnode {
    pub index: u32,
    pub in_use: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    Cluster,
    Pbs,
    License,
}

/// The role a node plays with respect to its parent Mom: most nodes are
/// plain execution vnodes, but exactly one vnode per Mom is designated
/// to report the host's aggregate inventory (the "natural" vnode).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolRole {
    Member,
    InventoryReporter,
}

#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub mom: Handle<MomRecord>,
    pub ntype: NodeType,
    pub pool_role: PoolRole,
    pub state: NodeState,
    pub resources_available: ResourceList,
    pub resources_assigned: ResourceList,
    pub subnodes: Vec<Subnode>,
    pub queue: Option<String>,
    pub comment: Option<String>,
    pub topology: Option<TopologyFormat>,
    /// Resource names on *this* node currently carrying the TARGET flag
    /// because some other vnode's `resources_available` entry points at
    /// them INDIRECTly. A node with any entry here cannot itself become
    /// an INDIRECT source (no chaining).
    pub targeted_resources: HashSet<String>,
    /// `vnode_pool` membership and this node's role within it, if any.
    pub pool: Option<pool::PoolMembership>,
    /// Reservations currently occupying this vnode; the reverse of
    /// [`crate::reservation::Reservation::assigned_vnodes`], kept in sync
    /// by [`crate::reservation::bind_vnodes`]/[`crate::reservation::unbind_vnodes`].
    pub reservations: Vec<Handle<crate::reservation::Reservation>>,
    pub extra: AttrArray,
}

impl Named for Node {
    fn name(&self) -> &str {
        &self.name
    }
}

/// Count of free (not `in_use`) subnode slots, mirroring the
/// `nd_nsnfree` running counter.
impl Node {
    pub fn free_subnode_count(&self) -> usize {
        self.subnodes.iter().filter(|s| !s.in_use).count()
    }

    pub fn is_unavailable(&self) -> bool {
        self.state.intersects(VNODE_UNAVAILABLE)
    }

    pub fn set_state(&mut self, flags: NodeState) {
        self.state = flags;
    }

    /// Resize the subnode vector to `ncpus` entries, preserving
    /// in-use status on surviving indices and rejecting a shrink that
    /// would drop an in-use slot (`fix_indirect_resc`'s ncpus-change
    /// path refuses to free an occupied subnode).
    pub fn resize_subnodes(&mut self, ncpus: usize) -> CoreResult<()> {
        if ncpus < self.subnodes.len() {
            for sn in &self.subnodes[ncpus..] {
                if sn.in_use {
                    return Err(CoreError::bad_state(format!(
                        "cannot shrink node '{}' below {} subnodes: subnode {} is in use",
                        self.name, ncpus, sn.index
                    )));
                }
            }
        }
        self.subnodes.resize_with(ncpus, || Subnode {
            index: 0,
            in_use: false,
        });
        for (i, sn) in self.subnodes.iter_mut().enumerate() {
            sn.index = i as u32;
        }
        Ok(())
    }

    /// Claim `count` currently-free subnodes for a newly dispatched job,
    /// flipping their `in_use` bit (the per-subnode JOB bit).
    /// Refuses (leaving every subnode untouched) if fewer than `count`
    /// are free, so a caller never ends up with a partial assignment to
    /// roll back.
    pub fn mark_subnodes_in_use(&mut self, count: usize) -> CoreResult<()> {
        if self.free_subnode_count() < count {
            return Err(CoreError::transient(format!(
                "vnode '{}' has only {} free subnodes, {} requested",
                self.name,
                self.free_subnode_count(),
                count
            )));
        }
        let mut claimed = 0;
        for sn in self.subnodes.iter_mut() {
            if claimed == count {
                break;
            }
            if !sn.in_use {
                sn.in_use = true;
                claimed += 1;
            }
        }
        Ok(())
    }

    /// Release `count` in-use subnodes back to the free pool on obit or
    /// requeue. Releases the lowest-indexed in-use subnodes first; which
    /// physical subnode a job held is not tracked beyond the count, since
    /// subnodes are fungible virtual CPUs rather than individually
    /// addressable resources once assigned.
    pub fn release_subnodes_in_use(&mut self, count: usize) -> CoreResult<()> {
        let in_use = self.subnodes.iter().filter(|s| s.in_use).count();
        if in_use < count {
            return Err(CoreError::internal(format!(
                "vnode '{}' asked to release {} subnodes but only {} are in use",
                self.name, count, in_use
            )));
        }
        let mut released = 0;
        for sn in self.subnodes.iter_mut() {
            if released == count {
                break;
            }
            if sn.in_use {
                sn.in_use = false;
                released += 1;
            }
        }
        Ok(())
    }

    /// Parse a vendor topology report and derive `ncpus`/subnode count
    /// from it. Each format's report is a single line: a format tag
    /// followed by a `key=value` CPU count, matching the prefix
    /// conventions (`hwloc:`, `cray-v1:`, `win:`) the Mom's inventory
    /// report is tagged with on the wire.
    pub fn ingest_topology(&mut self, raw: &str) -> CoreResult<()> {
        let (format, rest) = if let Some(rest) = raw.strip_prefix("hwloc:") {
            (TopologyFormat::Hwloc, rest)
        } else if let Some(rest) = raw.strip_prefix("cray-v1:") {
            (TopologyFormat::CrayV1, rest)
        } else if let Some(rest) = raw.strip_prefix("win:") {
            (TopologyFormat::Windows, rest)
        } else {
            return Err(CoreError::protocol(format!(
                "unrecognized topology report prefix in '{raw}'"
            )));
        };

        let ncpus: usize = rest
            .strip_prefix("ncpus=")
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| CoreError::protocol(format!("malformed topology payload '{rest}'")))?;

        self.resize_subnodes(ncpus)?;
        self.resources_available
            .set_or_merge("ncpus", &ncpus.to_string(), crate::attribute::SetOp::Set)?;
        self.topology = Some(format);
        Ok(())
    }
}

/// Resources flagged `ANASSN`/`FNASSN` in the resource definition table:
/// consumables pre-linked into every vnode's `resources_assigned` at
/// creation, so the first job to land on a vnode debits an existing
/// entry rather than hitting the unknown-resource error path.
const CONSUMABLE_RESOURCES: &[(&str, AttrDefFlags)] = &[
    ("ncpus", AttrDefFlags::FNASSN),
    ("mem", AttrDefFlags::ANASSN),
];

/// Construct a freshly-created vnode, in the style of `initialize_pbsnode`:
/// starts DOWN and UNKNOWN until a Mom hello/inventory report clears
/// those bits, carries the `arch`/`mem`/`ncpus` baseline every vnode
/// reports regardless of platform, and pre-links every `ANASSN`/`FNASSN`
/// consumable into `resources_assigned` at zero.
pub fn initialize_pbsnode(
    name: impl Into<String>,
    mom: Handle<MomRecord>,
    ntype: NodeType,
    pool_role: PoolRole,
) -> Node {
    let mut resources_available = ResourceList::default();
    resources_available
        .set_or_merge("arch", "", crate::attribute::SetOp::Set)
        .expect("'arch' literal always parses");
    resources_available
        .set_or_merge("mem", "0b", crate::attribute::SetOp::Set)
        .expect("'mem' literal always parses");
    resources_available
        .set_or_merge("ncpus", "0", crate::attribute::SetOp::Set)
        .expect("'ncpus' literal always parses");

    let mut resources_assigned = ResourceList::default();
    for (resc_name, flags) in CONSUMABLE_RESOURCES {
        if flags.intersects(AttrDefFlags::ANASSN | AttrDefFlags::FNASSN) {
            resources_assigned
                .set_or_merge(resc_name, "0", crate::attribute::SetOp::Set)
                .expect("'0' literal always parses");
        }
    }

    Node {
        name: name.into(),
        mom,
        ntype,
        pool_role,
        state: NodeState::DOWN | NodeState::UNKNOWN,
        resources_available,
        resources_assigned,
        subnodes: Vec::new(),
        queue: None,
        comment: None,
        topology: None,
        targeted_resources: HashSet::new(),
        pool: None,
        reservations: Vec::new(),
        extra: AttrArray::for_registry(node_registry()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::Arena;

    fn dummy_mom_handle() -> Handle<MomRecord> {
        let mut arena: Arena<MomRecord> = Arena::new();
        arena.insert(MomRecord::new("dummy", 15002))
    }

    #[test]
    fn freshly_created_node_starts_down_and_unknown() {
        let node = initialize_pbsnode("n1", dummy_mom_handle(), NodeType::Cluster, PoolRole::Member);
        assert_eq!(node.state, NodeState::DOWN | NodeState::UNKNOWN);
        assert!(node.is_unavailable());
    }

    #[test]
    fn unavailable_true_when_down() {
        let mut node = initialize_pbsnode("n1", dummy_mom_handle(), NodeType::Cluster, PoolRole::Member);
        node.set_state(NodeState::FREE);
        assert!(!node.is_unavailable());
        node.set_state(NodeState::DOWN);
        assert!(node.is_unavailable());
    }

    #[test]
    fn creation_baseline_sets_arch_mem_ncpus_and_prelinks_consumables() {
        let node = initialize_pbsnode("n1", dummy_mom_handle(), NodeType::Cluster, PoolRole::Member);
        assert!(node.resources_available.get("arch").is_some());
        assert_eq!(
            node.resources_available.get("mem"),
            Some(&crate::attribute::ResourceValue::Size(0))
        );
        assert_eq!(
            node.resources_available.get("ncpus"),
            Some(&crate::attribute::ResourceValue::Long(0))
        );
        assert_eq!(
            node.resources_assigned.get("ncpus"),
            Some(&crate::attribute::ResourceValue::Long(0))
        );
        assert_eq!(
            node.resources_assigned.get("mem"),
            Some(&crate::attribute::ResourceValue::Size(0))
        );
    }

    #[test]
    fn resize_rejects_shrink_below_inuse_subnode() {
        let mut node = initialize_pbsnode("n1", dummy_mom_handle(), NodeType::Cluster, PoolRole::Member);
        node.resize_subnodes(4).unwrap();
        node.subnodes[3].in_use = true;
        assert!(node.resize_subnodes(2).is_err());
    }

    #[test]
    fn mark_then_release_subnodes_round_trips_free_count() {
        let mut node = initialize_pbsnode("n1", dummy_mom_handle(), NodeType::Cluster, PoolRole::Member);
        node.resize_subnodes(4).unwrap();
        assert_eq!(node.free_subnode_count(), 4);
        node.mark_subnodes_in_use(3).unwrap();
        assert_eq!(node.free_subnode_count(), 1);
        assert!(node.mark_subnodes_in_use(2).is_err());
        node.release_subnodes_in_use(3).unwrap();
        assert_eq!(node.free_subnode_count(), 4);
    }

    #[test]
    fn release_more_than_in_use_is_internal_error() {
        let mut node = initialize_pbsnode("n1", dummy_mom_handle(), NodeType::Cluster, PoolRole::Member);
        node.resize_subnodes(2).unwrap();
        node.mark_subnodes_in_use(1).unwrap();
        assert!(node.release_subnodes_in_use(2).is_err());
    }

    #[test]
    fn ingest_hwloc_topology_sets_ncpus_and_subnodes() {
        let mut node = initialize_pbsnode("n1", dummy_mom_handle(), NodeType::Cluster, PoolRole::Member);
        node.ingest_topology("hwloc:ncpus=8").unwrap();
        assert_eq!(node.subnodes.len(), 8);
        assert_eq!(
            node.resources_available.get("ncpus"),
            Some(&crate::attribute::ResourceValue::Long(8))
        );
    }
}
