//! The two-pass validate/commit algorithm guarding a vnode resource's
//! INDIRECT flag, in the style of `fix_indirect_resc`. Split into a pure
//! validation pass that never mutates either node, and a commit pass run
//! only after validation succeeds: a caller must never commit on a
//! validation failure.

use std::collections::HashSet;

use crate::attribute::{ResourceValue, SetOp};
use crate::error::{AttrError, CoreError, Result as CoreResult};
use crate::ids::Handle;
use crate::store::EntityTable;

use super::Node;

/// The validated target of a prospective INDIRECT resource, distinguishing
/// a normally-resolved peer vnode from the one case where a missing
/// target is tolerated: the server recovering its state from disk, where
/// peer vnodes may not have reconnected and re-registered yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidatedTarget {
    Resolved(Handle<Node>),
    DeferredRecovery,
}

/// Validation pass: refuse a set of `source.resources_available[resource]
/// = @target_name` that would violate any of the four indirect-resource
/// guards. Mutates nothing.
pub fn validate_set_indirect(
    nodes: &EntityTable<Node>,
    source: Handle<Node>,
    resource: &str,
    target_name: &str,
    server_in_recov: bool,
) -> CoreResult<ValidatedTarget> {
    let source_node = nodes
        .get(source)
        .ok_or_else(|| CoreError::not_found("indirect source node handle"))?;

    if source_node.name == target_name {
        return Err(AttrError::IndirectHop {
            reason: format!("vnode '{target_name}' cannot point at itself"),
        }
        .into());
    }

    // (a) refuse if the vnode currently has running subnodes.
    if source_node.subnodes.iter().any(|sn| sn.in_use) {
        return Err(CoreError::bad_state(format!(
            "vnode '{}' has running subnodes; cannot mark resource '{}' indirect",
            source_node.name, resource
        )));
    }

    // (d) refuse if the source vnode is already a TARGET of someone
    // else: no chaining.
    if !source_node.targeted_resources.is_empty() {
        return Err(AttrError::IndirectHop {
            reason: format!(
                "vnode '{}' is itself a TARGET of another indirect resource; indirection depth is exactly one",
                source_node.name
            ),
        }
        .into());
    }

    let target_handle = match nodes.find_by_name(target_name) {
        Some(handle) => handle,
        // (b) refuse if the pointed-to vnode doesn't exist, unless the
        // server is recovering (target may simply not have reconnected
        // and re-registered its vnodes yet).
        None if server_in_recov => return Ok(ValidatedTarget::DeferredRecovery),
        None => {
            return Err(AttrError::IndirectHop {
                reason: format!("target vnode '{target_name}' does not exist"),
            }
            .into())
        }
    };

    let target_node = nodes
        .get(target_handle)
        .expect("handle just resolved from find_by_name");

    // (c) refuse if the target resource is itself INDIRECT or missing.
    match target_node.resources_available.get(resource) {
        None => {
            return Err(AttrError::IndirectHop {
                reason: format!(
                    "target vnode '{target_name}' has no resource '{resource}' to point at"
                ),
            }
            .into())
        }
        Some(ResourceValue::Indirect(_)) => {
            return Err(AttrError::IndirectHop {
                reason: format!(
                    "target vnode '{target_name}' resource '{resource}' is itself indirect; indirection depth is exactly one"
                ),
            }
            .into())
        }
        Some(_) => {}
    }

    Ok(ValidatedTarget::Resolved(target_handle))
}

/// Commit pass: may only be called with the exact `ValidatedTarget` a
/// preceding `validate_set_indirect` call returned for the same
/// `(source, resource, target_name)` triple. Points `source`'s resource
/// at `target_name` and, when resolved, marks the target's TARGET flag.
/// For a consumable resource the INDIRECT flag is also mirrored into
/// `resources_assigned` so accounting walks the target rather than the
/// source.
pub fn commit_set_indirect(
    nodes: &mut EntityTable<Node>,
    source: Handle<Node>,
    resource: &str,
    target_name: &str,
    validated: ValidatedTarget,
    consumable: bool,
) -> CoreResult<()> {
    {
        let source_node = nodes
            .get_mut(source)
            .ok_or_else(|| CoreError::not_found("indirect source node handle"))?;
        source_node
            .resources_available
            .set_or_merge(resource, &format!("@{target_name}"), SetOp::Set)?;
        if consumable {
            source_node
                .resources_assigned
                .set_or_merge(resource, &format!("@{target_name}"), SetOp::Set)?;
        }
    }
    if let ValidatedTarget::Resolved(target_handle) = validated {
        let target_node = nodes
            .get_mut(target_handle)
            .ok_or_else(|| CoreError::not_found("indirect target node handle"))?;
        target_node.targeted_resources.insert(resource.to_owned());
    }
    Ok(())
}

/// Unset a previously-committed INDIRECT resource: clears the source's
/// entry, clears the target's TARGET flag, and reports that a background
/// re-check task should be scheduled to walk all vnodes and re-establish
/// any TARGET flags that might have been erroneously cleared by a
/// concurrent unset racing this one.
pub fn unset_indirect(nodes: &mut EntityTable<Node>, source: Handle<Node>, resource: &str) -> CoreResult<bool> {
    let target_name = {
        let source_node = nodes
            .get_mut(source)
            .ok_or_else(|| CoreError::not_found("indirect source node handle"))?;
        match source_node.resources_available.remove(resource) {
            Some(ResourceValue::Indirect(target)) => target,
            Some(other) => {
                // Not actually indirect; put it back and report no-op.
                source_node.resources_available.set_or_merge(
                    resource,
                    &other_as_raw(&other),
                    SetOp::Set,
                )?;
                return Ok(false);
            }
            None => return Ok(false),
        }
    };
    source_node_clear_assigned(nodes, source, resource)?;

    if let Some(target_handle) = nodes.find_by_name(&target_name) {
        if let Some(target_node) = nodes.get_mut(target_handle) {
            target_node.targeted_resources.remove(resource);
        }
    }
    Ok(true)
}

fn source_node_clear_assigned(nodes: &mut EntityTable<Node>, source: Handle<Node>, resource: &str) -> CoreResult<()> {
    if let Some(source_node) = nodes.get_mut(source) {
        if matches!(
            source_node.resources_assigned.get(resource),
            Some(ResourceValue::Indirect(_))
        ) {
            source_node.resources_assigned.remove(resource);
        }
    }
    Ok(())
}

fn other_as_raw(value: &ResourceValue) -> String {
    match value {
        ResourceValue::Long(v) => v.to_string(),
        ResourceValue::Size(v) => v.to_string(),
        ResourceValue::Str(v) => v.clone(),
        ResourceValue::Bool(v) => v.to_string(),
        ResourceValue::Indirect(v) => format!("@{v}"),
    }
}

/// Background re-check task: walk every vnode's
/// `resources_available` and rebuild the `targeted_resources` sets from
/// scratch off the currently-committed INDIRECT entries. Idempotent and
/// safe to run any time; used after an unset to repair any TARGET flag a
/// racing unset might have cleared incorrectly.
pub fn rebuild_target_flags(nodes: &mut EntityTable<Node>) {
    let mut targets: std::collections::HashMap<Handle<Node>, HashSet<String>> =
        std::collections::HashMap::new();
    let mut edges = Vec::new();
    for (handle, node) in nodes.iter() {
        for (name, value) in node.resources_available.iter() {
            if let ResourceValue::Indirect(target_name) = value {
                edges.push((name.clone(), target_name.clone()));
                let _ = handle;
            }
        }
    }
    for (resource, target_name) in edges {
        if let Some(target_handle) = nodes.find_by_name(&target_name) {
            targets.entry(target_handle).or_default().insert(resource);
        }
    }
    for (handle, node) in nodes.iter_mut() {
        node.targeted_resources = targets.remove(&handle).unwrap_or_default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::SetOp;
    use crate::ids::Arena;
    use crate::node::mom::MomRecord;
    use crate::node::{initialize_pbsnode, NodeType, PoolRole};

    fn mom_handle() -> Handle<MomRecord> {
        let mut arena: Arena<MomRecord> = Arena::new();
        arena.insert(MomRecord::new("dummy", 15002))
    }

    fn make_table() -> (EntityTable<Node>, Handle<Node>, Handle<Node>) {
        let mut table: EntityTable<Node> = EntityTable::new();
        let mom = mom_handle();
        let mut a = initialize_pbsnode("A", mom, NodeType::Cluster, PoolRole::Member);
        a.resources_available.set_or_merge("foo", "10", SetOp::Set).unwrap();
        let b = initialize_pbsnode("B", mom, NodeType::Cluster, PoolRole::Member);
        let a_handle = table.insert(a);
        let b_handle = table.insert(b);
        (table, a_handle, b_handle)
    }

    #[test]
    fn validate_and_commit_marks_target_flag() {
        let (mut table, a, b) = make_table();
        let validated = validate_set_indirect(&table, b, "foo", "A", false).unwrap();
        assert_eq!(validated, ValidatedTarget::Resolved(a));
        commit_set_indirect(&mut table, b, "foo", "A", validated, false).unwrap();
        assert!(table.get(a).unwrap().targeted_resources.contains("foo"));
        assert_eq!(
            table.get(b).unwrap().resources_available.get("foo"),
            Some(&ResourceValue::Indirect("A".to_owned()))
        );
    }

    #[test]
    fn chaining_is_rejected() {
        let (mut table, a, b) = make_table();
        let validated = validate_set_indirect(&table, b, "foo", "A", false).unwrap();
        commit_set_indirect(&mut table, b, "foo", "A", validated, false).unwrap();

        // A third vnode trying to point at A (already a TARGET) is fine;
        // but A itself trying to point elsewhere, now that it's a TARGET,
        // must be rejected.
        let mut c = initialize_pbsnode("C", mom_handle(), NodeType::Cluster, PoolRole::Member);
        c.resources_available.set_or_merge("foo", "1", SetOp::Set).unwrap();
        table.insert(c);

        let err = validate_set_indirect(&table, a, "foo", "C", false);
        assert!(err.is_err());
    }

    #[test]
    fn double_indirect_target_rejected() {
        let (mut table, a, b) = make_table();
        let validated = validate_set_indirect(&table, b, "foo", "A", false).unwrap();
        commit_set_indirect(&mut table, b, "foo", "A", validated, false).unwrap();

        let mut c = initialize_pbsnode("C", mom_handle(), NodeType::Cluster, PoolRole::Member);
        c.resources_available.set_or_merge("foo", "1", SetOp::Set).unwrap();
        table.insert(c);

        // C -> B is rejected because B's "foo" is itself indirect.
        let err = validate_set_indirect(&table, mom_target_handle(&table, "C"), "foo", "B", false);
        assert!(err.is_err());
    }

    fn mom_target_handle(table: &EntityTable<Node>, name: &str) -> Handle<Node> {
        table.find_by_name(name).unwrap()
    }

    #[test]
    fn missing_target_tolerated_only_during_recovery() {
        let (table, _a, b) = make_table();
        let err = validate_set_indirect(&table, b, "foo", "ghost", false);
        assert!(err.is_err());
        let deferred = validate_set_indirect(&table, b, "foo", "ghost", true).unwrap();
        assert_eq!(deferred, ValidatedTarget::DeferredRecovery);
    }

    #[test]
    fn unset_clears_target_flag_and_requests_recheck() {
        let (mut table, a, b) = make_table();
        let validated = validate_set_indirect(&table, b, "foo", "A", false).unwrap();
        commit_set_indirect(&mut table, b, "foo", "A", validated, false).unwrap();

        let needs_recheck = unset_indirect(&mut table, b, "foo").unwrap();
        assert!(needs_recheck);
        assert!(!table.get(a).unwrap().targeted_resources.contains("foo"));
        assert_eq!(table.get(b).unwrap().resources_available.get("foo"), None);
    }

    #[test]
    fn rebuild_target_flags_repairs_after_manual_clear() {
        let (mut table, a, b) = make_table();
        let validated = validate_set_indirect(&table, b, "foo", "A", false).unwrap();
        commit_set_indirect(&mut table, b, "foo", "A", validated, false).unwrap();
        table.get_mut(a).unwrap().targeted_resources.clear();
        assert!(!table.get(a).unwrap().targeted_resources.contains("foo"));

        rebuild_target_flags(&mut table);
        assert!(table.get(a).unwrap().targeted_resources.contains("foo"));
    }
}
