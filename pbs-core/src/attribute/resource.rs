//! Resource lists: the `name=value` bags carried by `Resource_List`,
//! `resources_available`, `resources_assigned`, and similar attributes.
//!
//! Two behaviors are load-bearing here and both come straight from the
//! original's `decode_resc`/`find_resc_entry` machinery:
//!
//! - A value of the form `@othervnode` is an INDIRECT reference: reads
//!   resolve it by following to `othervnode`'s own resource of the same
//!   name. Only one hop is allowed — an INDIRECT resource whose target is
//!   itself INDIRECT is rejected at set time, not silently chased.
//! - Combining (INCR/DECR) on an unknown resource name is an error; the
//!   resource must already exist in the list (typically seeded from
//!   `resources_available` at node creation) before it can be debited or
//!   credited.

use std::collections::BTreeMap;

use crate::attribute::SetOp;
use crate::error::{AttrError, Result as CoreResult};

/// A single resource's value: either a concrete scalar/string value or an
/// indirect pointer to another vnode's resource of the same name.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceValue {
    Long(i64),
    Size(u64),
    Str(String),
    Bool(bool),
    Indirect(String),
}

/// Parse a `kb`/`mb`/`gb`/`b`-suffixed size literal, the same suffix set
/// `crate::attribute::parse_size` accepts for the `size` attribute type.
/// Returns `None` for a bare integer so callers fall through to `Long`.
fn parse_size_suffix(s: &str) -> Option<u64> {
    let s = s.trim();
    let (digits, mult): (&str, u64) = if let Some(p) = s.strip_suffix("kb") {
        (p, 1024)
    } else if let Some(p) = s.strip_suffix("mb") {
        (p, 1024 * 1024)
    } else if let Some(p) = s.strip_suffix("gb") {
        (p, 1024 * 1024 * 1024)
    } else {
        return None;
    };
    digits.trim().parse::<u64>().ok().map(|n| n * mult)
}

impl ResourceValue {
    fn encode_to_string(&self) -> String {
        match self {
            ResourceValue::Long(v) => v.to_string(),
            ResourceValue::Size(v) => v.to_string(),
            ResourceValue::Str(v) => v.clone(),
            ResourceValue::Bool(v) => v.to_string(),
            ResourceValue::Indirect(target) => format!("@{target}"),
        }
    }

    fn parse(raw: &str) -> ResourceValue {
        if let Some(target) = raw.strip_prefix('@') {
            return ResourceValue::Indirect(target.to_owned());
        }
        if let Some(size) = parse_size_suffix(raw) {
            return ResourceValue::Size(size);
        }
        if let Ok(n) = raw.parse::<i64>() {
            return ResourceValue::Long(n);
        }
        if raw.eq_ignore_ascii_case("true") || raw.eq_ignore_ascii_case("false") {
            return ResourceValue::Bool(raw.eq_ignore_ascii_case("true"));
        }
        ResourceValue::Str(raw.to_owned())
    }

    fn combine(&self, delta: &ResourceValue, add: bool) -> CoreResult<ResourceValue> {
        match (self, delta) {
            (ResourceValue::Long(a), ResourceValue::Long(b)) => {
                Ok(ResourceValue::Long(if add { a + b } else { a - b }))
            }
            (ResourceValue::Size(a), ResourceValue::Size(b)) => Ok(ResourceValue::Size(if add {
                a + b
            } else {
                a.saturating_sub(*b)
            })),
            _ => Err(AttrError::NotAdditive {
                attr: "resource".to_owned(),
                op: if add { "INCR".into() } else { "DECR".into() },
            }
            .into()),
        }
    }
}

/// An ordered-by-name bag of resource entries. `BTreeMap` gives
/// deterministic iteration, which matters because encoded order is part
/// of what a status reply compares equal across cache rebuilds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceList {
    entries: BTreeMap<String, ResourceValue>,
}

impl ResourceList {
    pub fn get(&self, name: &str) -> Option<&ResourceValue> {
        self.entries.get(name)
    }

    /// Remove a resource entry entirely (the original's `free_resc_tag`
    /// via `decode_resc` given an empty value). Used when unsetting an
    /// INDIRECT resource rather than overwriting it with a concrete one.
    pub fn remove(&mut self, name: &str) -> Option<ResourceValue> {
        self.entries.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ResourceValue)> {
        self.entries.iter()
    }

    /// Resolve a (possibly INDIRECT) resource against the owning node's
    /// list plus a lookup for peer vnodes' lists. Enforces the one-hop
    /// rule: if the target resource is itself INDIRECT, resolution fails
    /// rather than chaining further.
    pub fn resolve<'a>(
        &'a self,
        name: &str,
        lookup_peer: impl FnOnce(&str) -> Option<&'a ResourceList>,
    ) -> CoreResult<Option<&'a ResourceValue>> {
        match self.entries.get(name) {
            Some(ResourceValue::Indirect(target)) => {
                let peer = lookup_peer(target).ok_or_else(|| AttrError::IndirectHop {
                    reason: format!("target vnode '{target}' not found"),
                })?;
                match peer.entries.get(name) {
                    Some(ResourceValue::Indirect(_)) => Err(AttrError::IndirectHop {
                        reason: format!(
                            "resource '{name}' on '{target}' is itself indirect; only one hop is permitted"
                        ),
                    }
                    .into()),
                    other => Ok(other),
                }
            }
            other => Ok(other),
        }
    }

    /// Set or accumulate the named resource from its raw wire form.
    pub fn set_or_merge(&mut self, name: &str, raw: &str, op: SetOp) -> CoreResult<()> {
        let parsed = ResourceValue::parse(raw);
        match op {
            SetOp::Set | SetOp::Internal => {
                self.entries.insert(name.to_owned(), parsed);
            }
            SetOp::Incr | SetOp::Decr => {
                let existing = self.entries.get(name).ok_or_else(|| AttrError::UnknownResource {
                    attr: "resource-list".to_owned(),
                    resource: name.to_owned(),
                })?;
                let combined = existing.combine(&parsed, matches!(op, SetOp::Incr))?;
                self.entries.insert(name.to_owned(), combined);
            }
        }
        Ok(())
    }

    /// Combine every entry of `other` into `self` (used by the generic
    /// attribute INCR/DECR path when the whole list is the operand, e.g.
    /// crediting `resources_assigned` back on job end).
    pub fn combine(&mut self, other: &ResourceList, add: bool) -> CoreResult<()> {
        for (name, delta) in &other.entries {
            match self.entries.get(name) {
                Some(existing) => {
                    let combined = existing.combine(delta, add)?;
                    self.entries.insert(name.clone(), combined);
                }
                None if add => {
                    self.entries.insert(name.clone(), delta.clone());
                }
                None => {
                    return Err(AttrError::UnknownResource {
                        attr: "resource-list".to_owned(),
                        resource: name.clone(),
                    }
                    .into())
                }
            }
        }
        Ok(())
    }

    pub fn encode_to_string(&self) -> String {
        self.entries
            .iter()
            .map(|(name, value)| format!("{name}={}", value.encode_to_string()))
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indirect_resolves_one_hop() {
        let mut other = ResourceList::default();
        other
            .set_or_merge("mem", "16gb", SetOp::Set)
            .unwrap();
        let mut this = ResourceList::default();
        this.set_or_merge("mem", "@othervnode", SetOp::Set).unwrap();

        let resolved = this.resolve("mem", |_| Some(&other)).unwrap();
        assert_eq!(resolved, Some(&ResourceValue::Size(16 * 1024 * 1024 * 1024)));
    }

    #[test]
    fn double_indirect_is_rejected() {
        let mut other = ResourceList::default();
        other
            .set_or_merge("mem", "@thirdvnode", SetOp::Set)
            .unwrap();
        let mut this = ResourceList::default();
        this.set_or_merge("mem", "@othervnode", SetOp::Set).unwrap();

        let err = this.resolve("mem", |_| Some(&other));
        assert!(err.is_err());
    }

    #[test]
    fn incr_on_unknown_resource_rejected() {
        let mut list = ResourceList::default();
        let err = list.set_or_merge("ncpus", "1", SetOp::Incr);
        assert!(err.is_err());
    }

    #[test]
    fn incr_accumulates_known_resource() {
        let mut list = ResourceList::default();
        list.set_or_merge("ncpus", "4", SetOp::Set).unwrap();
        list.set_or_merge("ncpus", "2", SetOp::Incr).unwrap();
        assert_eq!(list.get("ncpus"), Some(&ResourceValue::Long(6)));
    }
}
