//! Per-entity-kind attribute definition tables: the concrete
//! `JOB_ATR_*`/`ND_ATR_*`/... enum-and-parallel-`attribute_def[]` pair
//! spec.md §3 describes, minus the enum (a plain `usize` index into the
//! table already gives compile-time-checked iteration without needing a
//! hand-maintained enum to stay in sync with it).
//!
//! [`AttrRegistry`] is built once per entity kind at process startup and
//! shared (it is immutable after `build()`) between every instance of
//! that kind; [`AttrArray`](super::AttrArray) stores only the sparse
//! per-instance values, exactly as the original splits `attribute_def`
//! (static, parallel) from `attribute` (per-object).

use std::collections::HashMap;

use crate::error::{AttrError, Result as CoreResult};

use super::{AttrDef, AttrValue};

/// One entry: the static definition plus the type hint `decode_str`
/// needs when the attribute has never been set (an unset `Attribute`
/// carries no value to infer a type from).
struct RegistryEntry {
    def: AttrDef,
    type_hint: AttrValue,
}

/// A closed, ordered table of attribute definitions for one entity kind
/// (server, queue, job, reservation, or node). Index 0..len() lines up
/// 1:1 with that entity's `AttrArray` cells.
pub struct AttrRegistry {
    entries: Vec<RegistryEntry>,
    index_by_name: HashMap<&'static str, usize>,
}

impl AttrRegistry {
    pub fn builder() -> AttrRegistryBuilder {
        AttrRegistryBuilder { entries: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.index_by_name.get(name).copied()
    }

    pub fn name_of(&self, idx: usize) -> Option<&'static str> {
        self.entries.get(idx).map(|e| e.def.name)
    }

    pub fn def(&self, idx: usize) -> Option<&AttrDef> {
        self.entries.get(idx).map(|e| &e.def)
    }

    pub fn type_hint(&self, idx: usize) -> Option<&AttrValue> {
        self.entries.get(idx).map(|e| &e.type_hint)
    }

    pub fn def_by_name(&self, name: &str) -> CoreResult<(usize, &AttrDef, &AttrValue)> {
        let idx = self.index_of(name).ok_or_else(|| AttrError::UnknownResource {
            attr: name.to_owned(),
            resource: String::new(),
        })?;
        let entry = &self.entries[idx];
        Ok((idx, &entry.def, &entry.type_hint))
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &AttrDef)> {
        self.entries.iter().enumerate().map(|(i, e)| (i, &e.def))
    }
}

pub struct AttrRegistryBuilder {
    entries: Vec<RegistryEntry>,
}

impl AttrRegistryBuilder {
    /// Register one attribute. `type_hint` need only carry the right
    /// variant (its payload is never read): `AttrValue::Long(0)` is as
    /// good a hint as `AttrValue::Long(42)`.
    pub fn attr(mut self, def: AttrDef, type_hint: AttrValue) -> Self {
        self.entries.push(RegistryEntry { def, type_hint });
        self
    }

    pub fn build(self) -> AttrRegistry {
        let mut index_by_name = HashMap::with_capacity(self.entries.len());
        for (i, entry) in self.entries.iter().enumerate() {
            let prior = index_by_name.insert(entry.def.name, i);
            assert!(prior.is_none(), "duplicate attribute name '{}' in registry", entry.def.name);
        }
        AttrRegistry {
            entries: self.entries,
            index_by_name,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::AttrDefFlags;

    #[test]
    fn builds_index_by_name() {
        let reg = AttrRegistry::builder()
            .attr(
                AttrDef::new("queue", AttrDefFlags::USRD | AttrDefFlags::USWR),
                AttrValue::Str(String::new()),
            )
            .attr(
                AttrDef::new("Resource_List", AttrDefFlags::USRD | AttrDefFlags::USWR),
                AttrValue::ResourceList(Default::default()),
            )
            .build();
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.index_of("Resource_List"), Some(1));
        assert_eq!(reg.name_of(0), Some("queue"));
        assert!(reg.index_of("nonexistent").is_none());
    }

    #[test]
    #[should_panic(expected = "duplicate attribute name")]
    fn rejects_duplicate_names() {
        AttrRegistry::builder()
            .attr(AttrDef::new("x", AttrDefFlags::USRD), AttrValue::Long(0))
            .attr(AttrDef::new("x", AttrDefFlags::USRD), AttrValue::Long(0))
            .build();
    }
}
