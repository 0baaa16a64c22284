//! Entity-limit values: the per-user/group/project caps carried by
//! attributes like `max_run`, `max_queued`, and their `_res.<resource>`
//! variants.
//!
//! Wire form is a comma-separated list of `key=value` pairs where `key`
//! is either `o` (overall), `u:<name>`, `g:<name>`, or `p:<name>`. The
//! original keeps these as a linked list of `pbs_entity` structs; a
//! `BTreeMap` keyed by the parsed key gives the same lookup with less
//! code and deterministic encode order.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{AttrError, Result as CoreResult};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum EntityKey {
    Overall,
    User(String),
    Group(String),
    Project(String),
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKey::Overall => write!(f, "o"),
            EntityKey::User(name) => write!(f, "u:{name}"),
            EntityKey::Group(name) => write!(f, "g:{name}"),
            EntityKey::Project(name) => write!(f, "p:{name}"),
        }
    }
}

impl EntityKey {
    fn parse(raw: &str) -> CoreResult<EntityKey> {
        if raw == "o" {
            return Ok(EntityKey::Overall);
        }
        let (tag, name) = raw.split_once(':').ok_or_else(|| AttrError::BadAttrValue {
            attr: "entity-limit".to_owned(),
            reason: format!("'{raw}' is not a valid entity key"),
        })?;
        let name = name.to_owned();
        match tag {
            "u" => Ok(EntityKey::User(name)),
            "g" => Ok(EntityKey::Group(name)),
            "p" => Ok(EntityKey::Project(name)),
            other => Err(AttrError::BadAttrValue {
                attr: "entity-limit".to_owned(),
                reason: format!("unknown entity tag '{other}'"),
            }
            .into()),
        }
    }
}

/// A full entity-limit value: a table of key -> signed integer limit.
/// `-1` conventionally means "unlimited" for that key, per the original.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntityLimits {
    limits: BTreeMap<EntityKey, i64>,
}

impl EntityLimits {
    pub fn get(&self, key: &EntityKey) -> Option<i64> {
        self.limits.get(key).copied()
    }

    pub fn set(&mut self, key: EntityKey, value: i64) {
        self.limits.insert(key, value);
    }

    pub fn parse(raw: &str) -> CoreResult<EntityLimits> {
        let mut limits = BTreeMap::new();
        for part in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key_str, value_str) = part.split_once('=').ok_or_else(|| AttrError::BadAttrValue {
                attr: "entity-limit".to_owned(),
                reason: format!("'{part}' is missing '='"),
            })?;
            let key = EntityKey::parse(key_str)?;
            let value: i64 = value_str.parse().map_err(|_| AttrError::BadAttrValue {
                attr: "entity-limit".to_owned(),
                reason: format!("'{value_str}' is not an integer"),
            })?;
            limits.insert(key, value);
        }
        Ok(EntityLimits { limits })
    }

    /// Merge another entity-limit value in, key by key, overwriting
    /// matching keys (the INCR semantics for this type are "replace the
    /// named entries", not arithmetic accumulation — mirroring the
    /// original's `set_entity_value` with `INCR`).
    pub fn merge_overwrite(&mut self, other: &EntityLimits) {
        for (key, value) in &other.limits {
            self.limits.insert(key.clone(), *value);
        }
    }

    pub fn encode_to_string(&self) -> String {
        self.limits
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mixed_keys() {
        let limits = EntityLimits::parse("o=10,u:alice=2,g:staff=5,p:proja=-1").unwrap();
        assert_eq!(limits.get(&EntityKey::Overall), Some(10));
        assert_eq!(limits.get(&EntityKey::User("alice".into())), Some(2));
        assert_eq!(limits.get(&EntityKey::Group("staff".into())), Some(5));
        assert_eq!(limits.get(&EntityKey::Project("proja".into())), Some(-1));
    }

    #[test]
    fn rejects_unknown_tag() {
        assert!(EntityLimits::parse("x:foo=1").is_err());
    }

    #[test]
    fn merge_overwrites_matching_keys_only() {
        let mut base = EntityLimits::parse("u:alice=2,u:bob=3").unwrap();
        let delta = EntityLimits::parse("u:alice=9").unwrap();
        base.merge_overwrite(&delta);
        assert_eq!(base.get(&EntityKey::User("alice".into())), Some(9));
        assert_eq!(base.get(&EntityKey::User("bob".into())), Some(3));
    }
}
