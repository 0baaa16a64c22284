//! The attribute runtime: a typed, versioned, sparsely-set value cell
//! shared by every persisted entity (server, queue, job, reservation,
//! node).
//!
//! The C original dispatches through a per-definition table of six
//! function pointers (decode/encode/set/comp/free/action). Here that
//! vtable becomes a tagged sum (`AttrValue`) plus free functions that
//! match on the tag, with `AttrDef` carrying only the parts that
//! genuinely vary per definition (name, access flags, and an optional
//! action callback).

pub mod codec;
pub mod entity_limit;
pub mod registry;
pub mod resource;

use std::collections::BTreeMap;
use std::sync::Arc;

use bitflags::bitflags;

use crate::error::{AttrError, Result as CoreResult};

pub use codec::Svrattrl;
pub use entity_limit::EntityLimits;
pub use registry::{AttrRegistry, AttrRegistryBuilder};
pub use resource::{ResourceList, ResourceValue};

bitflags! {
    /// Per-attribute-instance state flags (the original's `at_flags`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AttrFlags: u32 {
        /// The attribute has been explicitly given a value.
        const SET      = 1 << 0;
        /// The value changed since the last time actions ran to completion.
        const MODIFY   = 1 << 1;
        /// The cached encoded form is stale and must be rebuilt.
        const MODCACHE = 1 << 2;
        /// The value is still the compiled-in default.
        const DEFLT    = 1 << 3;
        /// A resource value of the form `@othervnode`.
        const INDIRECT = 1 << 4;
        /// This attribute is the target of some other vnode's INDIRECT resource.
        const TARGET   = 1 << 5;
        /// Never shown to unprivileged readers regardless of def flags.
        const HIDDEN   = 1 << 6;
    }
}

bitflags! {
    /// Per-attribute-*definition* access flags (the original's `at_flags`
    /// on `attribute_def`, `ATR_DFLAG_*`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AttrDefFlags: u32 {
        const USRD    = 1 << 0;
        const USWR    = 1 << 1;
        const OPRD    = 1 << 2;
        const OPWR    = 1 << 3;
        const MGRD    = 1 << 4;
        const MGWR    = 1 << 5;
        const SVRD    = 1 << 6;
        const SVWR    = 1 << 7;
        const RDACC   = 1 << 8;
        const HIDDEN  = 1 << 9;
        const NOSAVM  = 1 << 10;
        const SELEQ   = 1 << 11;
        /// Always-needed/assigned consumable (ANASSN): pre-linked into
        /// resources_assigned at node creation.
        const ANASSN  = 1 << 12;
        /// Full-node-assigned consumable (FNASSN): same pre-linking rule.
        const FNASSN  = 1 << 13;
        const MOM     = 1 << 14;
    }
}

/// Who is asking: gates access checks and the show-hidden cache tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    User,
    Operator,
    Manager,
    Server,
}

impl Privilege {
    /// Tiers are cumulative: a Manager can read anything a User or
    /// Operator can, plus whatever is marked `MGRD`. Mirrors the
    /// original's `encode_attr` access mask, which ORs in every tier at
    /// or below the caller's.
    fn read_mask(self) -> AttrDefFlags {
        match self {
            Privilege::User => AttrDefFlags::USRD,
            Privilege::Operator => AttrDefFlags::USRD | AttrDefFlags::OPRD,
            Privilege::Manager => AttrDefFlags::USRD | AttrDefFlags::OPRD | AttrDefFlags::MGRD,
            Privilege::Server => {
                AttrDefFlags::USRD | AttrDefFlags::OPRD | AttrDefFlags::MGRD | AttrDefFlags::SVRD
            }
        }
    }

    fn write_mask(self) -> AttrDefFlags {
        match self {
            Privilege::User => AttrDefFlags::USWR,
            Privilege::Operator => AttrDefFlags::USWR | AttrDefFlags::OPWR,
            Privilege::Manager => AttrDefFlags::USWR | AttrDefFlags::OPWR | AttrDefFlags::MGWR,
            Privilege::Server => {
                AttrDefFlags::USWR | AttrDefFlags::OPWR | AttrDefFlags::MGWR | AttrDefFlags::SVWR
            }
        }
    }
}

/// `op` argument to the generic/slim setters: SET replaces, INCR/DECR
/// accumulate on additive types, INTERNAL bypasses access checks for
/// server-internal bookkeeping (e.g. resource accounting on run/obit).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOp {
    Set,
    Incr,
    Decr,
    Internal,
}

/// Mode passed to an attribute's `action` callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionMode {
    /// Attribute is being set for the first time on a freshly created entity.
    New,
    /// Attribute is being changed on an already-live entity.
    Alter,
    /// Attribute is being restored from persistent storage; actions that
    /// would cascade into further mutation should be suppressed.
    Recov,
    /// The owning entity is being destroyed.
    Free,
    /// No-op placeholder (used internally when an action callback is absent).
    Noop,
}

/// Who owns this attribute, passed untyped-no-longer to `action`
/// callbacks. The C original passes a `void*` parent and trusts the
/// callback to downcast correctly; this enum makes the parent kind part
/// of the type so a callback registered for the wrong entity kind is a
/// compile error, not a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrParentKind {
    Server,
    Queue,
    Job,
    Reservation,
    Node,
}

/// The value union. Exactly the closed type set named in the spec.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Long(i64),
    Char(char),
    Str(String),
    ArrayStr(Vec<String>),
    Size(u64),
    Time(i64),
    Float(f64),
    Bool(bool),
    ResourceList(ResourceList),
    Acl(Vec<String>),
    EntityLimit(EntityLimits),
    /// An opaque pre-encoded blob (used for attributes whose wire form is
    /// cheaper to keep pre-baked than to regenerate, e.g. a cached script).
    OpaqueCached(Vec<u8>),
}

impl AttrValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            AttrValue::Long(_) => "long",
            AttrValue::Char(_) => "char",
            AttrValue::Str(_) => "string",
            AttrValue::ArrayStr(_) => "array-of-strings",
            AttrValue::Size(_) => "size",
            AttrValue::Time(_) => "time",
            AttrValue::Float(_) => "float",
            AttrValue::Bool(_) => "boolean",
            AttrValue::ResourceList(_) => "resource-list",
            AttrValue::Acl(_) => "acl",
            AttrValue::EntityLimit(_) => "entity-limit",
            AttrValue::OpaqueCached(_) => "opaque-cached",
        }
    }

    /// Additive types accept INCR/DECR; everything else rejects DECR.
    fn is_additive(&self) -> bool {
        matches!(
            self,
            AttrValue::Long(_) | AttrValue::Size(_) | AttrValue::ResourceList(_)
        )
    }

    fn decode_str(type_hint: &AttrValue, name: &str, s: &str) -> CoreResult<AttrValue> {
        let v = match type_hint {
            AttrValue::Long(_) => AttrValue::Long(s.parse().map_err(|_| {
                AttrError::BadAttrValue {
                    attr: name.to_owned(),
                    reason: format!("'{s}' is not an integer"),
                }
            })?),
            AttrValue::Char(_) => {
                let mut chars = s.chars();
                let c = chars.next().ok_or_else(|| AttrError::BadAttrValue {
                    attr: name.to_owned(),
                    reason: "empty char value".into(),
                })?;
                if chars.next().is_some() {
                    return Err(AttrError::BadAttrValue {
                        attr: name.to_owned(),
                        reason: "char value must be one character".into(),
                    }
                    .into());
                }
                AttrValue::Char(c)
            }
            AttrValue::Str(_) => AttrValue::Str(s.to_owned()),
            AttrValue::ArrayStr(_) => {
                AttrValue::ArrayStr(s.split(',').map(|p| p.trim().to_owned()).collect())
            }
            AttrValue::Size(_) => AttrValue::Size(parse_size(s).ok_or_else(|| {
                AttrError::BadAttrValue {
                    attr: name.to_owned(),
                    reason: format!("'{s}' is not a size"),
                }
            })?),
            AttrValue::Time(_) => AttrValue::Time(s.parse().map_err(|_| {
                AttrError::BadAttrValue {
                    attr: name.to_owned(),
                    reason: format!("'{s}' is not a time value"),
                }
            })?),
            AttrValue::Float(_) => AttrValue::Float(s.parse().map_err(|_| {
                AttrError::BadAttrValue {
                    attr: name.to_owned(),
                    reason: format!("'{s}' is not a float"),
                }
            })?),
            AttrValue::Bool(_) => AttrValue::Bool(matches!(
                s.to_ascii_lowercase().as_str(),
                "true" | "1" | "y" | "yes"
            )),
            AttrValue::Acl(_) => {
                AttrValue::Acl(s.split(',').map(|p| p.trim().to_owned()).collect())
            }
            AttrValue::ResourceList(_) | AttrValue::EntityLimit(_) | AttrValue::OpaqueCached(_) => {
                return Err(AttrError::BadAttrValue {
                    attr: name.to_owned(),
                    reason: "this type must be decoded via its dedicated path".into(),
                }
                .into());
            }
        };
        Ok(v)
    }

    fn encode_to_string(&self) -> String {
        match self {
            AttrValue::Long(v) => v.to_string(),
            AttrValue::Char(v) => v.to_string(),
            AttrValue::Str(v) => v.clone(),
            AttrValue::ArrayStr(v) => v.join(","),
            AttrValue::Size(v) => v.to_string(),
            AttrValue::Time(v) => v.to_string(),
            AttrValue::Float(v) => v.to_string(),
            AttrValue::Bool(v) => v.to_string(),
            AttrValue::Acl(v) => v.join(","),
            AttrValue::ResourceList(v) => v.encode_to_string(),
            AttrValue::EntityLimit(v) => v.encode_to_string(),
            AttrValue::OpaqueCached(v) => format!("<{} bytes>", v.len()),
        }
    }
}

fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim();
    let (digits, mult): (&str, u64) = if let Some(p) = s.strip_suffix("kb") {
        (p, 1024)
    } else if let Some(p) = s.strip_suffix("mb") {
        (p, 1024 * 1024)
    } else if let Some(p) = s.strip_suffix("gb") {
        (p, 1024 * 1024 * 1024)
    } else if let Some(p) = s.strip_suffix('b') {
        (p, 1)
    } else {
        (s, 1)
    };
    digits.trim().parse::<u64>().ok().map(|n| n * mult)
}

/// An optional per-definition action callback, invoked on NEW/ALTER/RECOV/FREE.
pub type ActionFn = Arc<dyn Fn(&Attribute, AttrParentKind, ActionMode) -> CoreResult<()> + Send + Sync>;

/// The static, per-definition portion of an attribute: name and access
/// flags plus the optional action callback. One of these exists per
/// `JOB_ATR_*`/`ND_ATR_*`/... index, in a table parallel to the owning
/// entity's attribute array.
#[derive(Clone)]
pub struct AttrDef {
    pub name: &'static str,
    pub flags: AttrDefFlags,
    pub action: Option<ActionFn>,
}

impl AttrDef {
    pub const fn new(name: &'static str, flags: AttrDefFlags) -> Self {
        Self {
            name,
            flags,
            action: None,
        }
    }

    pub fn with_action(mut self, action: ActionFn) -> Self {
        self.action = Some(action);
        self
    }

    /// Whether `priv_` may read this attribute's access flags. `HIDDEN`
    /// is deliberately not checked here: it gates on the show-hidden
    /// override at the one call site ([`Attribute::encode_cached`]),
    /// not on access-flag permission.
    pub fn can_read(&self, priv_: Privilege) -> bool {
        self.flags.intersects(priv_.read_mask()) || self.flags.contains(AttrDefFlags::RDACC)
    }

    pub fn can_write(&self, priv_: Privilege) -> bool {
        self.flags.intersects(priv_.write_mask())
    }
}

/// A cached encoding of an attribute for one access tier (privileged or
/// unprivileged readers). Reused across status replies until `MODCACHE`
/// is observed to be set, then dropped and rebuilt.
#[derive(Debug, Clone, Default)]
struct EncodedCache {
    user: Option<Arc<Vec<Svrattrl>>>,
    manager: Option<Arc<Vec<Svrattrl>>>,
}

/// One attribute cell: value, flags, and the two cached encodings.
#[derive(Debug, Clone)]
pub struct Attribute {
    value: Option<AttrValue>,
    flags: AttrFlags,
    cache: EncodedCache,
}

impl Default for Attribute {
    fn default() -> Self {
        Self {
            value: None,
            flags: AttrFlags::MODCACHE,
            cache: EncodedCache::default(),
        }
    }
}

impl Attribute {
    pub fn new_unset() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        self.flags.contains(AttrFlags::SET)
    }

    pub fn flags(&self) -> AttrFlags {
        self.flags
    }

    pub fn value(&self) -> Option<&AttrValue> {
        self.value.as_ref()
    }

    pub fn value_mut(&mut self) -> Option<&mut AttrValue> {
        self.value.as_mut()
    }

    /// The "slim" setter: assigns directly, with no action dispatch. Used
    /// on recovery and by internal bookkeeping paths where invoking the
    /// action callback would recurse. Per the contract, this must still
    /// mark MODIFY and MODCACHE so cached encodings are not left stale.
    pub fn set_slim(&mut self, value: AttrValue, op: SetOp) -> CoreResult<()> {
        self.apply_op(value, op)?;
        self.flags.insert(AttrFlags::SET | AttrFlags::MODIFY | AttrFlags::MODCACHE);
        self.flags.remove(AttrFlags::DEFLT);
        self.invalidate_cache();
        Ok(())
    }

    /// The "generic" setter: assigns through `set_slim`, then (if a
    /// definition with an action callback is supplied) invokes the
    /// action with NEW or ALTER depending on whether the attribute was
    /// previously unset.
    pub fn set_generic(
        &mut self,
        def: &AttrDef,
        parent_kind: AttrParentKind,
        value: AttrValue,
        op: SetOp,
    ) -> CoreResult<()> {
        let was_set = self.is_set();
        self.set_slim(value, op)?;
        if let Some(action) = &def.action {
            let mode = if was_set {
                ActionMode::Alter
            } else {
                ActionMode::New
            };
            action(self, parent_kind, mode)?;
        }
        Ok(())
    }

    /// Decode a string value as the attribute's current type (or, if
    /// unset, the type implied by `type_hint`) and apply via the generic
    /// setter.
    pub fn decode_and_set(
        &mut self,
        def: &AttrDef,
        parent_kind: AttrParentKind,
        type_hint: &AttrValue,
        resc_name: Option<&str>,
        raw: &str,
        op: SetOp,
    ) -> CoreResult<()> {
        let decoded = if let AttrValue::ResourceList(_) = type_hint {
            let resc_name = resc_name.ok_or_else(|| AttrError::UnknownResource {
                attr: def.name.to_owned(),
                resource: "<missing>".to_owned(),
            })?;
            let mut list = match &self.value {
                Some(AttrValue::ResourceList(l)) => l.clone(),
                _ => ResourceList::default(),
            };
            list.set_or_merge(resc_name, raw, op)?;
            AttrValue::ResourceList(list)
        } else {
            AttrValue::decode_str(type_hint, def.name, raw)?
        };
        self.set_generic(def, parent_kind, decoded, op)
    }

    fn apply_op(&mut self, new_value: AttrValue, op: SetOp) -> CoreResult<()> {
        match op {
            SetOp::Set | SetOp::Internal => {
                self.value = Some(new_value);
            }
            SetOp::Incr => {
                self.value = Some(combine(self.value.take(), new_value, true)?);
            }
            SetOp::Decr => {
                if !new_value.is_additive() {
                    return Err(AttrError::NotAdditive {
                        attr: new_value.type_name().to_owned(),
                        op: "DECR".to_owned(),
                    }
                    .into());
                }
                self.value = Some(combine(self.value.take(), new_value, false)?);
            }
        }
        Ok(())
    }

    fn invalidate_cache(&mut self) {
        self.cache = EncodedCache::default();
    }

    /// Compare two attributes' values (the `comp` vtable entry). Returns
    /// an ordering-free equality since the value union is not totally
    /// ordered across types.
    pub fn values_equal(&self, other: &Attribute) -> bool {
        self.value == other.value
    }

    pub fn free(&mut self) {
        self.value = None;
        self.flags = AttrFlags::MODCACHE;
        self.invalidate_cache();
    }

    /// Produce (or reuse) the cached `svrattrl` encoding for the given
    /// privilege tier. Hidden attributes are skipped unless
    /// `show_hidden` is set (the status-request "show hidden" override).
    pub fn encode_cached(
        &mut self,
        def: &AttrDef,
        name: &str,
        resc_name: Option<&str>,
        priv_: Privilege,
        show_hidden: bool,
    ) -> Option<Arc<Vec<Svrattrl>>> {
        if !self.is_set() {
            return None;
        }
        if def.flags.contains(AttrDefFlags::HIDDEN) && !show_hidden {
            return None;
        }
        if !def.can_read(priv_) {
            return None;
        }

        let tier_is_manager = matches!(priv_, Privilege::Manager | Privilege::Server);
        let hit = if tier_is_manager {
            self.cache.manager.clone()
        } else {
            self.cache.user.clone()
        };

        if !self.flags.contains(AttrFlags::MODCACHE) {
            if let Some(hit) = hit {
                return Some(hit);
            }
        }

        let encoded = Arc::new(codec::encode_attribute(self.value.as_ref()?, name, resc_name));
        if tier_is_manager {
            self.cache.manager = Some(encoded.clone());
        } else {
            self.cache.user = Some(encoded.clone());
        }
        self.flags.remove(AttrFlags::MODCACHE);
        Some(encoded)
    }
}

fn combine(existing: Option<AttrValue>, delta: AttrValue, add: bool) -> CoreResult<AttrValue> {
    let sign = if add { 1 } else { -1 };
    Ok(match (existing, delta) {
        (Some(AttrValue::Long(a)), AttrValue::Long(b)) => AttrValue::Long(a + sign as i64 * b),
        (None, AttrValue::Long(b)) => AttrValue::Long(sign as i64 * b),
        (Some(AttrValue::Size(a)), AttrValue::Size(b)) => {
            AttrValue::Size(if add { a + b } else { a.saturating_sub(b) })
        }
        (None, AttrValue::Size(b)) => AttrValue::Size(if add { b } else { 0 }),
        (Some(AttrValue::ResourceList(mut a)), AttrValue::ResourceList(b)) => {
            a.combine(&b, add)?;
            AttrValue::ResourceList(a)
        }
        (None, AttrValue::ResourceList(b)) => AttrValue::ResourceList(b),
        (_, other) => {
            return Err(AttrError::NotAdditive {
                attr: other.type_name().to_owned(),
                op: if add { "INCR".into() } else { "DECR".into() },
            }
            .into())
        }
    })
}

/// A fixed-size, index-addressed array of attribute cells, paired with a
/// `BTreeMap` of attribute names preserved from a prior server version
/// that this server build no longer defines (the "unknown bucket" used
/// so jobs round-trip across upgrades).
#[derive(Debug, Clone, Default)]
pub struct AttrArray {
    cells: Vec<Attribute>,
    pub unknown: BTreeMap<String, String>,
}

impl AttrArray {
    pub fn new(len: usize) -> Self {
        Self {
            cells: (0..len).map(|_| Attribute::new_unset()).collect(),
            unknown: BTreeMap::new(),
        }
    }

    pub fn get(&self, idx: usize) -> &Attribute {
        &self.cells[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut Attribute {
        &mut self.cells[idx]
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Build an array sized to carry every attribute `registry` defines,
    /// the way `initialize_pbsnode` and friends size the original's
    /// fixed per-entity attribute array off its enum's `_LAST` sentinel.
    pub fn for_registry(registry: &AttrRegistry) -> Self {
        Self::new(registry.len())
    }

    /// Decode one wire record (`name[.resource] op value`) against
    /// `registry` and apply it through the generic setter, so the action
    /// callback fires exactly as it would from any other call site. Names
    /// `registry` does not recognize are not an error here: for a job
    /// they belong in the unknown-attribute bucket (so the job round-trips
    /// across server versions per spec.md §4.1); for any other entity
    /// kind the caller should treat a miss as a protocol error instead of
    /// calling this at all.
    pub fn decode_one(
        &mut self,
        registry: &AttrRegistry,
        parent_kind: AttrParentKind,
        name: &str,
        resc_name: Option<&str>,
        raw: &str,
        op: SetOp,
    ) -> CoreResult<Option<()>> {
        let Some(idx) = registry.index_of(name) else {
            return Ok(None);
        };
        let def = registry.def(idx).expect("index came from this registry");
        let type_hint = registry.type_hint(idx).expect("index came from this registry");
        self.cells[idx].decode_and_set(def, parent_kind, type_hint, resc_name, raw, op)?;
        Ok(Some(()))
    }

    /// Preserve an attribute name `registry` does not define (the
    /// "unknown bucket" a job's attribute array keeps so it round-trips
    /// across a server upgrade that dropped or renamed an attribute).
    pub fn remember_unknown(&mut self, name: &str, raw: &str) {
        self.unknown.insert(name.to_owned(), raw.to_owned());
    }

    /// Encode every set attribute `registry` defines into wire records,
    /// for the given reader's privilege tier.
    pub fn encode_all(&mut self, registry: &AttrRegistry, priv_: Privilege, show_hidden: bool) -> Vec<Svrattrl> {
        let mut out = Vec::new();
        for idx in 0..registry.len() {
            let name = registry.name_of(idx).expect("idx in range");
            let def = registry.def(idx).expect("idx in range");
            if let Some(encoded) = self.cells[idx].encode_cached(def, name, None, priv_, show_hidden) {
                out.extend(encoded.iter().cloned());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slim_set_marks_set_and_modcache() {
        let mut attr = Attribute::new_unset();
        attr.set_slim(AttrValue::Long(4), SetOp::Set).unwrap();
        assert!(attr.is_set());
        assert!(attr.flags().contains(AttrFlags::MODCACHE));
        assert_eq!(attr.value(), Some(&AttrValue::Long(4)));
    }

    #[test]
    fn decr_on_non_additive_rejected() {
        let mut attr = Attribute::new_unset();
        attr.set_slim(AttrValue::Str("x".into()), SetOp::Set).unwrap();
        let err = attr.apply_op(AttrValue::Str("y".into()), SetOp::Decr);
        assert!(err.is_err());
    }

    #[test]
    fn roundtrip_decode_encode_long() {
        let mut attr = Attribute::new_unset();
        let def = AttrDef::new("test_attr", AttrDefFlags::USRD | AttrDefFlags::USWR);
        attr.decode_and_set(
            &def,
            AttrParentKind::Job,
            &AttrValue::Long(0),
            None,
            "42",
            SetOp::Set,
        )
        .unwrap();
        assert_eq!(attr.value(), Some(&AttrValue::Long(42)));
        let encoded = attr
            .encode_cached(&def, "test_attr", None, Privilege::Manager, false)
            .unwrap();
        assert_eq!(encoded.len(), 1);
        assert_eq!(encoded[0].value, "42");
    }

    #[test]
    fn cache_reused_until_modcache_set_again() {
        let mut attr = Attribute::new_unset();
        let def = AttrDef::new("x", AttrDefFlags::USRD | AttrDefFlags::USWR);
        attr.set_generic(&def, AttrParentKind::Job, AttrValue::Long(1), SetOp::Set)
            .unwrap();
        let first = attr
            .encode_cached(&def, "x", None, Privilege::Manager, false)
            .unwrap();
        let second = attr
            .encode_cached(&def, "x", None, Privilege::Manager, false)
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        attr.set_generic(&def, AttrParentKind::Job, AttrValue::Long(2), SetOp::Set)
            .unwrap();
        let third = attr
            .encode_cached(&def, "x", None, Privilege::Manager, false)
            .unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(third[0].value, "2");
    }

    #[test]
    fn hidden_attribute_skipped_unless_show_hidden() {
        let mut attr = Attribute::new_unset();
        let def = AttrDef::new(
            "secret",
            AttrDefFlags::SVRD | AttrDefFlags::SVWR | AttrDefFlags::HIDDEN,
        );
        attr.set_generic(&def, AttrParentKind::Job, AttrValue::Long(1), SetOp::Set)
            .unwrap();
        assert!(attr
            .encode_cached(&def, "secret", None, Privilege::Server, false)
            .is_none());
        assert!(attr
            .encode_cached(&def, "secret", None, Privilege::Server, true)
            .is_some());
    }

    #[test]
    fn array_decode_one_and_encode_all_via_registry() {
        let registry = AttrRegistry::builder()
            .attr(
                AttrDef::new("queue", AttrDefFlags::USRD | AttrDefFlags::USWR),
                AttrValue::Str(String::new()),
            )
            .attr(
                AttrDef::new("Resource_List", AttrDefFlags::USRD | AttrDefFlags::USWR),
                AttrValue::ResourceList(Default::default()),
            )
            .build();
        let mut arr = AttrArray::for_registry(&registry);
        assert_eq!(arr.len(), 2);

        arr.decode_one(&registry, AttrParentKind::Job, "queue", None, "workq", SetOp::Set)
            .unwrap()
            .expect("queue is defined");
        arr.decode_one(
            &registry,
            AttrParentKind::Job,
            "Resource_List",
            Some("ncpus"),
            "4",
            SetOp::Set,
        )
        .unwrap()
        .expect("Resource_List is defined");

        let miss = arr
            .decode_one(&registry, AttrParentKind::Job, "nonexistent", None, "x", SetOp::Set)
            .unwrap();
        assert!(miss.is_none());

        let encoded = arr.encode_all(&registry, Privilege::Manager, false);
        assert_eq!(encoded.len(), 2);
        assert!(encoded.iter().any(|e| e.name == "queue" && e.value == "workq"));
        assert!(encoded
            .iter()
            .any(|e| e.name == "Resource_List" && e.resource.as_deref() == Some("ncpus")));
    }
}
