//! Conversions between the wire `Svrattrl`/`AttrList` messages shared by
//! all three proto packages and `pbs_core::attribute`'s in-memory
//! `AttrArray`. Every handler that accepts or returns an attribute list
//! goes through here rather than hand-rolling the decode loop per RPC.

use tonic::Status;

use pbs_core::attribute::{AttrArray, AttrParentKind, AttrRegistry, Privilege, SetOp};

/// Local stand-in for "whichever proto package's `Svrattrl`/`AttrList`
/// this call site is using" -- the three `.proto` files each declare
/// their own copy of these two messages rather than sharing an import,
/// so this module is generic over anything shaped the same way.
pub trait WireAttr {
    fn name(&self) -> &str;
    fn resource(&self) -> Option<&str>;
    fn value(&self) -> &str;
    fn op(&self) -> &str;
}

pub fn set_op_from_wire(op: &str) -> Result<SetOp, Status> {
    match op {
        "" | "set" => Ok(SetOp::Set),
        "incr" => Ok(SetOp::Incr),
        "decr" => Ok(SetOp::Decr),
        "internal" => Ok(SetOp::Internal),
        other => Err(Status::invalid_argument(format!(
            "unknown attribute operator '{other}'"
        ))),
    }
}

pub fn wire_op_from_encoded(op: pbs_core::attribute::codec::EncodedOp) -> &'static str {
    use pbs_core::attribute::codec::EncodedOp;
    match op {
        EncodedOp::Set => "set",
        EncodedOp::Incr => "incr",
        EncodedOp::Decr => "decr",
    }
}

/// Apply every wire record to `extra` against `registry`. A name
/// `registry` does not define is not an error: it is preserved in the
/// unknown bucket so a job round-trips across a server build that
/// dropped or renamed an attribute (spec.md §4.1), matching
/// `AttrArray::decode_one`'s own contract for job attributes. Callers
/// for entity kinds that do not carry an unknown bucket (queues, nodes,
/// reservations) get the same leniency; an unrecognized name there is
/// simply dropped rather than surfaced as a protocol error, since the
/// manager protocol tolerates "set a queue attribute this build doesn't
/// know about" as a no-op rather than a failure.
pub fn apply_attr_list<A: WireAttr>(
    extra: &mut AttrArray,
    registry: &AttrRegistry,
    parent_kind: AttrParentKind,
    attrs: impl IntoIterator<Item = A>,
) -> Result<(), Status> {
    for a in attrs {
        let op = set_op_from_wire(a.op())?;
        let applied = extra
            .decode_one(registry, parent_kind, a.name(), a.resource(), a.value(), op)
            .map_err(Status::from)?;
        if applied.is_none() {
            extra.remember_unknown(a.name(), a.value());
        }
    }
    Ok(())
}

/// Encode every set attribute in `extra` at the given privilege tier
/// into `(name, resource, value, op)` tuples a caller turns into its own
/// proto package's `Svrattrl` list.
pub fn encode_attr_list(
    extra: &mut AttrArray,
    registry: &AttrRegistry,
    priv_: Privilege,
) -> Vec<(String, String, String, &'static str)> {
    extra
        .encode_all(registry, priv_, false)
        .into_iter()
        .map(|s| {
            (
                s.name,
                s.resource.unwrap_or_default(),
                s.value,
                wire_op_from_encoded(s.op),
            )
        })
        .collect()
}
