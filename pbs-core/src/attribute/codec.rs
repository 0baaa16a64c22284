//! The wire form attributes are cached in and exchanged over: a flat
//! list of `(name, resource, value, op)` records mirroring the
//! original's `svrattrl` linked list, terminated on the wire by an
//! `ENDATTRIBUTES` sentinel record.

use crate::attribute::{AttrValue, SetOp};

/// One encoded attribute record. `resource` is `Some` only for entries
/// that came out of a `ResourceList`; a plain scalar attribute encodes
/// to exactly one `Svrattrl`, a resource list to one per resource entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Svrattrl {
    pub name: String,
    pub resource: Option<String>,
    pub value: String,
    pub op: EncodedOp,
}

/// The wire representation of `SetOp`; `Internal` never appears on the
/// wire (it is a local bookkeeping-only variant) so it is not part of
/// this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodedOp {
    Set,
    Incr,
    Decr,
}

impl From<SetOp> for EncodedOp {
    fn from(op: SetOp) -> Self {
        match op {
            SetOp::Set | SetOp::Internal => EncodedOp::Set,
            SetOp::Incr => EncodedOp::Incr,
            SetOp::Decr => EncodedOp::Decr,
        }
    }
}

/// A sentinel marking the end of an attribute list in a decode stream,
/// distinguishing "no more attributes" from "connection truncated
/// mid-list".
pub const ENDATTRIBUTES: &str = "__endattributes__";

pub fn encode_attribute(value: &AttrValue, name: &str, resc_name: Option<&str>) -> Vec<Svrattrl> {
    match value {
        AttrValue::ResourceList(list) => list
            .iter()
            .map(|(resc, val)| Svrattrl {
                name: name.to_owned(),
                resource: Some(resc.clone()),
                value: val_to_string(val),
                op: EncodedOp::Set,
            })
            .collect(),
        other => vec![Svrattrl {
            name: name.to_owned(),
            resource: resc_name.map(str::to_owned),
            value: other.encode_to_string(),
            op: EncodedOp::Set,
        }],
    }
}

fn val_to_string(v: &crate::attribute::resource::ResourceValue) -> String {
    use crate::attribute::resource::ResourceValue::*;
    match v {
        Long(n) => n.to_string(),
        Size(n) => n.to_string(),
        Str(s) => s.clone(),
        Bool(b) => b.to_string(),
        Indirect(target) => format!("@{target}"),
    }
}

/// Parses a decode stream of lines in the form `name[.resource][OP]value`
/// (`OP` one of `+=`/`-=`/`=`) into `Svrattrl` records, stopping at the
/// `ENDATTRIBUTES` sentinel line. Used when recovering an entity's
/// attribute array from a persisted flat encoding or from a peer's
/// `PS_RSC_UPDATE` payload.
pub fn decode_stream(lines: &[String]) -> Vec<Svrattrl> {
    let mut out = Vec::new();
    for line in lines {
        if line == ENDATTRIBUTES {
            break;
        }
        if let Some(rec) = decode_line(line) {
            out.push(rec);
        }
    }
    out
}

fn decode_line(line: &str) -> Option<Svrattrl> {
    let (op_marker, value) = if let Some(rest) = line.split_once("+=") {
        (EncodedOp::Incr, rest.1)
    } else if let Some(rest) = line.split_once("-=") {
        (EncodedOp::Decr, rest.1)
    } else {
        let (head, value) = line.split_once('=')?;
        return Some(split_name_resource(head, value, EncodedOp::Set));
    };
    let head = line.split_once(match op_marker {
        EncodedOp::Incr => "+=",
        EncodedOp::Decr => "-=",
        EncodedOp::Set => unreachable!(),
    })?;
    Some(split_name_resource(head.0, value, op_marker))
}

fn split_name_resource(head: &str, value: &str, op: EncodedOp) -> Svrattrl {
    match head.split_once('.') {
        Some((name, resource)) => Svrattrl {
            name: name.to_owned(),
            resource: Some(resource.to_owned()),
            value: value.to_owned(),
            op,
        },
        None => Svrattrl {
            name: head.to_owned(),
            resource: None,
            value: value.to_owned(),
            op,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_stops_at_sentinel() {
        let lines = vec![
            "Resource_List.ncpus=4".to_owned(),
            ENDATTRIBUTES.to_owned(),
            "Resource_List.mem=1gb".to_owned(),
        ];
        let recs = decode_stream(&lines);
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].name, "Resource_List");
        assert_eq!(recs[0].resource.as_deref(), Some("ncpus"));
        assert_eq!(recs[0].value, "4");
    }

    #[test]
    fn decode_recognizes_incr_decr() {
        let lines = vec![
            "resources_assigned.ncpus+=2".to_owned(),
            "resources_assigned.ncpus-=1".to_owned(),
        ];
        let recs = decode_stream(&lines);
        assert_eq!(recs[0].op, EncodedOp::Incr);
        assert_eq!(recs[1].op, EncodedOp::Decr);
    }
}
