//! Parsing and application of the bracketed `exec_vnode` string a run
//! request carries: `(vnodeA:ncpus=1:mem=2gb)+(vnodeB:ncpus=2)`.
//!
//! `pbs-core` has no notion of this wire format at all — vnode resource
//! bookkeeping there is just `ResourceList::set_or_merge` calls driven by
//! whoever parsed the chunk spec. This module is that parsing, kept in
//! `pbs-server` because the format itself is a client/Scheduler-facing
//! concern, not a state-machine one.

use pbs_core::attribute::SetOp;
use pbs_core::core_ctx::Core;
use pbs_core::error::{CoreError, Result as CoreResult};

/// One `(name:res=val:res=val...)` chunk.
pub struct VnodeChunk {
    pub name: String,
    pub resources: Vec<(String, String)>,
}

pub fn parse(execvnode: &str) -> CoreResult<Vec<VnodeChunk>> {
    execvnode
        .split('+')
        .map(|raw| {
            let inner = raw
                .trim()
                .strip_prefix('(')
                .and_then(|s| s.strip_suffix(')'))
                .ok_or_else(|| CoreError::protocol(format!("malformed exec_vnode chunk '{raw}'")))?;
            let mut parts = inner.split(':');
            let name = parts
                .next()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| CoreError::protocol(format!("exec_vnode chunk '{raw}' has no vnode name")))?
                .to_owned();
            let resources = parts
                .map(|kv| {
                    let (k, v) = kv
                        .split_once('=')
                        .ok_or_else(|| CoreError::protocol(format!("malformed resource term '{kv}' in '{raw}'")))?;
                    Ok((k.to_owned(), v.to_owned()))
                })
                .collect::<CoreResult<Vec<_>>>()?;
            Ok(VnodeChunk { name, resources })
        })
        .collect()
}

/// Debit (`op = Incr`) or credit (`op = Decr`) every resource named in
/// `execvnode` against the matching node's `resources_assigned`. Used
/// identically on job run (debit) and on obit/requeue (credit).
pub fn apply(core: &mut Core, execvnode: &str, op: SetOp) -> CoreResult<()> {
    for chunk in parse(execvnode)? {
        let handle = core
            .find_node(&chunk.name)
            .ok_or_else(|| CoreError::not_found(format!("vnode '{}'", chunk.name)))?;
        let node = core
            .nodes
            .get_mut(handle)
            .ok_or_else(|| CoreError::internal("node handle resolved but entry missing"))?;
        for (resc, value) in &chunk.resources {
            node.resources_assigned.set_or_merge(resc, value, op)?;
        }
    }
    Ok(())
}

/// Resolve the mother superior (the Mom owning the first vnode chunk) of
/// an `exec_vnode` string, returning its `(host, port)` control endpoint.
/// The Server relays a job dispatch only to the mother superior; fanning
/// the run out to any sister Moms named by later chunks is MoM-internal.
pub fn resolve_mother_superior(core: &Core, execvnode: &str) -> CoreResult<(String, u16)> {
    let chunks = parse(execvnode)?;
    let first = chunks
        .first()
        .ok_or_else(|| CoreError::protocol("exec_vnode carries no vnode chunks"))?;
    let node_handle = core
        .find_node(&first.name)
        .ok_or_else(|| CoreError::not_found(format!("vnode '{}'", first.name)))?;
    let node = core
        .nodes
        .get(node_handle)
        .ok_or_else(|| CoreError::internal("node handle resolved but entry missing"))?;
    let mom = core
        .moms
        .get(node.mom)
        .ok_or_else(|| CoreError::internal("node's mom handle resolved but entry missing"))?;
    Ok((mom.host.clone(), mom.port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_two_chunk_execvnode() {
        let chunks = parse("(n1:ncpus=1:mem=2gb)+(n2:ncpus=2)").unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].name, "n1");
        assert_eq!(chunks[0].resources, vec![
            ("ncpus".to_string(), "1".to_string()),
            ("mem".to_string(), "2gb".to_string()),
        ]);
        assert_eq!(chunks[1].name, "n2");
    }

    #[test]
    fn rejects_chunk_missing_parens() {
        assert!(parse("n1:ncpus=1").is_err());
    }
}
