//! Queues: the routing/execution destinations jobs live in between
//! submission and run. A queue is mostly an attribute bag (ACLs, limits,
//! the partition tag that ties it to one Scheduler) plus a type
//! (execution vs. routing) and the backing `ri_qp`-style link a
//! reservation uses for its own private execution queue.

use std::sync::OnceLock;

use crate::attribute::{AttrArray, AttrDef, AttrDefFlags, AttrRegistry, AttrValue, EntityLimits};
use crate::store::Named;

/// The queue's attribute table: ACLs and resource limits not already
/// carried as typed fields on [`Queue`] itself.
pub fn queue_registry() -> &'static AttrRegistry {
    static REGISTRY: OnceLock<AttrRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        AttrRegistry::builder()
            .attr(
                AttrDef::new("Resources_max", AttrDefFlags::MGRD | AttrDefFlags::MGWR | AttrDefFlags::OPRD),
                AttrValue::ResourceList(Default::default()),
            )
            .attr(
                AttrDef::new("Resources_default", AttrDefFlags::MGRD | AttrDefFlags::MGWR | AttrDefFlags::OPRD),
                AttrValue::ResourceList(Default::default()),
            )
            .attr(
                AttrDef::new("acl_users", AttrDefFlags::MGRD | AttrDefFlags::MGWR),
                AttrValue::Acl(Vec::new()),
            )
            .attr(
                AttrDef::new("acl_groups", AttrDefFlags::MGRD | AttrDefFlags::MGWR),
                AttrValue::Acl(Vec::new()),
            )
            .attr(
                AttrDef::new("from_route_only", AttrDefFlags::MGRD | AttrDefFlags::MGWR | AttrDefFlags::OPRD),
                AttrValue::Bool(false),
            )
            .build()
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueType {
    Execution,
    Routing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Started,
    Stopped,
}

/// A queue is associated with exactly one Scheduler partition; the
/// default partition is a distinguished sentinel rather than `None` so
/// every queue always has an associated dispatch target.
pub const DEFAULT_PARTITION: &str = "default";

#[derive(Debug, Clone)]
pub struct Queue {
    pub name: String,
    pub kind: QueueType,
    pub state: QueueState,
    pub partition: String,
    pub enabled: bool,
    pub max_run: EntityLimits,
    pub max_queued: EntityLimits,
    /// Set for a reservation's private backing queue (`ri_qp`); `None`
    /// for an ordinary user-visible queue.
    pub owning_reservation: Option<String>,
    pub extra: AttrArray,
}

impl Named for Queue {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Queue {
    pub fn new(name: impl Into<String>, kind: QueueType) -> Self {
        Self {
            name: name.into(),
            kind,
            state: QueueState::Stopped,
            partition: DEFAULT_PARTITION.to_owned(),
            enabled: false,
            max_run: EntityLimits::default(),
            max_queued: EntityLimits::default(),
            owning_reservation: None,
            extra: AttrArray::for_registry(queue_registry()),
        }
    }

    /// A queue accepts new jobs only when both started and enabled
    /// (the distinct `QU_STARTED`/`QU_ENABLED` bits).
    pub fn accepts_jobs(&self) -> bool {
        self.enabled && matches!(self.state, QueueState::Started)
    }

    pub fn backing_reservation(id: impl Into<String>, partition: impl Into<String>) -> Self {
        let id = id.into();
        let mut q = Self::new(format!("{id}_resv"), QueueType::Execution);
        q.partition = partition.into();
        q.owning_reservation = Some(id);
        q.state = QueueState::Started;
        q.enabled = true;
        q
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_jobs_requires_started_and_enabled() {
        let mut q = Queue::new("workq", QueueType::Execution);
        assert!(!q.accepts_jobs());
        q.state = QueueState::Started;
        assert!(!q.accepts_jobs());
        q.enabled = true;
        assert!(q.accepts_jobs());
    }

    #[test]
    fn reservation_backing_queue_is_preconfigured() {
        let q = Queue::backing_reservation("R1.server", "partA");
        assert!(q.accepts_jobs());
        assert_eq!(q.owning_reservation.as_deref(), Some("R1.server"));
        assert_eq!(q.partition, "partA");
    }
}
