//! Session-wide table of instance records.

use crate::core::{InstanceId, InstanceState};
use crate::errors::{InvariantViolation, ResourceKind, SyscallError};
use std::collections::BTreeMap;
use tokio::sync::watch;

/// Why an identity could not be allocated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocateError {
    /// A budget refused the request; reported to the caller.
    Denied(SyscallError),
    /// The table itself is inconsistent; the session must stop.
    Fatal(InvariantViolation),
}

impl From<SyscallError> for AllocateError {
    fn from(err: SyscallError) -> Self {
        Self::Denied(err)
    }
}

impl From<InvariantViolation> for AllocateError {
    fn from(err: InvariantViolation) -> Self {
        Self::Fatal(err)
    }
}

/// Everything the runtime knows about one instance.
#[derive(Debug)]
pub struct InstanceRecord {
    /// The instance identity.
    pub id: InstanceId,
    /// The spawning instance; `None` for the root.
    pub parent: Option<InstanceId>,
    /// Spawn nesting depth, root at 0.
    pub depth: u32,
    /// Lifecycle state.
    pub state: InstanceState,
    /// Set when the program body failed instead of returning an exit code.
    pub fault: Option<String>,
    exit: watch::Sender<Option<i8>>,
}

impl InstanceRecord {
    fn new(id: InstanceId, parent: Option<InstanceId>, depth: u32) -> Self {
        let (exit, _) = watch::channel(None);
        Self {
            id,
            parent,
            depth,
            state: InstanceState::Running,
            fault: None,
            exit,
        }
    }

    /// Returns the exit code once the instance has exited.
    #[must_use]
    pub fn exit_code(&self) -> Option<i8> {
        self.state.exit_code()
    }

    /// Returns a receiver that observes the exit code.
    ///
    /// The receiver sees the code even if it subscribes after the exit.
    pub(crate) fn subscribe(&self) -> watch::Receiver<Option<i8>> {
        self.exit.subscribe()
    }
}

/// The instance table.
///
/// Records are kept for the whole session so a join stays valid after the
/// target exited.
#[derive(Debug)]
pub struct InstanceTable {
    max_instances: usize,
    max_depth: u32,
    next_id: u64,
    records: BTreeMap<InstanceId, InstanceRecord>,
}

impl InstanceTable {
    /// Creates an empty table with the given budgets.
    #[must_use]
    pub fn new(max_instances: usize, max_depth: u32) -> Self {
        Self {
            max_instances,
            max_depth,
            next_id: InstanceId::ROOT.get(),
            records: BTreeMap::new(),
        }
    }

    /// Registers the root instance. Only valid on an empty table.
    pub fn allocate_root(&mut self) -> Result<InstanceId, InvariantViolation> {
        if !self.records.is_empty() {
            return Err(InvariantViolation::DuplicateRoot);
        }
        let id = InstanceId::ROOT;
        self.next_id = id.get() + 1;
        self.records.insert(id, InstanceRecord::new(id, None, 0));
        Ok(id)
    }

    /// Registers a child of `parent` in the Running state.
    ///
    /// Budgets are checked before anything is mutated.
    pub fn allocate(&mut self, parent: InstanceId) -> Result<InstanceId, AllocateError> {
        let parent_depth = self
            .records
            .get(&parent)
            .map(|record| record.depth)
            .ok_or_else(|| SyscallError::invalid_instance(parent))?;

        if self.running_count() >= self.max_instances {
            return Err(SyscallError::exhausted(ResourceKind::Instances, self.max_instances as u64).into());
        }
        let depth = parent_depth + 1;
        if depth > self.max_depth {
            return Err(SyscallError::exhausted(ResourceKind::Depth, u64::from(self.max_depth)).into());
        }
        let id = InstanceId::from_raw(self.next_id);
        let next_id = self
            .next_id
            .checked_add(1)
            .ok_or_else(|| SyscallError::exhausted(ResourceKind::Identities, u64::MAX))?;
        if self.records.contains_key(&id) {
            return Err(InvariantViolation::IdentityCollision { instance: id }.into());
        }

        self.next_id = next_id;
        self.records.insert(id, InstanceRecord::new(id, Some(parent), depth));
        Ok(id)
    }

    /// Records termination. Wakes every joiner of `id`.
    pub fn mark_exited(
        &mut self,
        id: InstanceId,
        exit_code: i8,
        fault: Option<String>,
    ) -> Result<(), InvariantViolation> {
        let record = self
            .records
            .get_mut(&id)
            .ok_or(InvariantViolation::UnknownInstance { instance: id })?;
        if record.state.is_exited() {
            return Err(InvariantViolation::DoubleExit { instance: id });
        }

        record.state = InstanceState::Exited { exit_code };
        record.fault = fault;
        record.exit.send_replace(Some(exit_code));
        Ok(())
    }

    /// Looks up a record.
    #[must_use]
    pub fn lookup(&self, id: InstanceId) -> Option<&InstanceRecord> {
        self.records.get(&id)
    }

    /// Returns the direct children of `parent`, in identity order.
    #[must_use]
    pub fn children_of(&self, parent: InstanceId) -> Vec<InstanceId> {
        self.records
            .values()
            .filter(|record| record.parent == Some(parent))
            .map(|record| record.id)
            .collect()
    }

    /// Number of instances still running.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.records
            .values()
            .filter(|record| !record.state.is_exited())
            .count()
    }

    /// Total number of records, exited ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if no instance was ever allocated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All records in identity order.
    pub fn records(&self) -> impl Iterator<Item = &InstanceRecord> {
        self.records.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> InstanceTable {
        let mut table = InstanceTable::new(4, 2);
        table.allocate_root().unwrap();
        table
    }

    #[test]
    fn test_root_is_zero_and_unique() {
        let mut table = table();
        assert!(table.lookup(InstanceId::ROOT).is_some());
        assert_eq!(table.allocate_root(), Err(InvariantViolation::DuplicateRoot));
    }

    #[test]
    fn test_allocate_children() {
        let mut table = table();
        let a = table.allocate(InstanceId::ROOT).unwrap();
        let b = table.allocate(InstanceId::ROOT).unwrap();

        assert_ne!(a, b);
        assert_eq!(a.get(), 1);
        assert_eq!(table.lookup(b).unwrap().parent, Some(InstanceId::ROOT));
        assert_eq!(table.children_of(InstanceId::ROOT), vec![a, b]);
        assert_eq!(table.running_count(), 3);
    }

    #[test]
    fn test_instance_budget_counts_running_only() {
        let mut table = table();
        let ids: Vec<_> = (0..3).map(|_| table.allocate(InstanceId::ROOT).unwrap()).collect();

        let err = table.allocate(InstanceId::ROOT).unwrap_err();
        assert_eq!(
            err,
            AllocateError::Denied(SyscallError::exhausted(ResourceKind::Instances, 4))
        );

        table.mark_exited(ids[0], 0, None).unwrap();
        assert!(table.allocate(InstanceId::ROOT).is_ok());
    }

    #[test]
    fn test_depth_budget() {
        let mut table = table();
        let a = table.allocate(InstanceId::ROOT).unwrap();
        let b = table.allocate(a).unwrap();

        let err = table.allocate(b).unwrap_err();
        assert_eq!(
            err,
            AllocateError::Denied(SyscallError::exhausted(ResourceKind::Depth, 2))
        );
        assert_eq!(table.len(), 3);
    }

    #[test]
    fn test_mark_exited_once() {
        let mut table = table();
        let a = table.allocate(InstanceId::ROOT).unwrap();

        table.mark_exited(a, -7, None).unwrap();
        assert_eq!(table.lookup(a).unwrap().exit_code(), Some(-7));
        assert_eq!(
            table.mark_exited(a, 0, None),
            Err(InvariantViolation::DoubleExit { instance: a })
        );
        assert_eq!(
            table.mark_exited(InstanceId::from_raw(42), 0, None),
            Err(InvariantViolation::UnknownInstance {
                instance: InstanceId::from_raw(42)
            })
        );
    }

    #[test]
    fn test_late_subscriber_sees_exit_code() {
        let mut table = table();
        let a = table.allocate(InstanceId::ROOT).unwrap();
        table.mark_exited(a, 3, None).unwrap();

        let rx = table.lookup(a).unwrap().subscribe();
        assert_eq!(*rx.borrow(), Some(3));
    }
}
