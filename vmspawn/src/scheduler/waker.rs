//! Wakers that feed the scheduler's ready set.

use crate::core::InstanceId;
use futures::task::ArcWake;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::task::Waker;

/// Ids of instances that were woken since they were last polled.
pub(crate) type ReadySet = Arc<Mutex<BTreeSet<InstanceId>>>;

struct InstanceWaker {
    id: InstanceId,
    ready: ReadySet,
}

impl ArcWake for InstanceWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.ready.lock().insert(arc_self.id);
    }
}

/// Creates the waker for one instance.
pub(crate) fn instance_waker(id: InstanceId, ready: &ReadySet) -> Waker {
    futures::task::waker(Arc::new(InstanceWaker {
        id,
        ready: Arc::clone(ready),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wake_marks_ready_once() {
        let ready = ReadySet::default();
        let waker = instance_waker(InstanceId::from_raw(3), &ready);

        waker.wake_by_ref();
        waker.clone().wake();
        assert_eq!(ready.lock().iter().copied().collect::<Vec<_>>(), vec![InstanceId::from_raw(3)]);
    }
}
