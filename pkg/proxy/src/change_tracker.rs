use pkg_types::names::NamespacedName;
use pkg_types::service::Service;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Net change of one service since the last reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceChange {
    pub previous: Option<Service>,
    pub current: Option<Service>,
}

#[derive(Debug)]
struct Pending {
    seq: u64,
    change: ServiceChange,
}

#[derive(Debug, Default)]
struct Changes {
    next_seq: u64,
    items: HashMap<NamespacedName, Pending>,
}

/// Pending service diffs, collapsed per service name.
///
/// Guarded by its own short-held lock so watch callbacks never wait on the
/// reconciler.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    changes: Mutex<Changes>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Changes> {
        self.changes.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record one notification. The earliest `previous` is kept and
    /// `current` is overwritten; a diff that nets to nothing is dropped.
    ///
    /// Returns true if a diff for the service is now pending.
    pub fn record(&self, previous: Option<&Service>, current: Option<&Service>) -> bool {
        let Some(name) = current.or(previous).map(Service::namespaced_name) else {
            return false;
        };

        let mut changes = self.lock();
        let seq = changes.next_seq;
        let pending = changes.items.entry(name.clone()).or_insert_with(|| Pending {
            seq,
            change: ServiceChange {
                previous: previous.cloned(),
                current: None,
            },
        });
        pending.change.current = current.cloned();
        if pending.seq == seq {
            changes.next_seq += 1;
        }

        let collapsed = changes
            .items
            .get(&name)
            .is_some_and(|p| p.change.previous == p.change.current);
        if collapsed {
            changes.items.remove(&name);
        }
        !collapsed
    }

    /// Swap out every pending diff, oldest service first.
    pub fn take(&self) -> Vec<(NamespacedName, ServiceChange)> {
        let items = std::mem::take(&mut self.lock().items);
        let mut pending: Vec<(NamespacedName, Pending)> = items.into_iter().collect();
        pending.sort_by_key(|(_, p)| p.seq);
        pending.into_iter().map(|(name, p)| (name, p.change)).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }
}
