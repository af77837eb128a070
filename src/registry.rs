// ABOUTME: Logical name to container handle map owned by a runtime session.
// ABOUTME: Each entry carries its cached state and a per-handle operation lock.

use crate::runtime::ContainerError;
use crate::state::LifecycleState;
use crate::types::{ContainerId, LogicalName};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex as ScopeLock, OwnedMutexGuard};

/// Snapshot of a registered container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerHandle {
    pub name: LogicalName,
    pub id: ContainerId,
    pub state: LifecycleState,
    pub created_at: DateTime<Utc>,
}

impl ContainerHandle {
    pub fn new(name: LogicalName, id: ContainerId, state: LifecycleState) -> Self {
        Self {
            name,
            id,
            state,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct States {
    current: LifecycleState,
    /// Last state observed that was not `Unknown`.
    confirmed: LifecycleState,
    /// Bumped by every state change this session performed.
    generation: u64,
}

/// Point in a handle's history at which an observation started.
///
/// An observation taken before a later [`HandleEntry::set_state`] describes
/// the container as it was before that operation and is discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation(u64);

/// A live registry entry shared by the dispatcher and the poller.
#[derive(Debug)]
pub struct HandleEntry {
    name: LogicalName,
    id: ContainerId,
    created_at: DateTime<Utc>,
    states: Mutex<States>,
    scope: Arc<ScopeLock<()>>,
    removed: AtomicBool,
}

impl HandleEntry {
    fn new(handle: ContainerHandle) -> Self {
        Self {
            name: handle.name,
            id: handle.id,
            created_at: handle.created_at,
            states: Mutex::new(States {
                current: handle.state,
                confirmed: handle.state,
                generation: 0,
            }),
            scope: Arc::new(ScopeLock::new(())),
            removed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &LogicalName {
        &self.name
    }

    pub fn id(&self) -> &ContainerId {
        &self.id
    }

    pub fn state(&self) -> LifecycleState {
        self.states.lock().current
    }

    pub fn confirmed_state(&self) -> LifecycleState {
        self.states.lock().confirmed
    }

    pub fn snapshot(&self) -> ContainerHandle {
        ContainerHandle {
            name: self.name.clone(),
            id: self.id.clone(),
            state: self.state(),
            created_at: self.created_at,
        }
    }

    /// Wait for exclusive use of this handle.
    pub async fn lock_scope(&self) -> OwnedMutexGuard<()> {
        self.scope.clone().lock_owned().await
    }

    pub fn try_lock_scope(&self) -> Option<OwnedMutexGuard<()>> {
        self.scope.clone().try_lock_owned().ok()
    }

    /// Take before asking the backend, pass to [`HandleEntry::apply_observed`].
    pub fn generation(&self) -> Generation {
        Generation(self.states.lock().generation)
    }

    /// Record the outcome of an operation this session performed.
    pub fn set_state(&self, state: LifecycleState) {
        let mut states = self.states.lock();
        states.generation += 1;
        states.current = state;
        if state != LifecycleState::Unknown {
            states.confirmed = state;
        }
    }

    /// Apply a state observed on the backend if it is a legal forward move.
    ///
    /// Returns whether the cached state changed. An observation started
    /// before `since` was superseded by a later operation and is ignored.
    /// Legality is judged against the last confirmed state, so an `Unknown`
    /// in between never opens a way back from `Exited`. A refused observation
    /// still proves the backend answered, so an `Unknown` cache falls back to
    /// the confirmed state.
    pub fn apply_observed(&self, since: Generation, observed: LifecycleState) -> bool {
        let mut states = self.states.lock();
        if states.generation != since.0 {
            return false;
        }
        if observed == LifecycleState::Unknown {
            let changed = states.current != LifecycleState::Unknown;
            states.current = LifecycleState::Unknown;
            return changed;
        }
        let next = states.confirmed.merge_observed(observed);
        if !states.confirmed.can_transition_to(next) {
            let changed = states.current != states.confirmed;
            states.current = states.confirmed;
            return changed;
        }
        let changed = states.current != next;
        states.current = next;
        states.confirmed = next;
        changed
    }

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_removed(&self) {
        self.removed.store(true, Ordering::Release);
    }
}

/// In-memory map of logical names to handles. Performs no I/O.
#[derive(Debug, Default)]
pub struct Registry {
    entries: RwLock<HashMap<LogicalName, Arc<HandleEntry>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handle. Fails with `AlreadyExists` if the name is taken.
    pub fn register(&self, handle: ContainerHandle) -> Result<Arc<HandleEntry>, ContainerError> {
        let mut entries = self.entries.write();
        if entries.contains_key(&handle.name) {
            return Err(ContainerError::AlreadyExists(handle.name.to_string()));
        }
        let name = handle.name.clone();
        let entry = Arc::new(HandleEntry::new(handle));
        entries.insert(name, entry.clone());
        Ok(entry)
    }

    pub fn entry(&self, name: &str) -> Result<Arc<HandleEntry>, ContainerError> {
        self.entries
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| ContainerError::NotFound(name.to_string()))
    }

    pub fn resolve(&self, name: &str) -> Result<ContainerHandle, ContainerError> {
        self.entry(name).map(|e| e.snapshot())
    }

    pub fn find_by_id(&self, id: &ContainerId) -> Option<ContainerHandle> {
        self.entries
            .read()
            .values()
            .find(|e| e.id() == id)
            .map(|e| e.snapshot())
    }

    /// Remove a handle by name. Removing an absent name is not an error.
    pub fn unregister(&self, name: &str) -> Option<ContainerHandle> {
        self.entries.write().remove(name).map(|e| {
            e.mark_removed();
            e.snapshot()
        })
    }

    /// Remove `entry` only if it is still the one registered under its name.
    pub(crate) fn unregister_entry(&self, entry: &Arc<HandleEntry>) {
        let mut entries = self.entries.write();
        if entries
            .get(entry.name())
            .is_some_and(|current| Arc::ptr_eq(current, entry))
        {
            entries.remove(entry.name());
        }
        entry.mark_removed();
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    /// All handles, ordered by name.
    pub fn list(&self) -> Vec<ContainerHandle> {
        let mut handles: Vec<_> = self.entries.read().values().map(|e| e.snapshot()).collect();
        handles.sort_by(|a, b| a.name.cmp(&b.name));
        handles
    }

    pub(crate) fn entries(&self) -> Vec<Arc<HandleEntry>> {
        self.entries.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop every handle, marking each as removed.
    pub fn clear(&self) {
        for (_, entry) in self.entries.write().drain() {
            entry.mark_removed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleState::*;

    fn handle(name: &str, state: LifecycleState) -> ContainerHandle {
        ContainerHandle::new(
            LogicalName::new(name).unwrap(),
            ContainerId::new(format!("id-{name}")),
            state,
        )
    }

    #[test]
    fn observed_exit_is_final() {
        let registry = Registry::new();
        let entry = registry.register(handle("web", Running)).unwrap();

        let seen = entry.generation();
        assert!(entry.apply_observed(seen, Exited(Some(1))));
        assert!(entry.apply_observed(seen, Unknown));
        assert!(entry.apply_observed(seen, Running));
        assert_eq!(entry.state(), Exited(Some(1)));
    }

    #[test]
    fn unknown_keeps_confirmed_state() {
        let registry = Registry::new();
        let entry = registry.register(handle("web", Running)).unwrap();

        entry.apply_observed(entry.generation(), Unknown);
        assert_eq!(entry.state(), Unknown);
        assert_eq!(entry.confirmed_state(), Running);

        assert!(entry.apply_observed(entry.generation(), Paused));
        assert_eq!(entry.confirmed_state(), Paused);
    }

    #[test]
    fn observation_older_than_an_operation_is_dropped() {
        let registry = Registry::new();
        let entry = registry.register(handle("web", Running)).unwrap();

        let before_pause = entry.generation();
        entry.set_state(Paused);
        assert!(!entry.apply_observed(before_pause, Running));
        assert_eq!(entry.state(), Paused);

        assert!(entry.apply_observed(entry.generation(), Running));
        assert_eq!(entry.state(), Running);
    }

    #[test]
    fn stale_entry_does_not_evict_successor() {
        let registry = Registry::new();
        let first = registry.register(handle("web", Created)).unwrap();
        registry.unregister("web");
        let second = registry.register(handle("web", Created)).unwrap();

        registry.unregister_entry(&first);
        assert!(registry.contains("web"));
        assert!(first.is_removed());
        assert!(!second.is_removed());
    }

    #[test]
    fn list_is_sorted_by_name() {
        let registry = Registry::new();
        for name in ["db", "api", "cache"] {
            registry.register(handle(name, Created)).unwrap();
        }
        let names: Vec<_> = registry.list().into_iter().map(|h| h.name.to_string()).collect();
        assert_eq!(names, ["api", "cache", "db"]);
    }
}
