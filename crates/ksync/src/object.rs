// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-type entry registry: an ordered set of entries keyed by their own
//! total order, the index allocator, the state-machine event loop, and the
//! stale-entry lifecycle used across graceful restart.

use std::any::Any;
use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering as MemOrder};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::{Mutex, ReentrantMutex};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::deps::DependencyGraph;
use crate::entry::{
    entry_id, is_deleted, EntryArc, EntryCore, EntryRef, SyncEntry, SyncEvent, SyncState,
    INVALID_INDEX,
};
use crate::index::IndexTable;
use crate::machine;
use crate::transport::Transport;

/// Tree key: the entry itself, ordered by its type's `cmp_key`.
struct EntryKey(EntryArc);

impl PartialEq for EntryKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for EntryKey {}

impl PartialOrd for EntryKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EntryKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp_key(&*other.0)
    }
}

struct ObjectInner {
    tree: BTreeMap<EntryKey, EntryRef>,
    index_table: Option<IndexTable>,
    /// Entries created by [`EntryObject::create_stale`], keyed by identity.
    stale: BTreeMap<usize, EntryRef>,
}

#[derive(Clone, Copy)]
struct StaleCleanup {
    interval: Duration,
    entries_per_interval: usize,
}

/// A named, type-specialized registry of entries.
///
/// The reentrant lock serializes every state transition of entries owned by
/// this object and every dependency-graph edit initiated from it.
pub struct EntryObject {
    name: String,
    need_index: bool,
    /// Disabled for high-churn types (flows) where per-event tracing is too
    /// expensive.
    event_trace: bool,
    delete_scheduled: AtomicBool,
    graph: Arc<DependencyGraph>,
    sock: Arc<Transport>,
    inner: ReentrantMutex<RefCell<ObjectInner>>,
    stale_cfg: Mutex<Option<StaleCleanup>>,
    stale_wake: Notify,
}

impl EntryObject {
    pub fn new(name: &str, graph: Arc<DependencyGraph>, sock: Arc<Transport>) -> Arc<Self> {
        Self::build(name, graph, sock, None, true)
    }

    /// Registry whose entries need dense indices, sized to `max_index`.
    pub fn with_index_table(
        name: &str,
        graph: Arc<DependencyGraph>,
        sock: Arc<Transport>,
        max_index: usize,
    ) -> Arc<Self> {
        Self::build(name, graph, sock, Some(max_index), true)
    }

    pub fn without_event_trace(
        name: &str,
        graph: Arc<DependencyGraph>,
        sock: Arc<Transport>,
    ) -> Arc<Self> {
        Self::build(name, graph, sock, None, false)
    }

    fn build(
        name: &str,
        graph: Arc<DependencyGraph>,
        sock: Arc<Transport>,
        max_index: Option<usize>,
        event_trace: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            need_index: max_index.is_some(),
            event_trace,
            delete_scheduled: AtomicBool::new(false),
            graph,
            sock,
            inner: ReentrantMutex::new(RefCell::new(ObjectInner {
                tree: BTreeMap::new(),
                index_table: max_index.map(IndexTable::new),
                stale: BTreeMap::new(),
            })),
            stale_cfg: Mutex::new(None),
            stale_wake: Notify::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn needs_index(&self) -> bool {
        self.need_index
    }

    pub(crate) fn graph(&self) -> &Arc<DependencyGraph> {
        &self.graph
    }

    pub(crate) fn sock(&self) -> &Arc<Transport> {
        &self.sock
    }

    pub fn is_empty(&self) -> bool {
        let guard = self.inner.lock();
        let empty = guard.borrow().tree.is_empty();
        empty
    }

    pub fn len(&self) -> usize {
        let guard = self.inner.lock();
        let len = guard.borrow().tree.len();
        len
    }

    pub fn delete_scheduled(&self) -> bool {
        self.delete_scheduled.load(MemOrder::Relaxed)
    }

    pub(crate) fn set_delete_scheduled(&self) {
        self.delete_scheduled.store(true, MemOrder::Relaxed);
    }

    /// Look up an entry matching `key`.
    pub fn find(&self, key: &EntryArc) -> Option<EntryRef> {
        let guard = self.inner.lock();
        let found = guard.borrow().tree.get(&EntryKey(key.clone())).cloned();
        found
    }

    /// Entry ordered immediately after `prev` (or the first entry), used by
    /// the batched object deleter.
    pub fn next_after(&self, prev: Option<&EntryArc>) -> Option<EntryRef> {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        let next = match prev {
            None => inner.tree.values().next().cloned(),
            Some(e) => inner
                .tree
                .range((Bound::Excluded(EntryKey(e.clone())), Bound::Unbounded))
                .map(|(_, v)| v.clone())
                .next(),
        };
        next
    }

    /// Adopt `key` as a new entry (allocating an index when the type uses
    /// them), or return the entry already stored under the same key.
    fn create_impl(&self, key: &EntryArc) -> EntryRef {
        // New entries must not appear on an object draining for deletion.
        assert!(!self.delete_scheduled());

        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        if let Some(existing) = inner.tree.get(&EntryKey(key.clone())) {
            return existing.clone();
        }
        if self.need_index && key.core().index() == INVALID_INDEX {
            let table = inner.index_table.as_mut();
            let index = table.map(|t| t.alloc());
            if let Some(index) = index {
                key.core().set_index(index);
            }
        }
        inner.tree.insert(EntryKey(key.clone()), EntryRef::new(key.clone()));
        EntryRef::new(key.clone())
    }

    fn clear_stale(&self, entry: &EntryArc) {
        entry.core().set_stale(false);
        let guard = self.inner.lock();
        let removed = guard.borrow_mut().stale.remove(&entry_id(entry));
        drop(guard);
        drop(removed);
    }

    /// Create or revive the entry for `key` and fire `AddChangeReq`.
    pub fn create(self: &Arc<Self>, key: &EntryArc) -> EntryRef {
        self.create_lookup(key, false)
    }

    /// Create without the lookup. Callers use this when the key is known
    /// absent (flows, whose keys are unique per submission).
    pub fn create_no_lookup(self: &Arc<Self>, key: &EntryArc) -> EntryRef {
        self.create_lookup(key, true)
    }

    fn create_lookup(self: &Arc<Self>, key: &EntryArc, no_lookup: bool) -> EntryRef {
        let guard = self.inner.lock();

        let found = if no_lookup { None } else { self.find(key) };
        let entry = match found {
            None => self.create_impl(key),
            Some(existing) => {
                if existing.core().stale() {
                    self.clear_stale(existing.entry());
                } else {
                    // A live entry may only be re-created out of TEMP or a
                    // deleted state; anything else is a caller bug.
                    assert!(
                        existing.core().state() == SyncState::Temp
                            || is_deleted(&*existing),
                        "create on live entry {}",
                        existing.describe()
                    );
                }
                existing
            }
        };

        self.notify(entry.entry(), SyncEvent::AddChangeReq);
        drop(guard);
        entry
    }

    /// Create an entry marked stale. It joins the stale sub-set and is
    /// swept by the cleanup timer unless re-claimed first. Returns `None`
    /// when a live entry already holds the key.
    pub fn create_stale(self: &Arc<Self>, key: &EntryArc) -> Option<EntryRef> {
        assert!(
            self.stale_cfg.lock().is_some(),
            "create_stale before init_stale_cleanup on {}",
            self.name
        );
        let guard = self.inner.lock();

        let entry = match self.find(key) {
            None => self.create_impl(key),
            Some(existing) => {
                if existing.core().state() != SyncState::Temp && !is_deleted(&*existing) {
                    return None;
                }
                // Disassociate from the upstream record so nothing operates
                // on the entry without re-claiming it.
                existing.cleanup_on_del();
                existing
            }
        };

        entry.core().set_stale(true);
        guard
            .borrow_mut()
            .stale
            .insert(entry.id(), entry.clone());

        self.notify(entry.entry(), SyncEvent::AddChangeReq);
        drop(guard);
        self.stale_wake.notify_one();
        Some(entry)
    }

    /// Look up or allocate in TEMP state, without firing any event. The
    /// returned entry exists only to back a reference held by another entry.
    pub fn get_reference(&self, key: &EntryArc) -> EntryRef {
        let guard = self.inner.lock();
        let entry = match self.find(key) {
            Some(existing) => existing,
            None => {
                let created = self.create_impl(key);
                created.core().set_state(SyncState::Temp);
                created
            }
        };
        drop(guard);
        entry
    }

    /// Request a sync of a changed entry.
    pub fn change(self: &Arc<Self>, entry: &EntryArc) {
        self.safe_notify(entry, SyncEvent::AddChangeReq);
    }

    /// Request deletion of an entry.
    pub fn delete(self: &Arc<Self>, entry: &EntryArc) {
        let guard = self.inner.lock();
        if entry.core().stale() {
            self.clear_stale(entry);
        }
        self.notify(entry, SyncEvent::DelReq);
        drop(guard);
    }

    /// Deliver `event` with the object lock held.
    pub fn safe_notify(self: &Arc<Self>, entry: &EntryArc, event: SyncEvent) {
        let guard = self.inner.lock();
        self.notify(entry, event);
        drop(guard);
    }

    /// Central state-machine driver. Callers must hold the object lock (the
    /// lock is reentrant, so `safe_notify` is always a correct wrapper).
    pub(crate) fn notify(self: &Arc<Self>, entry: &EntryArc, event: SyncEvent) {
        let from = entry.core().state();
        if self.event_trace {
            debug!(
                object = %self.name,
                entry = %entry.describe(),
                state = %from,
                refcount = entry.core().refcount(),
                event = %event,
                "state machine event"
            );
        }

        let next = machine::transition(self, entry, event);
        entry.core().set_state(next);

        if machine::should_re_eval(entry, from) {
            self.graph.re_eval(entry);
        }

        if next == SyncState::FreeWait || next == SyncState::Temp {
            entry.cleanup_on_del();
        }

        if next == SyncState::FreeWait {
            self.free(entry);
        }

        if self.is_empty() {
            entry.empty_table();
        }
    }

    /// Remove a FREE_WAIT entry from the tree and release its index. The
    /// entry's storage is reclaimed when the last outstanding handle drops.
    fn free(&self, entry: &EntryArc) {
        let guard = self.inner.lock();
        let removed = {
            let mut inner = guard.borrow_mut();
            let removed = inner.tree.remove(&EntryKey(entry.clone()));
            assert!(removed.is_some(), "freeing entry not in tree");
            let index = entry.core().index();
            if self.need_index && index != INVALID_INDEX {
                if let Some(table) = inner.index_table.as_mut() {
                    table.free(index);
                }
                entry.core().set_index(INVALID_INDEX);
            }
            removed
        };
        drop(guard);
        drop(removed);
    }

    /// Re-key `entry` under `arg`, swapping keys with an existing occupant
    /// so both stay addressable. Used when the datapath assigns a new flow
    /// handle to an entry submitted with an invalid one.
    pub fn change_key(
        &self,
        entry: &EntryArc,
        arg: u32,
        get_key: &dyn Fn(&EntryArc) -> u32,
        set_key: &dyn Fn(&EntryArc, u32),
    ) {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();

        let node = inner.tree.remove(&EntryKey(entry.clone()));
        let node = match node {
            Some(n) => n,
            None => {
                unreachable!("change_key on entry not in tree: {}", entry.describe())
            }
        };
        let old_key = get_key(entry);
        set_key(entry, arg);

        if inner.tree.contains_key(&EntryKey(entry.clone())) {
            // Occupied: switch places with the existing holder.
            let occupant = inner.tree.remove(&EntryKey(entry.clone()));
            if let Some(occupant) = occupant {
                set_key(occupant.entry(), old_key);
                let prior =
                    inner.tree.insert(EntryKey(occupant.entry().clone()), occupant);
                assert!(prior.is_none());
            }
        }
        let prior = inner.tree.insert(EntryKey(entry.clone()), node);
        assert!(prior.is_none());
    }

    /// Arm the stale-entry sweep. Each tick deletes up to
    /// `entries_per_interval` stale entries; the timer quiesces while the
    /// stale set is empty and is kicked by the next `create_stale`.
    pub fn init_stale_cleanup(
        self: &Arc<Self>,
        interval: Duration,
        entries_per_interval: usize,
        shutdown: CancellationToken,
    ) {
        self.configure_stale_cleanup(interval, entries_per_interval);

        let object = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if !object.stale_cleanup_tick() {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = object.stale_wake.notified() => {}
                    }
                }
            }
        });
    }

    /// Set the sweep quota without arming the timer; tests drive the sweep
    /// by calling [`EntryObject::stale_cleanup_tick`] directly.
    pub fn configure_stale_cleanup(&self, interval: Duration, entries_per_interval: usize) {
        let mut cfg = self.stale_cfg.lock();
        assert!(cfg.is_none(), "stale cleanup initialized twice on {}", self.name);
        *cfg = Some(StaleCleanup { interval, entries_per_interval });
    }

    /// One sweep step: delete up to the per-interval quota of stale entries.
    /// Returns true while stale entries remain (the timer reschedules).
    pub fn stale_cleanup_tick(self: &Arc<Self>) -> bool {
        let quota = match *self.stale_cfg.lock() {
            Some(cfg) => cfg.entries_per_interval,
            None => return false,
        };

        let batch: Vec<EntryRef> = {
            let guard = self.inner.lock();
            let batch = guard.borrow().stale.values().take(quota).cloned().collect();
            batch
        };
        if batch.is_empty() {
            return false;
        }
        for entry in &batch {
            self.delete(entry.entry());
        }

        let guard = self.inner.lock();
        let remaining = !guard.borrow().stale.is_empty();
        remaining
    }

    /// Diagnostic snapshot of the registry.
    pub fn summary(&self) -> serde_json::Value {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        let states: Vec<serde_json::Value> = inner
            .tree
            .values()
            .map(|e| {
                serde_json::json!({
                    "entry": e.describe(),
                    "state": e.core().state().as_str(),
                    "index": e.core().index(),
                    "refcount": e.core().refcount(),
                    "seen": e.core().seen(),
                    "stale": e.core().stale(),
                })
            })
            .collect();
        serde_json::json!({
            "object": self.name,
            "entries": inner.tree.len(),
            "stale": inner.stale.len(),
            "state": states,
        })
    }
}

impl Drop for EntryObject {
    fn drop(&mut self) {
        let guard = self.inner.lock();
        assert!(
            guard.borrow().tree.is_empty(),
            "object {} destroyed with live entries",
            self.name
        );
    }
}

/// Sentinel entry that never resolves. Registering a back-reference on it
/// parks an incomplete entry indefinitely.
struct DeferSentinel {
    core: EntryCore,
}

impl SyncEntry for DeferSentinel {
    fn core(&self) -> &EntryCore {
        &self.core
    }

    fn object(&self) -> Arc<EntryObject> {
        unreachable!("sentinel entry has no registry")
    }

    fn cmp_key(&self, _other: &dyn SyncEntry) -> Ordering {
        Ordering::Equal
    }

    fn describe(&self) -> String {
        "defer-sentinel".to_string()
    }

    fn is_data_resolved(&self) -> bool {
        false
    }

    fn encode_add(&self, _buf: &mut Vec<u8>) -> usize {
        0
    }

    fn encode_change(&self, _buf: &mut Vec<u8>) -> usize {
        0
    }

    fn encode_delete(&self, _buf: &mut Vec<u8>) -> usize {
        0
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Upstream-table notifier path for source-backed entries: fold the changed
/// record in, and drive the state machine when the datapath image went
/// stale. A logically deleted entry is always re-driven, since reviving it
/// needs a fresh add regardless of what changed.
pub fn notify_source_change<E: crate::entry::SourceBacked>(
    object: &Arc<EntryObject>,
    entry: &Arc<E>,
) {
    let arc: EntryArc = entry.clone();
    let need_sync = is_deleted(&*arc);
    if entry.resync() || need_sync {
        object.safe_notify(&arc, SyncEvent::AddChangeReq);
    }
}

enum ObjectEvent {
    DeleteObject { object: Arc<EntryObject>, resume: Option<EntryRef> },
}

/// Drives asynchronous object teardown: entries are deleted in yield-sized
/// batches on a dedicated task so a large registry cannot starve the
/// state-machine loop.
pub struct ObjectManager {
    tx: mpsc::UnboundedSender<ObjectEvent>,
    defer_entry: OnceLock<EntryRef>,
}

impl ObjectManager {
    /// Entries deleted per scheduling quantum.
    pub const DELETE_BATCH: usize = 128;

    pub fn new(shutdown: CancellationToken) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<ObjectEvent>();
        let manager = Arc::new(Self { tx, defer_entry: OnceLock::new() });

        let weak = Arc::downgrade(&manager);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                let ObjectEvent::DeleteObject { object, resume } = event;
                if let Some(next) = Self::delete_batch(&object, resume) {
                    if let Some(manager) = weak.upgrade() {
                        let _ = manager
                            .tx
                            .send(ObjectEvent::DeleteObject { object, resume: Some(next) });
                    }
                    tokio::task::yield_now().await;
                }
            }
        });
        manager
    }

    /// Schedule deletion of every entry in `object`. New creates on the
    /// object are refused from this point on.
    pub fn delete_object(&self, object: &Arc<EntryObject>) {
        object.set_delete_scheduled();
        let _ = self
            .tx
            .send(ObjectEvent::DeleteObject { object: Arc::clone(object), resume: None });
    }

    /// One batch of the teardown walk. Returns the entry to resume from, or
    /// `None` when the walk completed. Public so tests can run the walk
    /// synchronously.
    pub fn delete_batch(
        object: &Arc<EntryObject>,
        resume: Option<EntryRef>,
    ) -> Option<EntryRef> {
        object.set_delete_scheduled();

        let mut cursor = match resume {
            Some(entry) => Some(entry),
            None => object.next_after(None),
        };
        let mut count = 0;
        while let Some(entry) = cursor {
            let next = object.next_after(Some(entry.entry()));
            count += 1;
            if !is_deleted(&*entry) {
                object.delete(entry.entry());
            }
            if count == Self::DELETE_BATCH && next.is_some() {
                return next;
            }
            cursor = next;
        }
        None
    }

    /// The always-deferred sentinel: a reference that never resolves, for
    /// parking entries whose own data is incomplete.
    pub fn default_defer_entry(&self) -> EntryRef {
        self.defer_entry
            .get_or_init(|| {
                let sentinel: EntryArc = Arc::new(DeferSentinel { core: EntryCore::new() });
                EntryRef::new(sentinel)
            })
            .clone()
    }
}

#[cfg(test)]
#[path = "object_tests.rs"]
mod tests;
