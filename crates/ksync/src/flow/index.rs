// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Flow slot ownership: which flow holds each datapath flow-table index,
//! and the generation-id arbitration applied when two flows race for one.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::entry::FlowSyncEntry;
use super::object::FlowObject;
use super::{gen_id_newer, Flow, FlowEntryHandle, FlowEventSink, INVALID_FLOW_HANDLE};
use crate::entry::{is_deleted, EntryArc, EntryRef, SyncEntry, SyncEvent};

struct Slot {
    owner: Mutex<Option<Arc<Flow>>>,
}

/// Arbitrates vrouter-assigned flow-table slots between flows.
///
/// A slot's effective owner is `(index, gen_id)`. The slot mutex is held
/// across the acquire/evict decision and the state-machine trigger that
/// follows it, so a datapath-initiated assignment and an agent-initiated
/// update for the same slot serialize.
pub struct FlowIndexManager {
    slots: Vec<Slot>,
    sink: Arc<dyn FlowEventSink>,
}

impl FlowIndexManager {
    pub fn new(count: usize, sink: Arc<dyn FlowEventSink>) -> Arc<Self> {
        let slots = (0..count).map(|_| Slot { owner: Mutex::new(None) }).collect();
        Arc::new(Self { slots, sink })
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn find_by_index(&self, index: u32) -> Option<Arc<Flow>> {
        self.slots.get(index as usize)?.owner.lock().clone()
    }

    /// Run `f` with the slot's owner cell locked. An invalid handle gets a
    /// private throwaway cell so the caller's flow is uniform.
    fn with_slot<R>(&self, index: u32, f: impl FnOnce(&mut Option<Arc<Flow>>) -> R) -> R {
        if index == INVALID_FLOW_HANDLE {
            let mut none = None;
            return f(&mut none);
        }
        let slot = &self.slots[index as usize];
        let mut owner = slot.owner.lock();
        f(&mut owner)
    }

    /// Decide ownership of `(index, gen_id)` for `flow` (`None` when only a
    /// delete key needs fixing). Returns the evict generation the caller
    /// must stamp on its entry: equal to `gen_id` when the acquire
    /// succeeded, the current owner's generation when the incoming flow
    /// lost.
    fn acquire_locked(
        &self,
        owner: &mut Option<Arc<Flow>>,
        index: u32,
        gen_id: u8,
        flow: Option<&Arc<Flow>>,
    ) -> u8 {
        let mut evict_gen_id = gen_id;
        if index == INVALID_FLOW_HANDLE {
            return evict_gen_id;
        }

        let same_owner = match (&*owner, flow) {
            (Some(cur), Some(f)) => Arc::ptr_eq(cur, f),
            (None, _) => {
                *owner = flow.cloned();
                return evict_gen_id;
            }
            _ => false,
        };
        if same_owner {
            return evict_gen_id;
        }

        let cur = match &*owner {
            Some(cur) => Arc::clone(cur),
            None => return evict_gen_id,
        };
        let cur_gen = match cur.ksync() {
            Some(handle) => handle.entry.gen_id(),
            None => cur.gen_id(),
        };

        if gen_id_newer(cur_gen, gen_id) {
            // Incoming is ahead: evict the current occupant.
            if let Some(handle) = cur.ksync() {
                handle.entry.set_evict_gen_id(gen_id);
            }
            debug!(index, cur_gen, gen_id, "evicting slot owner");
            self.sink.evict(&cur, index, cur_gen, gen_id);
            *owner = flow.cloned();
        } else {
            // Incoming belongs to a past generation: it loses the slot.
            evict_gen_id = cur_gen;
            if let Some(f) = flow {
                debug!(index, cur_gen, gen_id, "incoming flow lost slot race");
                self.sink.evict(f, f.handle(), f.gen_id(), evict_gen_id);
            }
        }
        evict_gen_id
    }

    fn release_locked(&self, owner: &mut Option<Arc<Flow>>, flow: &Arc<Flow>) {
        if let Some(cur) = &*owner {
            if Arc::ptr_eq(cur, flow) {
                *owner = None;
            }
        }
    }

    /// Propagate an add or change for `flow` to the datapath. Creates the
    /// ksync entry on first use; a changed flow handle turns into a delete
    /// of the old slot followed by a create for the new one.
    pub fn update(self: &Arc<Self>, object: &Arc<FlowObject>, flow: &Arc<Flow>) {
        assert!(!flow.deleted(), "update on a deleted flow");

        // No counted handle may be held across the delete branch: it would
        // defer the old slot's DELETE behind the new ADD.
        let current_hash = flow.ksync().map(|h| h.entry.hash_id());
        let Some(current_hash) = current_hash else {
            self.create_internal(object, flow);
            return;
        };

        if flow.handle() != current_hash {
            self.delete(object, flow);
            self.create_internal(object, flow);
            return;
        }

        let Some(handle) = flow.ksync() else {
            return;
        };
        self.with_slot(flow.handle(), |owner| {
            let evict = self.acquire_locked(owner, flow.handle(), flow.gen_id(), Some(flow));
            handle.entry.set_gen_id(flow.gen_id());
            handle.entry.set_evict_gen_id(evict);
            let arc: EntryArc = handle.entry.clone();
            object.object().change(&arc);
        });
    }

    fn create_internal(self: &Arc<Self>, object: &Arc<FlowObject>, flow: &Arc<Flow>) {
        self.with_slot(flow.handle(), |owner| {
            let evict = self.acquire_locked(owner, flow.handle(), flow.gen_id(), Some(flow));
            let entry =
                FlowSyncEntry::new(Arc::clone(object.object()), self, Arc::clone(flow), flow.handle());
            entry.set_evict_gen_id(evict);
            let arc: EntryArc = entry.clone();
            let counted = object.object().create_no_lookup(&arc);
            // The create may have revived an entry already in the tree;
            // re-stamp the generations on whatever the registry returned.
            let entry = match counted.entry().as_any().downcast_ref::<FlowSyncEntry>() {
                Some(live) => match live.weak_self_arc() {
                    Some(live) => live,
                    None => entry,
                },
                None => entry,
            };
            entry.set_gen_id(flow.gen_id());
            entry.set_evict_gen_id(evict);
            flow.set_ksync(Some(FlowEntryHandle { entry, counted }));
        });
    }

    /// Propagate a delete for `flow` and release its slot ownership.
    pub fn delete(self: &Arc<Self>, object: &Arc<FlowObject>, flow: &Arc<Flow>) {
        let Some(handle) = flow.take_ksync() else {
            return;
        };
        self.with_slot(handle.entry.hash_id(), |owner| {
            self.release_locked(owner, flow);
            let arc: EntryArc = handle.entry.clone();
            // The flow's link is already cleared: the delete may complete
            // synchronously and free the entry.
            object.object().delete(&arc);
        });
    }

    /// Suppress all further messages for `flow`'s slot by forcing the evict
    /// generation away from the live one.
    pub fn disable_send(&self, flow: &Arc<Flow>, evict_gen_id: u8) {
        let Some(handle) = flow.ksync() else {
            return;
        };
        self.with_slot(flow.handle(), |_owner| {
            handle.entry.set_evict_gen_id(evict_gen_id);
        });
    }

    /// The datapath assigned `(index, gen_id)` to an entry submitted with an
    /// invalid handle.
    ///
    /// For a live entry the slot is acquired and the entry re-keyed. For an
    /// entry already deleted, only the key used to encode the pending DELETE
    /// is adjusted, and only when the acquire confirms this generation still
    /// owns the slot; re-keying after a lost acquire would address the
    /// in-flight delete to an active entry belonging to someone else.
    pub fn update_flow_handle(self: &Arc<Self>, entry: &Arc<FlowSyncEntry>, index: u32, gen_id: u8) {
        assert_ne!(index, INVALID_FLOW_HANDLE);
        let flow = Arc::clone(entry.flow());
        let object = entry.object();
        let entry_arc: EntryArc = entry.clone();

        if !is_deleted(&*entry_arc) {
            if entry.hash_id() == index && entry.vrouter_gen_id() == gen_id {
                return;
            }
            // Assignment only happens for flows submitted without a handle.
            assert_eq!(flow.handle(), INVALID_FLOW_HANDLE);
            self.with_slot(index, |owner| {
                flow.set_handle(index, gen_id);
                object.change_key(
                    &entry_arc,
                    index,
                    &super::entry::hash_id_of,
                    &super::entry::set_hash_id_of,
                );
                let evict = self.acquire_locked(owner, index, gen_id, Some(&flow));
                entry.set_gen_id(gen_id);
                entry.set_vrouter_gen_id(gen_id);
                entry.set_evict_gen_id(evict);
            });
        } else {
            self.with_slot(index, |owner| {
                let evict = self.acquire_locked(owner, index, gen_id, None);
                if evict == gen_id {
                    object.change_key(
                        &entry_arc,
                        index,
                        &super::entry::hash_id_of,
                        &super::entry::set_hash_id_of,
                    );
                    entry.set_gen_id(gen_id);
                    entry.set_vrouter_gen_id(gen_id);
                    entry.set_evict_gen_id(evict);
                }
            });
        }
    }

    /// Deliver a state-machine event with the slot lock held, so pending
    /// slot operations for the same index serialize with it.
    pub fn trigger_event(&self, entry: &Arc<FlowSyncEntry>, event: SyncEvent) {
        let object = entry.object();
        let arc: EntryArc = entry.clone();
        self.with_slot(entry.hash_id(), |_owner| {
            object.safe_notify(&arc, event);
        });
    }

    /// Keep a counted reference alive for callers that need one outside the
    /// flow link.
    pub fn entry_ref(entry: &Arc<FlowSyncEntry>) -> EntryRef {
        let arc: EntryArc = entry.clone();
        EntryRef::new(arc)
    }
}

#[cfg(test)]
#[path = "index_tests.rs"]
mod tests;
