// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::any::Any;
use std::cmp::Ordering;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering as MemOrder};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::index::FlowIndexManager;
use super::{Flow, INVALID_FLOW_HANDLE};
use crate::entry::{is_resolved, EntryArc, EntryCore, EntryRef, SyncEntry};
use crate::object::EntryObject;
use crate::transport::codec::{self, FlowInfo};
use crate::transport::ResponseInfo;

/// Request ops carried in a flow blob.
pub const FLOW_OP_ADD: u8 = 1;
pub const FLOW_OP_CHANGE: u8 = 2;
pub const FLOW_OP_DELETE: u8 = 3;

/// KSync entry for one flow slot.
///
/// The slot index doubles as the tree key; entries submitted before the
/// datapath assigned a slot carry [`INVALID_FLOW_HANDLE`] and are re-keyed
/// when the assignment arrives. `evict_gen_id` diverging from `gen_id`
/// means this entry lost its slot: every encode turns into a no-op so no
/// further message reaches the datapath for the slot.
pub struct FlowSyncEntry {
    core: EntryCore,
    object: Arc<EntryObject>,
    manager: Weak<FlowIndexManager>,
    weak_self: Weak<FlowSyncEntry>,
    flow: Arc<Flow>,
    hash_id: AtomicU32,
    gen_id: AtomicU8,
    evict_gen_id: AtomicU8,
    /// Generation last confirmed by the datapath for this slot.
    vrouter_gen_id: AtomicU8,
    nh: Mutex<Option<EntryRef>>,
}

impl FlowSyncEntry {
    pub fn new(
        object: Arc<EntryObject>,
        manager: &Arc<FlowIndexManager>,
        flow: Arc<Flow>,
        hash_id: u32,
    ) -> Arc<Self> {
        let gen_id = flow.gen_id();
        Arc::new_cyclic(|weak_self| Self {
            core: EntryCore::new(),
            object,
            manager: Arc::downgrade(manager),
            weak_self: weak_self.clone(),
            flow,
            hash_id: AtomicU32::new(hash_id),
            gen_id: AtomicU8::new(gen_id),
            evict_gen_id: AtomicU8::new(gen_id),
            vrouter_gen_id: AtomicU8::new(gen_id),
            nh: Mutex::new(None),
        })
    }

    pub fn flow(&self) -> &Arc<Flow> {
        &self.flow
    }

    pub fn hash_id(&self) -> u32 {
        self.hash_id.load(MemOrder::Relaxed)
    }

    pub(crate) fn set_hash_id(&self, hash_id: u32) {
        self.hash_id.store(hash_id, MemOrder::Relaxed);
    }

    pub fn gen_id(&self) -> u8 {
        self.gen_id.load(MemOrder::Relaxed)
    }

    pub fn set_gen_id(&self, gen_id: u8) {
        self.gen_id.store(gen_id, MemOrder::Relaxed);
    }

    pub fn evict_gen_id(&self) -> u8 {
        self.evict_gen_id.load(MemOrder::Relaxed)
    }

    pub fn set_evict_gen_id(&self, gen_id: u8) {
        self.evict_gen_id.store(gen_id, MemOrder::Relaxed);
    }

    pub fn vrouter_gen_id(&self) -> u8 {
        self.vrouter_gen_id.load(MemOrder::Relaxed)
    }

    pub(crate) fn set_vrouter_gen_id(&self, gen_id: u8) {
        self.vrouter_gen_id.store(gen_id, MemOrder::Relaxed);
    }

    /// Park this entry on a next-hop (or any other) dependency.
    pub fn set_dependency(&self, dep: Option<EntryRef>) {
        *self.nh.lock() = dep;
    }

    pub(crate) fn weak_self_arc(&self) -> Option<Arc<Self>> {
        self.weak_self.upgrade()
    }

    /// An evicted entry owns a slot generation the datapath has moved past;
    /// it must stay silent.
    pub fn send_disabled(&self) -> bool {
        self.evict_gen_id() != self.gen_id()
    }

    fn encode_op(&self, op: u8, buf: &mut Vec<u8>) -> usize {
        if self.send_disabled() {
            return 0;
        }
        let key = self.flow.key();
        let mut payload = Vec::with_capacity(48);
        payload.push(op);
        payload.extend_from_slice(&self.hash_id().to_le_bytes());
        payload.push(self.gen_id());
        payload.extend_from_slice(&0u16.to_le_bytes());
        payload.extend_from_slice(&key.nh_id.to_le_bytes());
        payload.push(key.proto);
        match (key.src, key.dst) {
            (IpAddr::V4(s), IpAddr::V4(d)) => {
                payload.push(4);
                payload.extend_from_slice(&s.octets());
                payload.extend_from_slice(&d.octets());
            }
            (s, d) => {
                payload.push(6);
                match (s, d) {
                    (IpAddr::V6(s6), IpAddr::V6(d6)) => {
                        payload.extend_from_slice(&s6.octets());
                        payload.extend_from_slice(&d6.octets());
                    }
                    _ => return 0,
                }
            }
        }
        payload.extend_from_slice(&key.src_port.to_le_bytes());
        payload.extend_from_slice(&key.dst_port.to_le_bytes());

        let before = buf.len();
        codec::write_blob(buf, codec::BLOB_FLOW_REQ, &payload);
        buf.len() - before
    }
}

impl SyncEntry for FlowSyncEntry {
    fn core(&self) -> &EntryCore {
        &self.core
    }

    fn object(&self) -> Arc<EntryObject> {
        Arc::clone(&self.object)
    }

    fn cmp_key(&self, other: &dyn SyncEntry) -> Ordering {
        let Some(rhs) = other.as_any().downcast_ref::<FlowSyncEntry>() else {
            unreachable!("flow registry holds a non-flow entry")
        };
        self.hash_id()
            .cmp(&rhs.hash_id())
            .then_with(|| self.flow.key().cmp(rhs.flow.key()))
    }

    fn describe(&self) -> String {
        format!(
            "flow {} handle {} gen {}",
            self.flow.key(),
            self.hash_id(),
            self.gen_id()
        )
    }

    fn unresolved_reference(&self) -> Option<EntryRef> {
        let nh = self.nh.lock();
        match &*nh {
            Some(dep) if !is_resolved(&**dep.entry()) => Some(dep.clone()),
            _ => None,
        }
    }

    // Flows must always issue the wire DELETE: the datapath owns the slot
    // and frees it only on an explicit delete.
    fn allow_delete_state_comp(&self) -> bool {
        false
    }

    fn encode_add(&self, buf: &mut Vec<u8>) -> usize {
        self.encode_op(FLOW_OP_ADD, buf)
    }

    fn encode_change(&self, buf: &mut Vec<u8>) -> usize {
        self.encode_op(FLOW_OP_CHANGE, buf)
    }

    fn encode_delete(&self, buf: &mut Vec<u8>) -> usize {
        self.encode_op(FLOW_OP_DELETE, buf)
    }

    fn response(&self, info: &ResponseInfo) {
        let ResponseInfo::Flow(FlowInfo { index, gen_id, .. }) = info;
        if *index == INVALID_FLOW_HANDLE {
            return;
        }
        if self.hash_id() == *index {
            // Confirmation for a slot this entry already owns; arbitration
            // ran when the slot was acquired.
            self.set_vrouter_gen_id(*gen_id);
            return;
        }
        let Some(manager) = self.manager.upgrade() else {
            return;
        };
        let Some(this) = self.weak_self.upgrade() else {
            return;
        };
        manager.update_flow_handle(&this, *index, *gen_id);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Tree-key accessors used by the registry's re-keying path.
pub(crate) fn hash_id_of(entry: &EntryArc) -> u32 {
    match entry.as_any().downcast_ref::<FlowSyncEntry>() {
        Some(flow) => flow.hash_id(),
        None => unreachable!("flow registry holds a non-flow entry"),
    }
}

pub(crate) fn set_hash_id_of(entry: &EntryArc, hash_id: u32) {
    if let Some(flow) = entry.as_any().downcast_ref::<FlowSyncEntry>() {
        flow.set_hash_id(hash_id);
    }
}

#[cfg(test)]
#[path = "entry_tests.rs"]
mod tests;
