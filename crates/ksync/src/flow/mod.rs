// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Flow-specific synchronization: sharded entry objects, datapath-assigned
//! slot indices, and generation-id arbitration.

pub mod entry;
pub mod index;
pub mod object;

pub use entry::FlowSyncEntry;
pub use index::FlowIndexManager;
pub use object::FlowObject;

use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering as MemOrder};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::entry::EntryRef;

/// Slot value for flows whose index the datapath has not assigned yet.
pub const INVALID_FLOW_HANDLE: u32 = u32::MAX;

/// Window for deciding that an incoming generation id is ahead of the
/// current one, accounting for 8-bit wraparound: half the range.
pub const ACTIVE_GEN_ID_DIFF_MAX: u8 = 127;

/// Is `incoming` strictly ahead of `current` modulo 256?
pub fn gen_id_newer(current: u8, incoming: u8) -> bool {
    let diff = incoming.wrapping_sub(current);
    diff != 0 && diff < ACTIVE_GEN_ID_DIFF_MAX
}

/// 5-tuple plus the receiving next-hop, identifying one flow.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FlowKey {
    pub nh_id: u32,
    pub src: IpAddr,
    pub dst: IpAddr,
    pub proto: u8,
    pub src_port: u16,
    pub dst_port: u16,
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{} proto {} nh {}",
            self.src, self.src_port, self.dst, self.dst_port, self.proto, self.nh_id
        )
    }
}

/// Shard owning a flow. Partitioning is stable so a given flow always lands
/// on the same flow object and send queue.
pub fn shard_for_key(key: &FlowKey, shards: usize) -> usize {
    // FNV-1a over the canonical key bytes.
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    let mut eat = |b: u8| {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    };
    for b in key.nh_id.to_le_bytes() {
        eat(b);
    }
    match (&key.src, &key.dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            for b in s.octets().iter().chain(d.octets().iter()) {
                eat(*b);
            }
        }
        (s, d) => {
            for b in format!("{s}{d}").bytes() {
                eat(b);
            }
        }
    }
    eat(key.proto);
    for b in key.src_port.to_le_bytes().iter().chain(key.dst_port.to_le_bytes().iter()) {
        eat(*b);
    }
    (hash % shards.max(1) as u64) as usize
}

/// Typed handle pairing the concrete flow entry with the counted reference
/// that keeps it alive.
#[derive(Clone)]
pub struct FlowEntryHandle {
    pub entry: Arc<FlowSyncEntry>,
    pub counted: EntryRef,
}

/// One flow as the flow-processing layer sees it: the key, the slot handle
/// and generation the datapath knows it by, and the link to its ksync entry.
pub struct Flow {
    key: FlowKey,
    handle: AtomicU32,
    gen_id: AtomicU8,
    deleted: AtomicBool,
    ksync: Mutex<Option<FlowEntryHandle>>,
}

impl Flow {
    pub fn new(key: FlowKey) -> Arc<Self> {
        Self::with_handle(key, INVALID_FLOW_HANDLE, 0)
    }

    pub fn with_handle(key: FlowKey, handle: u32, gen_id: u8) -> Arc<Self> {
        Arc::new(Self {
            key,
            handle: AtomicU32::new(handle),
            gen_id: AtomicU8::new(gen_id),
            deleted: AtomicBool::new(false),
            ksync: Mutex::new(None),
        })
    }

    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    pub fn handle(&self) -> u32 {
        self.handle.load(MemOrder::Relaxed)
    }

    pub fn gen_id(&self) -> u8 {
        self.gen_id.load(MemOrder::Relaxed)
    }

    pub fn set_handle(&self, handle: u32, gen_id: u8) {
        self.handle.store(handle, MemOrder::Relaxed);
        self.gen_id.store(gen_id, MemOrder::Relaxed);
    }

    pub fn deleted(&self) -> bool {
        self.deleted.load(MemOrder::Relaxed)
    }

    pub fn mark_deleted(&self) {
        self.deleted.store(true, MemOrder::Relaxed);
    }

    pub fn ksync(&self) -> Option<FlowEntryHandle> {
        self.ksync.lock().clone()
    }

    pub(crate) fn set_ksync(&self, handle: Option<FlowEntryHandle>) {
        *self.ksync.lock() = handle;
    }

    pub(crate) fn take_ksync(&self) -> Option<FlowEntryHandle> {
        self.ksync.lock().take()
    }
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow")
            .field("key", &self.key.to_string())
            .field("handle", &self.handle())
            .field("gen_id", &self.gen_id())
            .field("deleted", &self.deleted())
            .finish()
    }
}

/// Callbacks into the flow-processing layer.
pub trait FlowEventSink: Send + Sync {
    /// A flow lost its slot (or lost the race for one) and must be torn
    /// down by its owner.
    fn evict(&self, flow: &Arc<Flow>, index: u32, gen_id: u8, evict_gen_id: u8);

    /// The audit sweep found a slot abandoned in HOLD; the owner creates a
    /// short flow for the key to drive proper deletion.
    fn audit_short_flow(&self, key: &FlowKey, index: u32);
}

#[cfg(test)]
#[path = "flow_tests.rs"]
mod tests;
