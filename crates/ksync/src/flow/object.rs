// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use super::entry::{hash_id_of, set_hash_id_of, FlowSyncEntry};
use crate::deps::DependencyGraph;
use crate::entry::EntryArc;
use crate::object::EntryObject;
use crate::transport::Transport;

/// One flow shard's registry: its own tree and its own send queue, with
/// per-event tracing disabled (flow churn would swamp the trace).
pub struct FlowObject {
    object: Arc<EntryObject>,
    shard: usize,
}

impl FlowObject {
    pub fn new(
        shard: usize,
        graph: Arc<DependencyGraph>,
        sock: Arc<Transport>,
    ) -> Arc<Self> {
        let object = EntryObject::without_event_trace(&format!("flow-{shard}"), graph, sock);
        Arc::new(Self { object, shard })
    }

    pub fn shard(&self) -> usize {
        self.shard
    }

    pub fn object(&self) -> &Arc<EntryObject> {
        &self.object
    }

    /// Re-key `entry` to the slot the datapath assigned, keeping the tree
    /// consistent (an occupant under the new key switches places).
    pub fn update_flow_handle(&self, entry: &Arc<FlowSyncEntry>, index: u32) {
        let arc: EntryArc = entry.clone();
        self.object.change_key(&arc, index, &hash_id_of, &set_hash_id_of);
    }
}

#[cfg(test)]
#[path = "object_tests.rs"]
mod tests;
