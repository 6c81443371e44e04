// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use super::FlowObject;
use crate::deps::DependencyGraph;
use crate::entry::EntryArc;
use crate::flow::entry::FlowSyncEntry;
use crate::flow::index::FlowIndexManager;
use crate::flow::{Flow, FlowEntryHandle, FlowKey, INVALID_FLOW_HANDLE};
use crate::test_support::{inline_transport, RecordingSink};

fn key(src_port: u16) -> FlowKey {
    FlowKey {
        nh_id: 1,
        src: "172.16.0.1".parse().unwrap_or_else(|_| unreachable!()),
        dst: "172.16.0.2".parse().unwrap_or_else(|_| unreachable!()),
        proto: 6,
        src_port,
        dst_port: 443,
    }
}

struct Fixture {
    object: Arc<FlowObject>,
    manager: Arc<FlowIndexManager>,
    transport: Arc<crate::transport::Transport>,
}

fn setup() -> Fixture {
    let graph = DependencyGraph::new();
    let (transport, _wire) = inline_transport();
    let object = FlowObject::new(0, graph, transport.clone());
    let manager = FlowIndexManager::new(64, RecordingSink::new());
    Fixture { object, manager, transport }
}

fn insert(f: &Fixture, flow: &Arc<Flow>, hash: u32) -> Arc<FlowSyncEntry> {
    let entry =
        FlowSyncEntry::new(Arc::clone(f.object.object()), &f.manager, Arc::clone(flow), hash);
    let arc: EntryArc = entry.clone();
    let counted = f.object.object().create_no_lookup(&arc);
    flow.set_ksync(Some(FlowEntryHandle { entry: entry.clone(), counted }));
    entry
}

#[test]
fn rekey_moves_entry_to_new_handle() {
    let f = setup();
    let flow = Flow::with_handle(key(1), INVALID_FLOW_HANDLE, 0);
    let entry = insert(&f, &flow, INVALID_FLOW_HANDLE);
    f.transport.drain_inline();

    f.object.update_flow_handle(&entry, 9);
    assert_eq!(entry.hash_id(), 9);

    // Still findable under the new key.
    let probe = FlowSyncEntry::new(
        Arc::clone(f.object.object()),
        &f.manager,
        Arc::clone(&flow),
        9,
    );
    let probe_arc: EntryArc = probe;
    assert!(f.object.object().find(&probe_arc).is_some());
}

#[test]
fn rekey_swaps_with_occupant() {
    let f = setup();
    let flow_a = Flow::with_handle(key(1), 3, 0);
    let flow_b = Flow::with_handle(key(2), 7, 0);
    let a = insert(&f, &flow_a, 3);
    let b = insert(&f, &flow_b, 7);
    f.transport.drain_inline();

    // Move A onto B's handle: the two switch places so both remain
    // addressable.
    f.object.update_flow_handle(&a, 7);
    assert_eq!(a.hash_id(), 7);
    assert_eq!(b.hash_id(), 3);
    assert_eq!(f.object.object().len(), 2);
}
