// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use crate::test_support::{as_entry, inline_transport, scaffold, TestEntry};

#[test]
fn seqno_spaces_are_disjoint() {
    let (transport, _wire) = inline_transport();

    let defaults: Vec<u32> = (0..4).map(|_| transport.alloc_seqno(false)).collect();
    let telemetry: Vec<u32> = (0..4).map(|_| transport.alloc_seqno(true)).collect();

    for seq in &defaults {
        assert_eq!(seq & 1, 1);
        assert_eq!(WorkQueueId::from_seq(*seq), WorkQueueId::Default);
    }
    for seq in &telemetry {
        assert_eq!(seq & 1, 0);
        assert_eq!(WorkQueueId::from_seq(*seq), WorkQueueId::Telemetry);
    }
    // Monotonic within each space.
    assert!(defaults.windows(2).all(|w| w[0] < w[1]));
    assert!(telemetry.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn in_flight_window_drains_on_ack() {
    let s = scaffold();
    let entry = TestEntry::new(&s.object, 1);
    let held = s.object.create(&as_entry(&entry));

    assert_eq!(s.transport.in_flight(), 1);
    s.transport.drain_inline();
    assert_eq!(s.transport.in_flight(), 0);
    assert_eq!(s.transport.tx_count(), 1);
    assert_eq!(s.transport.ack_count(), 1);

    s.object.delete(&as_entry(&entry));
    drop(held);
    s.transport.drain_inline();
}

#[test]
fn telemetry_send_needs_no_entry() {
    let (transport, wire) = inline_transport();
    let mut blobs = Vec::new();
    codec::write_blob(&mut blobs, codec::BLOB_OBJECT_REQ, b"stats");
    transport.send_telemetry(blobs);

    assert_eq!(transport.in_flight(), 1);
    transport.drain_inline();
    assert_eq!(transport.in_flight(), 0);
    assert_eq!(wire.requests_of_kind(codec::BLOB_OBJECT_REQ).len(), 1);
}

#[test]
fn blocking_prime_path_roundtrips() {
    let (transport, _wire) = inline_transport();
    let mut blobs = Vec::new();
    codec::write_blob(
        &mut blobs,
        codec::BLOB_TABLE_REQ,
        &codec::encode_table_req(codec::TableKind::Flow),
    );
    let seq = match transport.blocking_send(&blobs) {
        Ok(seq) => seq,
        Err(e) => unreachable!("blocking send failed: {e}"),
    };
    assert_eq!(seq & 1, 1);

    let mut table_info = None;
    let saw_error = transport.blocking_recv(|kind, payload| {
        if kind == codec::BLOB_TABLE_INFO {
            table_info = codec::parse_table_info(payload);
        }
    });
    assert!(matches!(saw_error, Ok(false)));
    assert!(table_info.is_some());
}

// Production-mode path: tasks move the request out and the ack back without
// any inline draining.
#[tokio::test]
async fn started_transport_delivers_acks() {
    use crate::test_support::MockWire;

    let graph = crate::deps::DependencyGraph::new();
    let wire = MockWire::new();
    let transport = Transport::new(wire.clone());
    let object = crate::object::EntryObject::new("async-object", graph, transport.clone());

    let shutdown = tokio_util::sync::CancellationToken::new();
    transport.start(shutdown.clone());

    let entry = TestEntry::new(&object, 1);
    let held = object.create(&as_entry(&entry));

    // The ack flows through the send task, the wire, and the receive
    // worker.
    let deadline = tokio::time::Instant::now() + tokio::time::Duration::from_secs(5);
    loop {
        if held.core().state() == crate::entry::SyncState::InSync {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "ack never arrived");
        tokio::time::sleep(tokio::time::Duration::from_millis(5)).await;
    }

    object.delete(&as_entry(&entry));
    drop(held);
    let deadline = tokio::time::Instant::now() + tokio::time::Duration::from_secs(5);
    while !object.is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "delete ack never arrived");
        tokio::time::sleep(tokio::time::Duration::from_millis(5)).await;
    }
    shutdown.cancel();
}
