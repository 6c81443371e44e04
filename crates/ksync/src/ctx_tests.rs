// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::Ksync;
use crate::test_support::{as_entry, MockWire, TestEntry};

#[tokio::test]
async fn init_builds_shard_transports() {
    let ctx = Ksync::init_inline(3, |_| MockWire::new());
    assert_eq!(ctx.shard_count(), 3);
    ctx.shutdown();
}

#[tokio::test]
async fn objects_share_graph_and_transport() {
    let ctx = Ksync::init_inline(1, |_| MockWire::new());
    let interfaces = ctx.new_object("interface");
    let nexthops = ctx.new_indexed_object("nexthop", 64);

    let nh = TestEntry::new(&nexthops, 1);
    let nh_held = nexthops.get_reference(&as_entry(&nh));
    nh.set_data_resolved(false);

    let intf = TestEntry::new(&interfaces, 1);
    intf.set_dependency(Some(nh_held.clone()));
    let intf_held = interfaces.create(&as_entry(&intf));
    // Cross-object wait recorded in the shared graph.
    assert_eq!(ctx.graph().len(), 1);
    assert_eq!(intf_held.core().state(), crate::entry::SyncState::AddDefer);

    let nh_held = nexthops.create(&as_entry(&nh));
    nh.set_data_resolved(true);
    ctx.transport().drain_inline();
    assert_eq!(intf_held.core().state(), crate::entry::SyncState::InSync);
    assert!(ctx.graph().is_empty());

    // Drain everything before teardown.
    interfaces.delete(&as_entry(&intf));
    intf.set_dependency(None);
    drop(intf_held);
    nexthops.delete(&as_entry(&nh));
    drop(nh_held);
    ctx.transport().drain_inline();
    ctx.shutdown();
}

#[tokio::test]
async fn flow_objects_land_on_their_shards() {
    let ctx = Ksync::init_inline(4, |_| MockWire::new());
    let flows = ctx.new_flow_objects();
    assert_eq!(flows.len(), 4);
    for (shard, object) in flows.iter().enumerate() {
        assert_eq!(object.shard(), shard);
    }
    ctx.shutdown();
}

#[tokio::test]
#[should_panic(expected = "still holds entries")]
async fn shutdown_asserts_empty_registries() {
    let ctx = Ksync::init_inline(1, |_| MockWire::new());
    let object = ctx.new_object("leaky");
    let entry = TestEntry::new(&object, 1);
    let _held = object.create(&as_entry(&entry));
    ctx.transport().drain_inline();
    ctx.shutdown();
}
