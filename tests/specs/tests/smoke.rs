// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end engine tests over a real UDP loopback datapath.

use std::sync::Arc;
use std::time::Duration;

use ksync::ctx::Ksync;
use ksync::entry::SyncState;
use ksync::flow::{Flow, FlowIndexManager, FlowKey, INVALID_FLOW_HANDLE};
use ksync::test_support::{as_entry, RecordingSink, TestEntry};
use ksync::transport::codec;
use ksync::transport::udp::UdpWire;
use ksync::transport::Wire;

use ksync_specs::{wait_for, SimDatapath};

const TIMEOUT: Duration = Duration::from_secs(10);

async fn engine_over(sim: &SimDatapath, shards: usize) -> anyhow::Result<Arc<Ksync>> {
    let mut wires: Vec<Arc<dyn Wire>> = Vec::new();
    for _ in 0..shards {
        wires.push(Arc::new(UdpWire::connect(sim.addr()).await?));
    }
    let mut wires = wires.into_iter();
    let ctx = Ksync::init(shards, move |_| match wires.next() {
        Some(wire) => wire,
        None => std::unreachable!("wire prepared per shard"),
    });
    ctx.start();
    Ok(ctx)
}

#[tokio::test]
async fn entry_lifecycle_over_udp() -> anyhow::Result<()> {
    let sim = SimDatapath::start().await?;
    let ctx = engine_over(&sim, 1).await?;
    let object = ctx.new_object("interface");

    let entry = TestEntry::new(&object, 1);
    let held = object.create(&as_entry(&entry));

    wait_for(TIMEOUT, "add ack", || held.core().state() == SyncState::InSync).await?;

    object.delete(&as_entry(&entry));
    drop(held);
    wait_for(TIMEOUT, "delete ack", || object.is_empty()).await?;

    let ops: Vec<u8> = sim.blobs_of_kind(codec::BLOB_OBJECT_REQ).iter().map(|p| p[0]).collect();
    assert_eq!(ops, vec![1, 3]);

    wait_for(TIMEOUT, "in-flight drained", || ctx.transport().in_flight() == 0).await?;
    ctx.shutdown();
    Ok(())
}

#[tokio::test]
async fn burst_of_entries_is_bulked() -> anyhow::Result<()> {
    let sim = SimDatapath::start().await?;
    let ctx = engine_over(&sim, 1).await?;
    let object = ctx.new_object("nexthop");

    let mut entries = Vec::new();
    for key in 0..32u32 {
        let entry = TestEntry::new(&object, key);
        let held = object.create(&as_entry(&entry));
        entries.push((entry, held));
    }

    wait_for(TIMEOUT, "all adds acked", || {
        entries.iter().all(|(_, held)| held.core().state() == SyncState::InSync)
    })
    .await?;

    // Every request arrived, in fewer wire frames than requests when the
    // send task coalesced a burst.
    assert_eq!(sim.blobs_of_kind(codec::BLOB_OBJECT_REQ).len(), 32);
    assert!(sim.frame_count() <= 32);

    for (entry, held) in entries {
        object.delete(&as_entry(&entry));
        drop(held);
    }
    wait_for(TIMEOUT, "registry drained", || object.is_empty()).await?;
    wait_for(TIMEOUT, "in-flight drained", || ctx.transport().in_flight() == 0).await?;
    ctx.shutdown();
    Ok(())
}

#[tokio::test]
async fn dependency_resolution_across_objects() -> anyhow::Result<()> {
    let sim = SimDatapath::start().await?;
    let ctx = engine_over(&sim, 1).await?;
    let nexthops = ctx.new_indexed_object("nexthop", 128);
    let routes = ctx.new_object("route");

    let nh = TestEntry::new(&nexthops, 7);
    nh.set_data_resolved(false);
    let nh_temp = nexthops.get_reference(&as_entry(&nh));

    let route = TestEntry::new(&routes, 1);
    route.set_dependency(Some(nh_temp.clone()));
    let route_held = routes.create(&as_entry(&route));
    assert_eq!(route_held.core().state(), SyncState::AddDefer);
    assert_eq!(ctx.graph().len(), 1);

    let nh_held = nexthops.create(&as_entry(&nh));
    nh.set_data_resolved(true);

    wait_for(TIMEOUT, "dependent released", || {
        route_held.core().state() == SyncState::InSync
    })
    .await?;
    assert!(ctx.graph().is_empty());
    assert_eq!(nh_held.core().state(), SyncState::InSync);

    routes.delete(&as_entry(&route));
    route.set_dependency(None);
    drop(route_held);
    nexthops.delete(&as_entry(&nh));
    drop(nh_temp);
    drop(nh_held);
    wait_for(TIMEOUT, "registries drained", || routes.is_empty() && nexthops.is_empty()).await?;
    wait_for(TIMEOUT, "in-flight drained", || ctx.transport().in_flight() == 0).await?;
    ctx.shutdown();
    Ok(())
}

#[tokio::test]
async fn flow_gets_datapath_assigned_slot() -> anyhow::Result<()> {
    let sim = SimDatapath::start().await?;
    let ctx = engine_over(&sim, 2).await?;
    let flow_objects = ctx.new_flow_objects();

    let sink = RecordingSink::new();
    let manager = FlowIndexManager::new(1024, sink);

    let key = FlowKey {
        nh_id: 3,
        src: "10.5.0.1".parse()?,
        dst: "10.5.0.2".parse()?,
        proto: 6,
        src_port: 33000,
        dst_port: 443,
    };
    let shard = ksync::flow::shard_for_key(&key, flow_objects.len());
    let object = &flow_objects[shard];

    sim.assign_next_flow_index(42, 7);
    let flow = Flow::new(key);
    assert_eq!(flow.handle(), INVALID_FLOW_HANDLE);
    manager.update(object, &flow);

    wait_for(TIMEOUT, "slot assignment", || flow.handle() == 42).await?;
    assert_eq!(flow.gen_id(), 7);
    let entry = flow.ksync().map(|h| h.entry);
    assert!(entry.as_ref().is_some_and(|e| e.hash_id() == 42));
    assert!(manager.find_by_index(42).is_some_and(|owner| Arc::ptr_eq(&owner, &flow)));

    manager.delete(object, &flow);
    wait_for(TIMEOUT, "flow registry drained", || object.object().is_empty()).await?;
    wait_for(TIMEOUT, "in-flight drained", || {
        (0..ctx.shard_count()).all(|s| ctx.shard_transport(s).in_flight() == 0)
    })
    .await?;
    ctx.shutdown();
    Ok(())
}

#[tokio::test]
async fn datapath_error_is_reported_and_consumed() -> anyhow::Result<()> {
    let sim = SimDatapath::start().await?;
    let ctx = engine_over(&sim, 1).await?;
    let object = ctx.new_object("mpls");

    sim.push_error(nix_errno_erange());
    let entry = TestEntry::new(&object, 1);
    let held = object.create(&as_entry(&entry));

    wait_for(TIMEOUT, "errored ack", || held.core().state() == SyncState::InSync).await?;
    let errors = entry.errors();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, nix_errno_erange());

    object.delete(&as_entry(&entry));
    drop(held);
    wait_for(TIMEOUT, "registry drained", || object.is_empty()).await?;
    wait_for(TIMEOUT, "in-flight drained", || ctx.transport().in_flight() == 0).await?;
    ctx.shutdown();
    Ok(())
}

#[tokio::test]
async fn stale_entries_are_swept_by_timer() -> anyhow::Result<()> {
    let sim = SimDatapath::start().await?;
    let ctx = engine_over(&sim, 1).await?;
    let object = ctx.new_object("vrf-assign");
    object.init_stale_cleanup(
        Duration::from_millis(20),
        8,
        ctx.shutdown_token().clone(),
    );

    // Entries restored from a previous incarnation of the agent.
    let mut entries = Vec::new();
    for key in 0..4u32 {
        let entry = TestEntry::new(&object, key);
        if let Some(held) = object.create_stale(&as_entry(&entry)) {
            drop(held);
        }
        entries.push(entry);
    }

    // Nothing re-claimed them: the sweep deletes them all.
    wait_for(TIMEOUT, "stale sweep", || object.is_empty()).await?;
    let ops: Vec<u8> = sim.blobs_of_kind(codec::BLOB_OBJECT_REQ).iter().map(|p| p[0]).collect();
    assert_eq!(ops.iter().filter(|op| **op == 3).count(), 4);

    wait_for(TIMEOUT, "in-flight drained", || ctx.transport().in_flight() == 0).await?;
    ctx.shutdown();
    Ok(())
}

fn nix_errno_erange() -> i32 {
    // ERANGE: the datapath's "unexpected mpls label" report.
    34
}
