// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn key(src_port: u16) -> FlowKey {
    FlowKey {
        nh_id: 10,
        src: "10.1.1.1".parse().unwrap_or_else(|_| unreachable!()),
        dst: "10.1.1.2".parse().unwrap_or_else(|_| unreachable!()),
        proto: 6,
        src_port,
        dst_port: 80,
    }
}

#[yare::parameterized(
    ahead_by_one = { 5, 6, true },
    equal = { 5, 5, false },
    behind_by_one = { 10, 9, false },
    wrap_ahead = { 250, 3, true },
    wrap_behind = { 3, 250, false },
    max_window = { 0, 126, true },
    window_edge = { 0, 127, false },
)]
fn gen_id_ordering(current: u8, incoming: u8, newer: bool) {
    assert_eq!(gen_id_newer(current, incoming), newer);
}

#[test]
fn gen_id_window_is_antisymmetric() {
    proptest::proptest!(|(current: u8, incoming: u8)| {
        if current != incoming {
            // At most one direction can claim to be newer.
            proptest::prop_assert!(
                !(gen_id_newer(current, incoming) && gen_id_newer(incoming, current))
            );
        } else {
            proptest::prop_assert!(!gen_id_newer(current, incoming));
        }
    });
}

#[test]
fn shard_assignment_is_stable() {
    let k = key(1000);
    let shard = shard_for_key(&k, 8);
    for _ in 0..10 {
        assert_eq!(shard_for_key(&k, 8), shard);
    }
    assert!(shard < 8);
}

#[test]
fn shards_spread_keys() {
    let mut seen = std::collections::HashSet::new();
    for port in 0..64 {
        seen.insert(shard_for_key(&key(port), 8));
    }
    assert!(seen.len() > 1);
}

#[test]
fn flow_handle_state() {
    let flow = Flow::new(key(1));
    assert_eq!(flow.handle(), INVALID_FLOW_HANDLE);
    assert!(!flow.deleted());

    flow.set_handle(77, 4);
    assert_eq!(flow.handle(), 77);
    assert_eq!(flow.gen_id(), 4);

    flow.mark_deleted();
    assert!(flow.deleted());
}
