// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::DependencyGraph;
use crate::entry::{EntryRef, SyncState};
use crate::test_support::{as_entry, scaffold, TestEntry};

#[test]
fn add_creates_matched_edges_and_refcounts() {
    let s = scaffold();
    let graph = DependencyGraph::new();
    let waiter = as_entry(&TestEntry::new(&s.object, 1));
    let target = as_entry(&TestEntry::new(&s.object, 2));

    graph.add(&waiter, EntryRef::new(target.clone()));

    assert_eq!(graph.len(), 1);
    assert_eq!(graph.waiter_count(&target), 1);
    assert_eq!(waiter.core().refcount(), 1);
    assert_eq!(target.core().refcount(), 1);
    let waiting_on = graph.waiting_on(&waiter);
    assert!(waiting_on.is_some_and(|t| t.id() == crate::entry::entry_id(&target)));

    graph.remove(&waiter);
    assert!(graph.is_empty());
    assert_eq!(waiter.core().refcount(), 0);
    assert_eq!(target.core().refcount(), 0);
}

#[test]
fn remove_without_wait_is_noop() {
    let s = scaffold();
    let graph = DependencyGraph::new();
    let entry = as_entry(&TestEntry::new(&s.object, 1));
    graph.remove(&entry);
    assert!(graph.is_empty());
}

#[test]
#[should_panic(expected = "outstanding wait")]
fn second_wait_for_same_waiter_is_fatal() {
    let s = scaffold();
    let graph = DependencyGraph::new();
    let waiter = as_entry(&TestEntry::new(&s.object, 1));
    let t1 = as_entry(&TestEntry::new(&s.object, 2));
    let t2 = as_entry(&TestEntry::new(&s.object, 3));

    graph.add(&waiter, EntryRef::new(t1));
    graph.add(&waiter, EntryRef::new(t2));
}

#[test]
fn many_waiters_one_target() {
    let s = scaffold();
    let graph = DependencyGraph::new();
    let target = as_entry(&TestEntry::new(&s.object, 100));
    let waiters: Vec<_> = (0..5)
        .map(|k| as_entry(&TestEntry::new(&s.object, k)))
        .collect();

    for waiter in &waiters {
        graph.add(waiter, EntryRef::new(target.clone()));
    }
    assert_eq!(graph.waiter_count(&target), 5);
    assert_eq!(target.core().refcount(), 5);

    for waiter in &waiters {
        graph.remove(waiter);
    }
    assert!(graph.is_empty());
    assert_eq!(target.core().refcount(), 0);
}

// Full delivery semantics are exercised by the state-machine tests; here
// the detach side of re-evaluation.
#[test]
fn re_eval_detaches_all_waiters() {
    let s = scaffold();
    let target = as_entry(&TestEntry::new(&s.object, 100));
    let w1 = as_entry(&TestEntry::new(&s.object, 1));
    let w2 = as_entry(&TestEntry::new(&s.object, 2));
    // Deferred waiters, as they would be while parked in the graph. Keep
    // them referenced so detaching does not free them.
    w1.core().set_state(SyncState::AddDefer);
    w2.core().set_state(SyncState::AddDefer);
    let hold1 = EntryRef::new(w1.clone());
    let hold2 = EntryRef::new(w2.clone());

    s.graph.add(&w1, EntryRef::new(target.clone()));
    s.graph.add(&w2, EntryRef::new(target.clone()));

    s.graph.re_eval(&target);

    // Both waiters were detached and re-driven: nothing left in the graph,
    // and the re-evaluated adds went to the wire.
    assert!(s.graph.is_empty());
    assert_eq!(target.core().refcount(), 0);
    assert_eq!(w1.core().state(), SyncState::SyncWait);
    assert_eq!(w2.core().state(), SyncState::SyncWait);
    assert_eq!(s.wire.sent_count(), 2);
    s.transport.drain_inline();
    drop(hold1);
    drop(hold2);
}
