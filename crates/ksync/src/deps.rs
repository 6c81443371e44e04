// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Dependency graph: forward-reference and back-reference trees linking a
//! waiting entry to the entry it waits on.
//!
//! A waiter has at most one outstanding wait at a time; a single target may
//! have many waiters. Entries appear here only while their constraints are
//! unmet. For every `(waiter → target)` forward edge there is exactly one
//! `(target, waiter)` back edge, and both hold a counted reference on both
//! entries. The graph is a forest; a cycle would be a modeling bug in the
//! upstream tables and is not detected here.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::entry::{entry_id, EntryArc, EntryRef, SyncEvent};

struct WaitEdge {
    waiter: EntryRef,
    target: EntryRef,
}

#[derive(Default)]
struct GraphState {
    /// waiter identity → outstanding wait.
    fwd: BTreeMap<usize, WaitEdge>,
    /// (target identity, waiter identity).
    back: BTreeMap<(usize, usize), ()>,
}

#[derive(Default)]
pub struct DependencyGraph {
    state: Mutex<GraphState>,
}

impl DependencyGraph {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Record that `waiter` is blocked on `target`. Bumps both refcounts.
    ///
    /// The waiter must not already have an outstanding wait.
    pub fn add(&self, waiter: &EntryArc, target: EntryRef) {
        let edge =
            WaitEdge { waiter: EntryRef::new(waiter.clone()), target };
        let (wid, tid) = (edge.waiter.id(), edge.target.id());
        let mut state = self.state.lock();
        let prior = state.fwd.insert(wid, edge);
        assert!(prior.is_none(), "waiter already has an outstanding wait");
        let prior = state.back.insert((tid, wid), ());
        assert!(prior.is_none());
    }

    /// Remove the outstanding wait of `waiter`, if any, dropping both held
    /// references. No-op when no wait is outstanding.
    pub fn remove(&self, waiter: &EntryArc) {
        let edge = {
            let mut state = self.state.lock();
            let Some(edge) = state.fwd.remove(&entry_id(waiter)) else {
                return;
            };
            let removed = state.back.remove(&(edge.target.id(), edge.waiter.id()));
            assert!(removed.is_some(), "back edge missing for forward edge");
            edge
        };
        // Dropped outside the graph mutex: releasing the held references can
        // re-enter the state machine of either entry's object.
        drop(edge);
    }

    /// Detach every waiter of `target` and deliver `ReEval` to each, locking
    /// the waiter's owning object per delivery.
    ///
    /// Two-phase on purpose: the snapshot is taken and detached first
    /// because re-evaluation may itself add new waits.
    pub fn re_eval(&self, target: &EntryArc) {
        let tid = entry_id(target);
        let mut edges = Vec::new();
        {
            let mut state = self.state.lock();
            let waiters: Vec<usize> = state
                .back
                .range((tid, 0)..=(tid, usize::MAX))
                .map(|(key, _)| key.1)
                .collect();
            for wid in waiters {
                state.back.remove(&(tid, wid));
                if let Some(edge) = state.fwd.remove(&wid) {
                    edges.push(edge);
                }
            }
        }

        let waiters: Vec<EntryArc> =
            edges.iter().map(|e| e.waiter.entry().clone()).collect();
        drop(edges);

        for waiter in waiters {
            let object = waiter.object();
            object.safe_notify(&waiter, SyncEvent::ReEval);
        }
    }

    /// The entry `waiter` currently waits on, if any.
    pub fn waiting_on(&self, waiter: &EntryArc) -> Option<EntryRef> {
        let state = self.state.lock();
        state.fwd.get(&entry_id(waiter)).map(|e| e.target.clone())
    }

    pub fn waiter_count(&self, target: &EntryArc) -> usize {
        let tid = entry_id(target);
        let state = self.state.lock();
        state.back.range((tid, 0)..=(tid, usize::MAX)).count()
    }

    pub fn is_empty(&self) -> bool {
        let state = self.state.lock();
        assert_eq!(state.fwd.len(), state.back.len());
        state.fwd.is_empty()
    }

    pub fn len(&self) -> usize {
        self.state.lock().fwd.len()
    }
}

#[cfg(test)]
#[path = "deps_tests.rs"]
mod tests;
