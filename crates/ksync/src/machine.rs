// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The entry state machine: one transition function per state, driven by
//! [`EntryObject::notify`](crate::object::EntryObject::notify).
//!
//! Suspension is a state value, never a suspended task: an entry waiting on
//! the datapath parks in `SyncWait`/`DelAckWait`, an entry waiting on a
//! dependency parks in `AddDefer`/`ChangeDefer`, and the next event moves it
//! on. Events that a state can never legitimately see are hard assertion
//! failures.

use std::sync::Arc;

use crate::entry::{is_resolved, EntryArc, SyncEvent, SyncState};
use crate::object::EntryObject;

/// Add helper: defer on an unresolved reference, otherwise encode and send.
fn do_add(obj: &Arc<EntryObject>, entry: &EntryArc) -> SyncState {
    if let Some(dep) = entry.unresolved_reference() {
        obj.graph().add(entry, dep);
        return SyncState::AddDefer;
    }

    entry.core().set_seen(true);
    let mut buf = Vec::new();
    if entry.encode_add(&mut buf) == 0 {
        SyncState::InSync
    } else {
        obj.sock().send_async(entry, buf, SyncEvent::AddAck);
        SyncState::SyncWait
    }
}

/// Change helper. Only valid once the datapath has seen the entry.
fn do_change(obj: &Arc<EntryObject>, entry: &EntryArc) -> SyncState {
    assert!(entry.core().seen());
    if let Some(dep) = entry.unresolved_reference() {
        obj.graph().add(entry, dep);
        return SyncState::ChangeDefer;
    }

    let mut buf = Vec::new();
    if entry.encode_change(&mut buf) == 0 {
        SyncState::InSync
    } else {
        obj.sock().send_async(entry, buf, SyncEvent::ChangeAck);
        SyncState::SyncWait
    }
}

/// Delete helper: defer while references remain; skip the wire DELETE for
/// an unseen entry when the type permits state compression.
fn do_delete(obj: &Arc<EntryObject>, entry: &EntryArc) -> SyncState {
    if entry.core().refcount() > 1 {
        return SyncState::DelDeferRef;
    }

    assert_eq!(entry.core().refcount(), 1);
    if !entry.core().seen() && entry.allow_delete_state_comp() {
        return SyncState::FreeWait;
    }
    let mut buf = Vec::new();
    if entry.encode_delete(&mut buf) == 0 {
        SyncState::FreeWait
    } else {
        obj.sock().send_async(entry, buf, SyncEvent::DelAck);
        SyncState::DelAckWait
    }
}

/// Delete-then-add helper. The delete is issued irrespective of references
/// (this path does not manage them); the add follows the delete ack when the
/// delete went to the wire, immediately otherwise.
fn do_delete_add(obj: &Arc<EntryObject>, entry: &EntryArc) -> SyncState {
    // Not defined for stale entries; a plain delete suffices there and the
    // add happens when the entry turns non-stale.
    assert!(!entry.core().stale());

    if entry.core().seen() || !entry.allow_delete_state_comp() {
        let mut buf = Vec::new();
        if entry.encode_delete(&mut buf) != 0 {
            obj.sock().send_async(entry, buf, SyncEvent::DelAck);
            return SyncState::RenewWait;
        }
    }

    do_add(obj, entry)
}

fn on_init(obj: &Arc<EntryObject>, entry: &EntryArc, event: SyncEvent) -> SyncState {
    match event {
        SyncEvent::AddChangeReq => do_add(obj, entry),
        other => unexpected(entry, SyncState::Init, other),
    }
}

fn on_temp(obj: &Arc<EntryObject>, entry: &EntryArc, event: SyncEvent) -> SyncState {
    match event {
        SyncEvent::AddChangeReq | SyncEvent::DelAddReq => do_add(obj, entry),
        // A temp entry was never sent to the datapath; when the last
        // reference backing it goes away it is simply freed.
        SyncEvent::RefRelease | SyncEvent::DelReq => {
            if entry.core().refcount() == 1 {
                SyncState::FreeWait
            } else {
                SyncState::Temp
            }
        }
        SyncEvent::ReEval => SyncState::Temp,
        other => unexpected(entry, SyncState::Temp, other),
    }
}

fn on_add_defer(obj: &Arc<EntryObject>, entry: &EntryArc, event: SyncEvent) -> SyncState {
    match event {
        SyncEvent::AddChangeReq => {
            obj.graph().remove(entry);
            do_add(obj, entry)
        }
        // The back-reference was already detached before delivery.
        SyncEvent::ReEval => do_add(obj, entry),
        SyncEvent::DelReq => {
            obj.graph().remove(entry);
            if !entry.allow_delete_state_comp() {
                do_delete(obj, entry)
            } else if entry.core().refcount() > 1 {
                SyncState::Temp
            } else {
                SyncState::FreeWait
            }
        }
        SyncEvent::DelAddReq => {
            obj.graph().remove(entry);
            do_delete_add(obj, entry)
        }
        SyncEvent::RefRelease => SyncState::AddDefer,
        other => unexpected(entry, SyncState::AddDefer, other),
    }
}

fn on_change_defer(obj: &Arc<EntryObject>, entry: &EntryArc, event: SyncEvent) -> SyncState {
    match event {
        SyncEvent::AddChangeReq => {
            obj.graph().remove(entry);
            do_change(obj, entry)
        }
        SyncEvent::ReEval => do_change(obj, entry),
        SyncEvent::DelReq => {
            obj.graph().remove(entry);
            do_delete(obj, entry)
        }
        SyncEvent::DelAddReq => {
            obj.graph().remove(entry);
            do_delete_add(obj, entry)
        }
        SyncEvent::RefRelease => SyncState::ChangeDefer,
        other => unexpected(entry, SyncState::ChangeDefer, other),
    }
}

fn on_in_sync(obj: &Arc<EntryObject>, entry: &EntryArc, event: SyncEvent) -> SyncState {
    match event {
        SyncEvent::AddChangeReq => do_change(obj, entry),
        SyncEvent::DelReq => do_delete(obj, entry),
        SyncEvent::DelAddReq => do_delete_add(obj, entry),
        SyncEvent::RefRelease => SyncState::InSync,
        // A re-evaluation can race an event that already moved the
        // entry on; it is then a no-op.
        SyncEvent::ReEval => SyncState::InSync,
        other => unexpected(entry, SyncState::InSync, other),
    }
}

fn on_sync_wait(obj: &Arc<EntryObject>, entry: &EntryArc, event: SyncEvent) -> SyncState {
    match event {
        SyncEvent::AddChangeReq => SyncState::NeedSync,
        SyncEvent::AddAck | SyncEvent::ChangeAck => {
            if entry.core().del_add_pending() {
                entry.core().set_del_add_pending(false);
                do_delete_add(obj, entry)
            } else {
                SyncState::InSync
            }
        }
        SyncEvent::DelReq => {
            entry.core().set_del_add_pending(false);
            SyncState::DelDeferSync
        }
        SyncEvent::DelAddReq => {
            entry.core().set_del_add_pending(true);
            SyncState::SyncWait
        }
        SyncEvent::RefRelease => SyncState::SyncWait,
        SyncEvent::ReEval => SyncState::SyncWait,
        other => unexpected(entry, SyncState::SyncWait, other),
    }
}

fn on_need_sync(obj: &Arc<EntryObject>, entry: &EntryArc, event: SyncEvent) -> SyncState {
    match event {
        SyncEvent::AddChangeReq => SyncState::NeedSync,
        SyncEvent::DelReq => {
            entry.core().set_del_add_pending(false);
            SyncState::DelDeferSync
        }
        SyncEvent::DelAddReq => {
            entry.core().set_del_add_pending(true);
            SyncState::NeedSync
        }
        // The in-flight ack arrived; resend the pending change.
        SyncEvent::AddAck | SyncEvent::ChangeAck => {
            if entry.core().del_add_pending() {
                entry.core().set_del_add_pending(false);
                do_delete_add(obj, entry)
            } else {
                do_change(obj, entry)
            }
        }
        SyncEvent::RefRelease => SyncState::NeedSync,
        SyncEvent::ReEval => SyncState::NeedSync,
        other => unexpected(entry, SyncState::NeedSync, other),
    }
}

fn on_del_defer_sync(obj: &Arc<EntryObject>, entry: &EntryArc, event: SyncEvent) -> SyncState {
    match event {
        SyncEvent::AddChangeReq => SyncState::NeedSync,
        SyncEvent::DelAddReq => {
            entry.core().set_del_add_pending(true);
            SyncState::NeedSync
        }
        SyncEvent::AddAck | SyncEvent::ChangeAck => do_delete(obj, entry),
        SyncEvent::RefRelease => SyncState::DelDeferSync,
        SyncEvent::ReEval => SyncState::DelDeferSync,
        other => unexpected(entry, SyncState::DelDeferSync, other),
    }
}

fn on_del_defer_ref(obj: &Arc<EntryObject>, entry: &EntryArc, event: SyncEvent) -> SyncState {
    match event {
        // Renew: the owner wants the entry back before the delete was sent.
        SyncEvent::AddChangeReq => {
            if entry.core().seen() {
                do_change(obj, entry)
            } else {
                do_add(obj, entry)
            }
        }
        SyncEvent::RefRelease | SyncEvent::DelReq => {
            assert_eq!(entry.core().refcount(), 1);
            do_delete(obj, entry)
        }
        SyncEvent::DelAddReq => do_delete_add(obj, entry),
        SyncEvent::ReEval => SyncState::DelDeferRef,
        other => unexpected(entry, SyncState::DelDeferRef, other),
    }
}

fn on_del_defer_del_ack(obj: &Arc<EntryObject>, entry: &EntryArc, event: SyncEvent) -> SyncState {
    assert!(!entry.allow_delete_state_comp());
    match event {
        SyncEvent::AddChangeReq => {
            entry.core().set_del_add_pending(false);
            SyncState::RenewWait
        }
        SyncEvent::DelAck => {
            if entry.core().del_add_pending() {
                entry.core().set_del_add_pending(false);
                do_delete_add(obj, entry)
            } else {
                do_delete(obj, entry)
            }
        }
        SyncEvent::DelAddReq => {
            entry.core().set_del_add_pending(true);
            SyncState::DelDeferDelAck
        }
        SyncEvent::RefRelease => SyncState::DelDeferDelAck,
        SyncEvent::ReEval => SyncState::DelDeferDelAck,
        other => unexpected(entry, SyncState::DelDeferDelAck, other),
    }
}

fn on_del_ack_wait(obj: &Arc<EntryObject>, entry: &EntryArc, event: SyncEvent) -> SyncState {
    match event {
        SyncEvent::AddChangeReq => {
            entry.core().set_del_add_pending(false);
            SyncState::RenewWait
        }
        SyncEvent::DelAck => {
            if entry.core().del_add_pending() {
                entry.core().set_del_add_pending(false);
                do_delete_add(obj, entry)
            } else if entry.core().refcount() > 1 {
                SyncState::Temp
            } else {
                SyncState::FreeWait
            }
        }
        SyncEvent::DelAddReq => {
            entry.core().set_del_add_pending(true);
            SyncState::DelAckWait
        }
        SyncEvent::RefRelease => SyncState::DelAckWait,
        SyncEvent::ReEval => SyncState::DelAckWait,
        other => unexpected(entry, SyncState::DelAckWait, other),
    }
}

// Renewal while a delete ack is outstanding is only partially specified by
// the protocol: an add/change request parks here and the add goes out on the
// delete ack.
fn on_renew_wait(obj: &Arc<EntryObject>, entry: &EntryArc, event: SyncEvent) -> SyncState {
    match event {
        SyncEvent::AddChangeReq => {
            entry.core().set_del_add_pending(false);
            SyncState::RenewWait
        }
        SyncEvent::DelReq => {
            entry.core().set_del_add_pending(false);
            if entry.allow_delete_state_comp() {
                SyncState::DelAckWait
            } else {
                SyncState::DelDeferDelAck
            }
        }
        SyncEvent::DelAddReq => {
            entry.core().set_del_add_pending(true);
            SyncState::RenewWait
        }
        SyncEvent::DelAck => {
            if entry.core().del_add_pending() {
                entry.core().set_del_add_pending(false);
                do_delete_add(obj, entry)
            } else {
                do_add(obj, entry)
            }
        }
        SyncEvent::RefRelease => SyncState::RenewWait,
        SyncEvent::ReEval => SyncState::RenewWait,
        other => unexpected(entry, SyncState::RenewWait, other),
    }
}

fn unexpected(entry: &EntryArc, state: SyncState, event: SyncEvent) -> SyncState {
    unreachable!("event {event} not expected in state {state} for {}", entry.describe())
}

/// Dispatch one event and return the next state. Side effects (sends,
/// dependency edits) happen inside; the caller owns the post-transition
/// steps.
pub(crate) fn transition(
    obj: &Arc<EntryObject>,
    entry: &EntryArc,
    event: SyncEvent,
) -> SyncState {
    assert!(entry.core().refcount() > 0);
    match entry.core().state() {
        SyncState::Init => on_init(obj, entry, event),
        SyncState::Temp => on_temp(obj, entry, event),
        SyncState::AddDefer => on_add_defer(obj, entry, event),
        SyncState::ChangeDefer => on_change_defer(obj, entry, event),
        SyncState::InSync => on_in_sync(obj, entry, event),
        SyncState::SyncWait => on_sync_wait(obj, entry, event),
        SyncState::NeedSync => on_need_sync(obj, entry, event),
        SyncState::DelDeferSync => on_del_defer_sync(obj, entry, event),
        SyncState::DelDeferRef => on_del_defer_ref(obj, entry, event),
        SyncState::DelDeferDelAck => on_del_defer_del_ack(obj, entry, event),
        SyncState::DelAckWait => on_del_ack_wait(obj, entry, event),
        SyncState::RenewWait => on_renew_wait(obj, entry, event),
        SyncState::FreeWait => unexpected(entry, SyncState::FreeWait, event),
    }
}

/// States whose exit can resolve waiters: after a transition out of one of
/// these, a now-resolved entry triggers re-evaluation of its back-references.
pub(crate) fn arms_re_eval(state: SyncState) -> bool {
    matches!(
        state,
        SyncState::Temp
            | SyncState::AddDefer
            | SyncState::ChangeDefer
            | SyncState::SyncWait
            | SyncState::DelDeferRef
            | SyncState::RenewWait
    )
}

/// Post-transition re-evaluation check, exposed for the object driver.
pub(crate) fn should_re_eval(entry: &EntryArc, from: SyncState) -> bool {
    arms_re_eval(from) && is_resolved(&**entry) && entry.should_reeval_backrefs()
}

#[cfg(test)]
#[path = "machine_tests.rs"]
mod tests;
