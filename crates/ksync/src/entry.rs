// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Entry header, lifecycle states/events, and the per-type trait every
//! managed object implements.

use std::any::Any;
use std::cmp::Ordering;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU8, Ordering as MemOrder};
use std::sync::Arc;

use crate::object::EntryObject;
use crate::transport::ResponseInfo;

/// Index value for entries whose type does not allocate one, or whose index
/// has not been assigned yet.
pub const INVALID_INDEX: u32 = u32::MAX;

/// Lifecycle state of a managed entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SyncState {
    /// Created, no events delivered yet.
    Init,
    /// Exists only to back a reference held by another entry.
    Temp,
    /// Add deferred on an unresolved dependency.
    AddDefer,
    /// Change deferred on an unresolved dependency.
    ChangeDefer,
    /// In sync with the datapath.
    InSync,
    /// Add or change sent, waiting for the ack.
    SyncWait,
    /// Modified while an operation was in flight.
    NeedSync,
    /// Deleted while waiting for an add/change ack.
    DelDeferSync,
    /// Deleted with outstanding references.
    DelDeferRef,
    /// Deleted while waiting for a delete ack.
    DelDeferDelAck,
    /// Delete sent, waiting for the ack.
    DelAckWait,
    /// Being renewed; add is issued when the delete ack arrives.
    RenewWait,
    /// To be freed at the end of the current transition.
    FreeWait,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Temp => "temp",
            Self::AddDefer => "add-defer",
            Self::ChangeDefer => "change-defer",
            Self::InSync => "in-sync",
            Self::SyncWait => "sync-wait",
            Self::NeedSync => "need-sync",
            Self::DelDeferSync => "del-defer-sync",
            Self::DelDeferRef => "del-defer-ref",
            Self::DelDeferDelAck => "del-defer-del-ack",
            Self::DelAckWait => "del-ack-wait",
            Self::RenewWait => "renew-wait",
            Self::FreeWait => "free-wait",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Init,
            1 => Self::Temp,
            2 => Self::AddDefer,
            3 => Self::ChangeDefer,
            4 => Self::InSync,
            5 => Self::SyncWait,
            6 => Self::NeedSync,
            7 => Self::DelDeferSync,
            8 => Self::DelDeferRef,
            9 => Self::DelDeferDelAck,
            10 => Self::DelAckWait,
            11 => Self::RenewWait,
            _ => Self::FreeWait,
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events driving the entry state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEvent {
    AddChangeReq,
    AddAck,
    ChangeAck,
    DelReq,
    DelAddReq,
    DelAck,
    ReEval,
    /// Last external reference dropped (refcount fell to the registry's own).
    RefRelease,
}

impl SyncEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AddChangeReq => "add/change request",
            Self::AddAck => "add ack",
            Self::ChangeAck => "change ack",
            Self::DelReq => "delete request",
            Self::DelAddReq => "delete-then-add request",
            Self::DelAck => "delete ack",
            Self::ReEval => "re-evaluate",
            Self::RefRelease => "reference release",
        }
    }

    /// Human label for the operation acked by this event, used in error
    /// reports from the datapath.
    pub fn ack_operation(&self) -> &'static str {
        match self {
            Self::AddAck => "addition",
            Self::ChangeAck => "change",
            Self::DelAck => "deletion",
            other => other.as_str(),
        }
    }
}

impl fmt::Display for SyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Common header carried by every entry.
///
/// All fields are mutated only while the owning object's lock is held; the
/// atomics exist so the refcount can move without the lock and so
/// diagnostics can read entry state from any task.
#[derive(Debug)]
pub struct EntryCore {
    index: AtomicU32,
    state: AtomicU8,
    refcount: AtomicI32,
    seen: AtomicBool,
    stale: AtomicBool,
    del_add_pending: AtomicBool,
}

impl EntryCore {
    pub fn new() -> Self {
        Self::with_index(INVALID_INDEX)
    }

    pub fn with_index(index: u32) -> Self {
        Self {
            index: AtomicU32::new(index),
            state: AtomicU8::new(SyncState::Init as u8),
            refcount: AtomicI32::new(0),
            seen: AtomicBool::new(false),
            stale: AtomicBool::new(false),
            del_add_pending: AtomicBool::new(false),
        }
    }

    pub fn index(&self) -> u32 {
        self.index.load(MemOrder::Relaxed)
    }

    pub(crate) fn set_index(&self, index: u32) {
        self.index.store(index, MemOrder::Relaxed);
    }

    pub fn state(&self) -> SyncState {
        SyncState::from_u8(self.state.load(MemOrder::Relaxed))
    }

    pub(crate) fn set_state(&self, state: SyncState) {
        self.state.store(state as u8, MemOrder::Relaxed);
    }

    pub fn refcount(&self) -> i32 {
        self.refcount.load(MemOrder::Relaxed)
    }

    pub fn seen(&self) -> bool {
        self.seen.load(MemOrder::Relaxed)
    }

    pub(crate) fn set_seen(&self, seen: bool) {
        self.seen.store(seen, MemOrder::Relaxed);
    }

    pub fn stale(&self) -> bool {
        self.stale.load(MemOrder::Relaxed)
    }

    pub(crate) fn set_stale(&self, stale: bool) {
        self.stale.store(stale, MemOrder::Relaxed);
    }

    pub fn del_add_pending(&self) -> bool {
        self.del_add_pending.load(MemOrder::Relaxed)
    }

    pub(crate) fn set_del_add_pending(&self, v: bool) {
        self.del_add_pending.store(v, MemOrder::Relaxed);
    }
}

impl Default for EntryCore {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EntryCore {
    fn drop(&mut self) {
        assert_eq!(*self.refcount.get_mut(), 0, "entry destroyed with live references");
    }
}

/// The per-type interface: the state machine depends only on this.
pub trait SyncEntry: Send + Sync + 'static {
    /// The shared lifecycle header.
    fn core(&self) -> &EntryCore;

    /// Registry owning this entry.
    fn object(&self) -> Arc<EntryObject>;

    /// Total order within the owning registry. `other` is always an entry
    /// of the same concrete type.
    fn cmp_key(&self, other: &dyn SyncEntry) -> Ordering;

    /// One-line description for diagnostics and error reports.
    fn describe(&self) -> String;

    /// The single dependency currently blocking this entry, or `None`.
    fn unresolved_reference(&self) -> Option<EntryRef> {
        None
    }

    /// Type-specific data-resolution flag, folded into [`is_resolved`].
    fn is_data_resolved(&self) -> bool {
        true
    }

    /// May the engine skip the wire DELETE for an entry the datapath has
    /// never acknowledged.
    fn allow_delete_state_comp(&self) -> bool {
        true
    }

    /// May this entry's resolution trigger re-evaluation of entries waiting
    /// on it.
    fn should_reeval_backrefs(&self) -> bool {
        true
    }

    /// Release type-local state when the entry becomes TEMP or FREE_WAIT.
    fn cleanup_on_del(&self) {}

    /// Invoked when this entry's removal leaves the registry empty.
    fn empty_table(&self) {}

    /// Encode an add request into `buf`. Returning 0 requests a synchronous
    /// no-op success (the entry moves straight to in-sync).
    fn encode_add(&self, buf: &mut Vec<u8>) -> usize;

    /// Encode a change request. Same return contract as [`encode_add`].
    ///
    /// [`encode_add`]: SyncEntry::encode_add
    fn encode_change(&self, buf: &mut Vec<u8>) -> usize;

    /// Encode a delete request. Same return contract as [`encode_add`].
    ///
    /// [`encode_add`]: SyncEntry::encode_add
    fn encode_delete(&self, buf: &mut Vec<u8>) -> usize;

    /// Per-entry payload from the datapath response, delivered before the
    /// ack event reaches the state machine.
    fn response(&self, _info: &ResponseInfo) {}

    /// Non-zero response code from the datapath for an operation on this
    /// entry. The ack event is still delivered afterwards.
    fn error_handler(&self, err: i32, seq_no: u32, event: SyncEvent) {
        let kind = crate::error::DatapathError::from_errno(err);
        tracing::error!(
            entry = %self.describe(),
            errno = err,
            error = %kind,
            operation = event.ack_operation(),
            seq_no,
            "datapath operation failed"
        );
    }

    /// Concrete-type escape hatch for collaborators that know their entries.
    fn as_any(&self) -> &dyn Any;
}

/// Implemented alongside [`SyncEntry`] by types that mirror an upstream
/// record. The upstream-table notifier folds the changed record in through
/// [`resync`] before the engine decides whether a sync is due.
///
/// [`resync`]: SourceBacked::resync
pub trait SourceBacked: SyncEntry {
    /// Re-read the upstream record into this entry. Returns true when the
    /// datapath image is now out of date.
    fn resync(&self) -> bool;
}

/// Shared entry storage. The `Arc` allocation address is the entry's stable
/// identity inside the dependency graph and the registries.
pub type EntryArc = Arc<dyn SyncEntry>;

/// Identity of an entry: the address of its shared allocation.
pub fn entry_id(entry: &EntryArc) -> usize {
    Arc::as_ptr(entry) as *const () as usize
}

/// Counted handle to an entry.
///
/// Every referring collaborator holds entries through `EntryRef`; the count
/// it maintains is what defers DELETE until the last reference drops.
/// Dropping the handle that leaves only the registry's own reference while
/// the entry sits in `Temp` or `DelDeferRef` delivers [`SyncEvent::RefRelease`]
/// to the state machine.
pub struct EntryRef {
    entry: EntryArc,
}

impl EntryRef {
    pub fn new(entry: EntryArc) -> Self {
        entry.core().refcount.fetch_add(1, MemOrder::AcqRel);
        Self { entry }
    }

    pub fn entry(&self) -> &EntryArc {
        &self.entry
    }

    pub fn id(&self) -> usize {
        entry_id(&self.entry)
    }
}

impl Clone for EntryRef {
    fn clone(&self) -> Self {
        Self::new(self.entry.clone())
    }
}

impl Deref for EntryRef {
    type Target = dyn SyncEntry;

    fn deref(&self) -> &Self::Target {
        &*self.entry
    }
}

impl fmt::Debug for EntryRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryRef")
            .field("entry", &self.entry.describe())
            .field("state", &self.entry.core().state())
            .field("refcount", &self.entry.core().refcount())
            .finish()
    }
}

impl Drop for EntryRef {
    fn drop(&mut self) {
        let prev = self.entry.core().refcount.fetch_sub(1, MemOrder::AcqRel);
        if prev - 1 == 1 {
            match self.entry.core().state() {
                SyncState::Temp | SyncState::DelDeferRef => {
                    self.entry.object().safe_notify(&self.entry, SyncEvent::RefRelease);
                }
                _ => {}
            }
        }
    }
}

/// True when the entry has a valid index (if its type needs one), its data
/// is resolved, and its state lies between in-sync and delete-deferral.
pub fn is_resolved(entry: &dyn SyncEntry) -> bool {
    if entry.object().needs_index() && entry.core().index() == INVALID_INDEX {
        return false;
    }
    if !entry.is_data_resolved() {
        return false;
    }
    let state = entry.core().state();
    state >= SyncState::InSync && state < SyncState::DelDeferSync
}

/// True for every delete-deferral and delete-wait state: the entry has been
/// logically deleted by its owner.
pub fn is_deleted(entry: &dyn SyncEntry) -> bool {
    matches!(
        entry.core().state(),
        SyncState::DelAckWait
            | SyncState::DelDeferDelAck
            | SyncState::DelDeferSync
            | SyncState::DelDeferRef
    )
}

#[cfg(test)]
#[path = "entry_tests.rs"]
mod tests;
