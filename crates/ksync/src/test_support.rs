// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! In-process datapath simulator and shared fixtures for unit and
//! integration tests.

use std::any::Any;
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as MemOrder};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::deps::DependencyGraph;
use crate::entry::{EntryArc, EntryCore, EntryRef, SyncEntry};
use crate::error::FramingError;
use crate::flow::{Flow, FlowEventSink, FlowKey, INVALID_FLOW_HANDLE};
use crate::object::EntryObject;
use crate::transport::codec::{self, FlowInfo};
use crate::transport::{Transport, Wire};

/// Family id the simulator speaks.
pub const TEST_FAMILY: u16 = 24;

#[derive(Default)]
struct MockState {
    replies: VecDeque<Vec<u8>>,
    sent: Vec<Vec<u8>>,
    requests: Vec<(u16, Vec<u8>)>,
    errors: VecDeque<i32>,
    assign_next: Option<(u32, u8)>,
}

/// Loopback wire simulating the datapath: every request is answered with
/// one `vr_response` envelope per blob, synchronously queued for the
/// transport to drain. Flow requests submitted without a slot get one
/// assigned when an assignment is programmed.
pub struct MockWire {
    state: Mutex<MockState>,
    notify: Notify,
}

impl MockWire {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { state: Mutex::new(MockState::default()), notify: Notify::new() })
    }

    /// Inject an errno for the next response envelope.
    pub fn push_error(&self, errno: i32) {
        self.state.lock().errors.push_back(errno);
    }

    /// Program the slot the next handle-less flow request is assigned.
    pub fn assign_next_flow_index(&self, index: u32, gen_id: u8) {
        self.state.lock().assign_next = Some((index, gen_id));
    }

    /// Frames sent so far.
    pub fn sent_count(&self) -> usize {
        self.state.lock().sent.len()
    }

    /// Every request blob seen, in order.
    pub fn requests(&self) -> Vec<(u16, Vec<u8>)> {
        self.state.lock().requests.clone()
    }

    pub fn requests_of_kind(&self, kind: u16) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn pending_replies(&self) -> usize {
        self.state.lock().replies.len()
    }

    fn answer(&self, frame: &[u8]) {
        let seq = codec::frame_seq(frame);
        let mut state = self.state.lock();
        state.sent.push(frame.to_vec());

        let mut blobs = Vec::new();
        for (kind, payload) in codec::BlobIter::new(codec::frame_payload(frame)) {
            state.requests.push((kind, payload.to_vec()));
            let code = match state.errors.pop_front() {
                Some(errno) => -errno,
                None => 0,
            };
            codec::write_blob(&mut blobs, codec::BLOB_VR_RESPONSE, &codec::encode_vr_response(code));

            match kind {
                codec::BLOB_FLOW_REQ if payload.len() >= 6 => {
                    let index = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
                    let gen_id = payload[5];
                    let info = if index == INVALID_FLOW_HANDLE {
                        state.assign_next.take().map(|(index, gen_id)| FlowInfo {
                            index,
                            gen_id,
                            flags: 0,
                        })
                    } else {
                        Some(FlowInfo { index, gen_id, flags: 0 })
                    };
                    if let Some(info) = info {
                        codec::write_blob(
                            &mut blobs,
                            codec::BLOB_FLOW_INFO,
                            &codec::encode_flow_info(&info),
                        );
                    }
                }
                codec::BLOB_TABLE_REQ => {
                    // The simulator has no device to map; report a small
                    // heap-sized table.
                    let info = codec::TableInfo {
                        major_dev: 0,
                        entry_size: std::mem::size_of::<crate::shmem::KernelFlowSlot>() as u32,
                        size: 0,
                        path: String::new(),
                    };
                    codec::write_blob(
                        &mut blobs,
                        codec::BLOB_TABLE_INFO,
                        &codec::encode_table_info(&info),
                    );
                }
                _ => {}
            }
        }

        state.replies.push_back(codec::encode_frame_multi(TEST_FAMILY, seq, &blobs, false));
        drop(state);
        self.notify.notify_one();
    }
}

impl Wire for MockWire {
    fn frame(&self, blobs: &[u8], seq: u32) -> Vec<u8> {
        codec::encode_frame(TEST_FAMILY, seq, 0, blobs)
    }

    fn send<'a>(
        &'a self,
        frame: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = io::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.answer(frame);
            Ok(())
        })
    }

    fn recv<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = io::Result<usize>> + Send + 'a>> {
        Box::pin(async move {
            loop {
                if let Some(reply) = self.state.lock().replies.pop_front() {
                    buf[..reply.len()].copy_from_slice(&reply);
                    return Ok(reply.len());
                }
                self.notify.notified().await;
            }
        })
    }

    fn send_blocking(&self, frame: &[u8]) -> io::Result<()> {
        self.answer(frame);
        Ok(())
    }

    fn recv_blocking(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self.state.lock().replies.pop_front() {
            Some(reply) => {
                buf[..reply.len()].copy_from_slice(&reply);
                Ok(reply.len())
            }
            None => Err(io::Error::from(io::ErrorKind::WouldBlock)),
        }
    }

    fn validate(&self, data: &[u8]) -> Result<(), FramingError> {
        codec::validate_frame(data, TEST_FAMILY)
    }

    fn seqno(&self, data: &[u8]) -> u32 {
        codec::frame_seq(data)
    }

    fn is_more_data(&self, data: &[u8]) -> bool {
        codec::frame_has_more(data)
    }

    fn payload<'d>(&self, data: &'d [u8]) -> &'d [u8] {
        codec::frame_payload(data)
    }
}

/// Inline transport over a fresh simulator.
pub fn inline_transport() -> (Arc<Transport>, Arc<MockWire>) {
    let wire = MockWire::new();
    let transport = Transport::new_inline(wire.clone());
    (transport, wire)
}

/// Simple keyed entry for exercising the engine.
pub struct TestEntry {
    core: EntryCore,
    object: Arc<EntryObject>,
    key: u32,
    dep: Mutex<Option<EntryRef>>,
    data_resolved: AtomicBool,
    allow_delete_comp: AtomicBool,
    /// Encode nothing: every operation completes synchronously.
    silent: AtomicBool,
    /// Pending upstream change, consumed by `resync`.
    source_dirty: AtomicBool,
    cleanup_calls: AtomicUsize,
    empty_table_calls: Arc<AtomicUsize>,
    errors: Mutex<Vec<(i32, u32)>>,
}

impl TestEntry {
    pub fn new(object: &Arc<EntryObject>, key: u32) -> Arc<Self> {
        Arc::new(Self {
            core: EntryCore::new(),
            object: Arc::clone(object),
            key,
            dep: Mutex::new(None),
            data_resolved: AtomicBool::new(true),
            allow_delete_comp: AtomicBool::new(true),
            silent: AtomicBool::new(false),
            source_dirty: AtomicBool::new(false),
            cleanup_calls: AtomicUsize::new(0),
            empty_table_calls: Arc::new(AtomicUsize::new(0)),
            errors: Mutex::new(Vec::new()),
        })
    }

    pub fn key(&self) -> u32 {
        self.key
    }

    pub fn set_dependency(&self, dep: Option<EntryRef>) {
        *self.dep.lock() = dep;
    }

    pub fn set_data_resolved(&self, resolved: bool) {
        self.data_resolved.store(resolved, MemOrder::Relaxed);
    }

    pub fn set_allow_delete_comp(&self, allow: bool) {
        self.allow_delete_comp.store(allow, MemOrder::Relaxed);
    }

    pub fn set_silent(&self, silent: bool) {
        self.silent.store(silent, MemOrder::Relaxed);
    }

    /// Mark the mirrored upstream record as changed.
    pub fn touch_source(&self) {
        self.source_dirty.store(true, MemOrder::Relaxed);
    }

    pub fn errors(&self) -> Vec<(i32, u32)> {
        self.errors.lock().clone()
    }

    pub fn cleanup_calls(&self) -> usize {
        self.cleanup_calls.load(MemOrder::Relaxed)
    }

    pub fn empty_table_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.empty_table_calls)
    }

    fn encode_op(&self, op: u8, buf: &mut Vec<u8>) -> usize {
        if self.silent.load(MemOrder::Relaxed) {
            return 0;
        }
        let mut payload = Vec::with_capacity(5);
        payload.push(op);
        payload.extend_from_slice(&self.key.to_le_bytes());
        let before = buf.len();
        codec::write_blob(buf, codec::BLOB_OBJECT_REQ, &payload);
        buf.len() - before
    }
}

impl SyncEntry for TestEntry {
    fn core(&self) -> &EntryCore {
        &self.core
    }

    fn object(&self) -> Arc<EntryObject> {
        Arc::clone(&self.object)
    }

    fn cmp_key(&self, other: &dyn SyncEntry) -> Ordering {
        match other.as_any().downcast_ref::<TestEntry>() {
            Some(rhs) => self.key.cmp(&rhs.key),
            None => Ordering::Less,
        }
    }

    fn describe(&self) -> String {
        format!("test-entry {}", self.key)
    }

    fn unresolved_reference(&self) -> Option<EntryRef> {
        let dep = self.dep.lock();
        match &*dep {
            Some(dep) if !crate::entry::is_resolved(&**dep.entry()) => Some(dep.clone()),
            _ => None,
        }
    }

    fn is_data_resolved(&self) -> bool {
        self.data_resolved.load(MemOrder::Relaxed)
    }

    fn allow_delete_state_comp(&self) -> bool {
        self.allow_delete_comp.load(MemOrder::Relaxed)
    }

    fn cleanup_on_del(&self) {
        self.cleanup_calls.fetch_add(1, MemOrder::Relaxed);
    }

    fn empty_table(&self) {
        self.empty_table_calls.fetch_add(1, MemOrder::Relaxed);
    }

    fn encode_add(&self, buf: &mut Vec<u8>) -> usize {
        self.encode_op(1, buf)
    }

    fn encode_change(&self, buf: &mut Vec<u8>) -> usize {
        self.encode_op(2, buf)
    }

    fn encode_delete(&self, buf: &mut Vec<u8>) -> usize {
        self.encode_op(3, buf)
    }

    fn error_handler(&self, err: i32, seq_no: u32, _event: crate::entry::SyncEvent) {
        self.errors.lock().push((err, seq_no));
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl crate::entry::SourceBacked for TestEntry {
    fn resync(&self) -> bool {
        self.source_dirty.swap(false, MemOrder::Relaxed)
    }
}

/// Upcast helper: unit tests hold typed entries but the engine API takes
/// `EntryArc`.
pub fn as_entry(entry: &Arc<TestEntry>) -> EntryArc {
    entry.clone()
}

/// Records eviction and audit callbacks for assertions.
#[derive(Default)]
pub struct RecordingSink {
    evictions: Mutex<Vec<(FlowKey, u32, u8, u8)>>,
    audits: Mutex<Vec<(FlowKey, u32)>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn evictions(&self) -> Vec<(FlowKey, u32, u8, u8)> {
        self.evictions.lock().clone()
    }

    pub fn audits(&self) -> Vec<(FlowKey, u32)> {
        self.audits.lock().clone()
    }
}

impl FlowEventSink for RecordingSink {
    fn evict(&self, flow: &Arc<Flow>, index: u32, gen_id: u8, evict_gen_id: u8) {
        self.evictions.lock().push((flow.key().clone(), index, gen_id, evict_gen_id));
    }

    fn audit_short_flow(&self, key: &FlowKey, index: u32) {
        self.audits.lock().push((key.clone(), index));
    }
}

/// Fresh graph + inline transport + registry, the common test scaffold.
pub struct TestScaffold {
    pub graph: Arc<DependencyGraph>,
    pub transport: Arc<Transport>,
    pub wire: Arc<MockWire>,
    pub object: Arc<EntryObject>,
}

pub fn scaffold() -> TestScaffold {
    scaffold_named("test-object")
}

pub fn scaffold_named(name: &str) -> TestScaffold {
    let graph = DependencyGraph::new();
    let (transport, wire) = inline_transport();
    let object = EntryObject::new(name, graph.clone(), transport.clone());
    TestScaffold { graph, transport, wire, object }
}

/// Scaffold whose registry allocates dense indices.
pub fn scaffold_with_index(name: &str, max_index: usize) -> TestScaffold {
    let graph = DependencyGraph::new();
    let (transport, wire) = inline_transport();
    let object = EntryObject::with_index_table(name, graph.clone(), transport.clone(), max_index);
    TestScaffold { graph, transport, wire, object }
}
