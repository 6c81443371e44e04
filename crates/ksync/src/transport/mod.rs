// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Request/response demultiplexer over the datapath wire: sequence-number
//! allocation, bulked sends with ack-window backpressure, and receive-side
//! fan-out to per-queue workers.

pub mod bulk;
pub mod codec;
pub mod netlink;
pub mod stream;
pub mod udp;
pub mod wire;

pub use codec::{FlowInfo, TableInfo, TableKind};
pub use wire::Wire;

use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering as MemOrder};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::entry::{EntryArc, SyncEvent};
use crate::error::DatapathError;
use bulk::BulkContext;

/// Receive buffer per message.
pub const RECV_BUF_LEN: usize = 4096;
/// Outstanding-context ceiling gating new drain cycles on the send task.
pub const ACK_WAIT_THRESHOLD: usize = 200;
/// Bulking caps.
pub const MAX_BULK_MESSAGES: usize = 16;
pub const MAX_BULK_BYTES: usize = 4096;

/// Work-queue identity of a request/response pair, recovered from the low
/// bit of the sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkQueueId {
    Default,
    Telemetry,
}

impl WorkQueueId {
    pub fn from_seq(seq: u32) -> Self {
        if seq & 1 == 1 {
            Self::Default
        } else {
            Self::Telemetry
        }
    }

    fn slot(self) -> usize {
        match self {
            Self::Default => 0,
            Self::Telemetry => 1,
        }
    }
}

/// Per-entry response payloads surfaced to the entry before its ack event.
#[derive(Debug, Clone, Copy)]
pub enum ResponseInfo {
    Flow(FlowInfo),
}

/// One in-flight request: the owned request bytes, the originating entry
/// (absent for telemetry traffic), and the ack event to deliver.
///
/// The entry handle is deliberately uncounted: an entry with a request on
/// the wire is parked in a wait state and pinned by its registry, and the
/// in-flight window must not defer deletes the way real references do.
pub struct IoContext {
    pub(crate) entry: Option<EntryArc>,
    pub(crate) msg: Vec<u8>,
    pub(crate) seq: u32,
    pub(crate) event: SyncEvent,
    pub(crate) queue: WorkQueueId,
}

struct SendChannel {
    tx: mpsc::UnboundedSender<IoContext>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<IoContext>>>,
}

#[derive(Default)]
struct Stats {
    tx_count: AtomicU64,
    ack_count: AtomicU64,
    err_count: AtomicU64,
}

/// One transport instance: a wire, its in-flight window, and its task set.
pub struct Transport {
    wire: Arc<dyn Wire>,
    seq: AtomicU32,
    telemetry_seq: AtomicU32,
    wait: Mutex<BTreeMap<u32, BulkContext>>,
    window_free: Notify,
    send: SendChannel,
    /// Test mode: sends loop replies back synchronously; acks are delivered
    /// by an explicit [`Transport::drain_inline`] instead of worker tasks.
    inline: AtomicBool,
    max_bulk_messages: usize,
    max_bulk_bytes: usize,
    ack_wait_threshold: usize,
    stats: Stats,
}

impl Transport {
    pub fn new(wire: Arc<dyn Wire>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            wire,
            seq: AtomicU32::new(0),
            telemetry_seq: AtomicU32::new(0),
            wait: Mutex::new(BTreeMap::new()),
            window_free: Notify::new(),
            send: SendChannel { tx, rx: Mutex::new(Some(rx)) },
            inline: AtomicBool::new(false),
            max_bulk_messages: MAX_BULK_MESSAGES,
            max_bulk_bytes: MAX_BULK_BYTES,
            ack_wait_threshold: ACK_WAIT_THRESHOLD,
            stats: Stats::default(),
        })
    }

    /// Test-mode transport: every send is answered synchronously by the
    /// wire and processed by [`Transport::drain_inline`].
    pub fn new_inline(wire: Arc<dyn Wire>) -> Arc<Self> {
        let transport = Self::new(wire);
        transport.inline.store(true, MemOrder::Relaxed);
        transport
    }

    pub fn wire(&self) -> &Arc<dyn Wire> {
        &self.wire
    }

    /// Monotonic sequence numbers; two parallel counters keep default and
    /// telemetry traffic in disjoint spaces (the low bit demuxes them).
    pub fn alloc_seqno(&self, telemetry: bool) -> u32 {
        if telemetry {
            self.telemetry_seq.fetch_add(2, MemOrder::Relaxed).wrapping_add(2)
        } else {
            self.seq.fetch_add(2, MemOrder::Relaxed) | 1
        }
    }

    pub fn in_flight(&self) -> usize {
        self.wait.lock().len()
    }

    pub fn tx_count(&self) -> u64 {
        self.stats.tx_count.load(MemOrder::Relaxed)
    }

    pub fn ack_count(&self) -> u64 {
        self.stats.ack_count.load(MemOrder::Relaxed)
    }

    pub fn err_count(&self) -> u64 {
        self.stats.err_count.load(MemOrder::Relaxed)
    }

    /// Queue one per-entry request. `event` is the ack delivered to the
    /// entry's state machine once the datapath answers.
    pub fn send_async(&self, entry: &EntryArc, msg: Vec<u8>, event: SyncEvent) {
        let seq = self.alloc_seqno(false);
        let ioc = IoContext {
            entry: Some(entry.clone()),
            msg,
            seq,
            event,
            queue: WorkQueueId::Default,
        };
        self.dispatch(ioc);
    }

    /// Queue a telemetry request with no originating entry.
    pub fn send_telemetry(&self, msg: Vec<u8>) {
        let seq = self.alloc_seqno(true);
        let ioc = IoContext {
            entry: None,
            msg,
            seq,
            event: SyncEvent::AddAck,
            queue: WorkQueueId::Telemetry,
        };
        self.dispatch(ioc);
    }

    fn dispatch(&self, ioc: IoContext) {
        if self.inline.load(MemOrder::Relaxed) {
            let mut bulk = BulkContext::new(ioc.queue);
            bulk.push(ioc);
            self.send_bulk_blocking(bulk);
            return;
        }
        let _ = self.send.tx.send(ioc);
    }

    fn send_bulk_blocking(&self, bulk: BulkContext) {
        let seq = bulk.seq();
        let frame = self.wire.frame(&bulk.concat(), seq);
        {
            let mut wait = self.wait.lock();
            let prior = wait.insert(seq, bulk);
            assert!(prior.is_none(), "duplicate in-flight seqno {seq}");
        }
        self.stats.tx_count.fetch_add(1, MemOrder::Relaxed);
        if let Err(e) = self.wire.send_blocking(&frame) {
            error!(error = %e, "datapath send failed");
            std::process::exit(1);
        }
    }

    /// Test mode only: synchronously process every reply the wire has
    /// queued. Returns the number of messages handled.
    pub fn drain_inline(&self) -> usize {
        let mut buf = vec![0u8; RECV_BUF_LEN];
        let mut handled = 0;
        loop {
            match self.wire.recv_blocking(&mut buf) {
                Ok(n) => {
                    self.ingest(&buf[..n]);
                    handled += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!(error = %e, "datapath receive failed");
                    std::process::exit(1);
                }
            }
        }
        handled
    }

    /// Spawn the send drain task, the wire receive task, and one response
    /// worker per queue identity.
    pub fn start(self: &Arc<Self>, shutdown: CancellationToken) {
        assert!(!self.inline.load(MemOrder::Relaxed));

        let mut worker_txs = Vec::new();
        for _ in 0..2 {
            let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
            worker_txs.push(tx);
            let transport = Arc::clone(self);
            let cancel = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    let msg = tokio::select! {
                        _ = cancel.cancelled() => break,
                        msg = rx.recv() => match msg {
                            Some(msg) => msg,
                            None => break,
                        },
                    };
                    transport.ingest(&msg);
                }
            });
        }

        let transport = Arc::clone(self);
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            transport.recv_loop(worker_txs, cancel).await;
        });

        let transport = Arc::clone(self);
        tokio::spawn(async move {
            transport.send_loop(shutdown).await;
        });
    }

    async fn recv_loop(
        self: Arc<Self>,
        workers: Vec<mpsc::UnboundedSender<Bytes>>,
        shutdown: CancellationToken,
    ) {
        let mut buf = vec![0u8; RECV_BUF_LEN];
        loop {
            let n = tokio::select! {
                _ = shutdown.cancelled() => break,
                n = self.wire.recv(&mut buf) => n,
            };
            let n = match n {
                Ok(n) => n,
                Err(e) => {
                    if shutdown.is_cancelled() {
                        break;
                    }
                    // Losing the datapath socket leaves unknown state behind;
                    // exit so the supervisor restarts the agent fresh.
                    error!(error = %e, "datapath socket lost");
                    std::process::exit(1);
                }
            };
            let data = &buf[..n];
            if let Err(fe) = self.wire.validate(data) {
                error!(error = %fe, "datapath framing violation");
                std::process::abort();
            }
            let queue = WorkQueueId::from_seq(self.wire.seqno(data));
            let _ = workers[queue.slot()].send(Bytes::copy_from_slice(data));
        }
    }

    async fn send_loop(self: Arc<Self>, shutdown: CancellationToken) {
        let mut rx = match self.send.rx.lock().take() {
            Some(rx) => rx,
            None => return,
        };
        let mut carry: Option<IoContext> = None;

        loop {
            let first = match carry.take() {
                Some(ioc) => ioc,
                None => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        ioc = rx.recv() => match ioc {
                            Some(ioc) => ioc,
                            None => break,
                        },
                    }
                }
            };

            // Ack-window backpressure: refuse to start a drain cycle while
            // too many contexts are outstanding.
            while self.in_flight() > self.ack_wait_threshold {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = self.window_free.notified() => {}
                }
            }

            let mut bulk = BulkContext::new(first.queue);
            bulk.push(first);
            while bulk.len() < self.max_bulk_messages && bulk.bytes() < self.max_bulk_bytes {
                match rx.try_recv() {
                    Ok(next) if next.queue == bulk.queue() => bulk.push(next),
                    Ok(next) => {
                        carry = Some(next);
                        break;
                    }
                    Err(_) => break,
                }
            }

            let seq = bulk.seq();
            let frame = self.wire.frame(&bulk.concat(), seq);
            {
                let mut wait = self.wait.lock();
                let prior = wait.insert(seq, bulk);
                assert!(prior.is_none(), "duplicate in-flight seqno {seq}");
            }
            self.stats.tx_count.fetch_add(1, MemOrder::Relaxed);
            // No object lock is held here; the wire may sleep briefly.
            if let Err(e) = self.wire.send(&frame).await {
                error!(error = %e, "datapath send failed");
                std::process::exit(1);
            }
        }
    }

    /// Decode one received message: match it to its in-flight context, walk
    /// the response envelopes, route errors, and deliver acks when the final
    /// segment lands.
    fn ingest(&self, data: &[u8]) {
        let seq = self.wire.seqno(data);
        let mut bulk = {
            let mut wait = self.wait.lock();
            match wait.remove(&seq) {
                Some(bulk) => bulk,
                None => unreachable!("response for unknown seqno {seq}"),
            }
        };

        for (kind, payload) in codec::BlobIter::new(self.wire.payload(data)) {
            match kind {
                codec::BLOB_VR_RESPONSE => {
                    let code = codec::parse_vr_response(payload).unwrap_or(0);
                    let ioc = match bulk.next_response() {
                        Some(ioc) => ioc,
                        None => {
                            unreachable!("more response envelopes than requests for {seq}")
                        }
                    };
                    if code != 0 {
                        let errno = -code;
                        self.stats.err_count.fetch_add(1, MemOrder::Relaxed);
                        debug!(
                            seq = ioc.seq,
                            errno,
                            error = %DatapathError::from_errno(errno),
                            "datapath reported error"
                        );
                        if let Some(entry) = &ioc.entry {
                            entry.error_handler(errno, ioc.seq, ioc.event);
                        }
                    }
                }
                codec::BLOB_FLOW_INFO => {
                    if let Some(info) = codec::parse_flow_info(payload) {
                        if let Some(ioc) = bulk.current() {
                            if let Some(entry) = &ioc.entry {
                                entry.response(&ResponseInfo::Flow(info));
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        if self.wire.is_more_data(data) {
            // Keep the context alive until the terminating segment.
            self.wait.lock().insert(seq, bulk);
            return;
        }

        assert!(
            bulk.responses_complete(),
            "response for seqno {seq} ended short of its requests"
        );
        self.stats.ack_count.fetch_add(1, MemOrder::Relaxed);
        for ioc in bulk.into_members() {
            if let Some(entry) = ioc.entry {
                let object = entry.object();
                object.safe_notify(&entry, ioc.event);
            }
        }
        self.window_free.notify_waiters();
    }

    /// Startup priming path: frame and send one request synchronously.
    /// Returns the sequence number to match the reply against.
    pub fn blocking_send(&self, blobs: &[u8]) -> io::Result<u32> {
        let seq = self.alloc_seqno(false);
        let frame = self.wire.frame(blobs, seq);
        self.wire.send_blocking(&frame)?;
        Ok(seq)
    }

    /// Startup priming path: receive one full (possibly multi-segment)
    /// response, handing each blob to `on_blob`. Returns true if any
    /// response envelope carried an error.
    pub fn blocking_recv(
        &self,
        mut on_blob: impl FnMut(u16, &[u8]),
    ) -> io::Result<bool> {
        let mut buf = vec![0u8; RECV_BUF_LEN];
        let mut saw_error = false;
        loop {
            let n = self.wire.recv_blocking(&mut buf)?;
            let data = &buf[..n];
            if let Err(fe) = self.wire.validate(data) {
                error!(error = %fe, "datapath framing violation");
                std::process::abort();
            }
            for (kind, payload) in codec::BlobIter::new(self.wire.payload(data)) {
                if kind == codec::BLOB_VR_RESPONSE {
                    if let Some(code) = codec::parse_vr_response(payload) {
                        if code != 0 {
                            let errno = -code;
                            error!(
                                errno,
                                error = %DatapathError::from_errno(errno),
                                "datapath error during priming"
                            );
                            saw_error = true;
                        }
                    }
                }
                on_blob(kind, payload);
            }
            if !self.wire.is_more_data(data) {
                return Ok(saw_error);
            }
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        let wait = self.wait.lock();
        assert!(wait.is_empty(), "transport destroyed with {} in-flight contexts", wait.len());
    }
}

#[cfg(test)]
#[path = "transport_tests.rs"]
mod tests;
