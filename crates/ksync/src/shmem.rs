// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Read-only mapping of the datapath flow/bridge table, and the audit sweep
//! that detects slots abandoned in HOLD.
//!
//! The mapping is never written through: datapath-mutated fields are atomics
//! so concurrent reads are defined, everything else is written by the
//! datapath before it publishes the slot as active.

// The mapped region can only be exposed through raw-pointer slices.
#![allow(unsafe_code)]

use std::collections::VecDeque;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::os::fd::OwnedFd;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU16, AtomicU64, AtomicU8, Ordering as MemOrder};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::sys::stat::{makedev, mknod, Mode, SFlag};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::flow::{FlowEventSink, FlowKey};
use crate::transport::codec::{self, TableInfo, TableKind};
use crate::transport::Transport;

/// Slot flags maintained by the datapath.
pub const FLOW_FLAG_ACTIVE: u16 = 0x0001;
pub const FLOW_FLAG_EVICTED: u16 = 0x0002;

/// Slot actions.
pub const FLOW_ACTION_HOLD: u16 = 0;
pub const FLOW_ACTION_FORWARD: u16 = 1;
pub const FLOW_ACTION_DROP: u16 = 2;

/// One slot of the kernel-exposed table. Layout is fixed ABI with the
/// datapath.
#[repr(C)]
pub struct KernelFlowSlot {
    pub flags: AtomicU16,
    pub action: AtomicU16,
    pub gen_id: AtomicU8,
    family: u8,
    proto: u8,
    _pad: u8,
    nh_id: u32,
    src: [u8; 16],
    dst: [u8; 16],
    src_port: u16,
    dst_port: u16,
    _pad2: [u8; 4],
    pub packets: AtomicU64,
    pub bytes: AtomicU64,
}

impl KernelFlowSlot {
    pub fn empty() -> Self {
        Self {
            flags: AtomicU16::new(0),
            action: AtomicU16::new(0),
            gen_id: AtomicU8::new(0),
            family: 0,
            proto: 0,
            _pad: 0,
            nh_id: 0,
            src: [0; 16],
            dst: [0; 16],
            src_port: 0,
            dst_port: 0,
            _pad2: [0; 4],
            packets: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    /// Test constructor with the key fields populated.
    pub fn with_key(key: &FlowKey) -> Self {
        let mut slot = Self::empty();
        slot.nh_id = key.nh_id;
        slot.proto = key.proto;
        slot.src_port = key.src_port;
        slot.dst_port = key.dst_port;
        match (key.src, key.dst) {
            (IpAddr::V4(s), IpAddr::V4(d)) => {
                slot.family = 4;
                slot.src[..4].copy_from_slice(&s.octets());
                slot.dst[..4].copy_from_slice(&d.octets());
            }
            (IpAddr::V6(s), IpAddr::V6(d)) => {
                slot.family = 6;
                slot.src.copy_from_slice(&s.octets());
                slot.dst.copy_from_slice(&d.octets());
            }
            _ => {}
        }
        slot
    }

    pub fn is_active(&self) -> bool {
        self.flags.load(MemOrder::Acquire) & FLOW_FLAG_ACTIVE != 0
    }

    pub fn is_evicted(&self) -> bool {
        self.flags.load(MemOrder::Acquire) & FLOW_FLAG_EVICTED != 0
    }

    pub fn is_hold(&self) -> bool {
        self.is_active() && self.action.load(MemOrder::Acquire) == FLOW_ACTION_HOLD
    }

    /// Reconstruct the 5-tuple the datapath stored in this slot.
    pub fn key(&self) -> Option<FlowKey> {
        let (src, dst): (IpAddr, IpAddr) = match self.family {
            4 => {
                let s: [u8; 4] = self.src[..4].try_into().ok()?;
                let d: [u8; 4] = self.dst[..4].try_into().ok()?;
                (IpAddr::from(s), IpAddr::from(d))
            }
            6 => (IpAddr::from(self.src), IpAddr::from(self.dst)),
            _ => return None,
        };
        Some(FlowKey {
            nh_id: self.nh_id,
            src,
            dst,
            proto: self.proto,
            src_port: self.src_port,
            dst_port: self.dst_port,
        })
    }
}

enum Backing {
    Mapped { base: NonNull<KernelFlowSlot>, bytes: usize, _fd: OwnedFd },
    Heap(Box<[KernelFlowSlot]>),
}

/// The agent-side view of one kernel-exposed table.
pub struct SharedTable {
    backing: Backing,
    count: usize,
}

// SAFETY: the mapped region is PROT_READ shared memory; every field the
// datapath mutates after publication is an atomic, and the agent never
// writes through the mapping.
unsafe impl Send for SharedTable {}
unsafe impl Sync for SharedTable {}

impl SharedTable {
    /// Map the device the datapath described. Creates the device node when
    /// absent and the platform lets userland do so.
    pub fn map_device(info: &TableInfo) -> anyhow::Result<Self> {
        let path = std::path::Path::new(&info.path);
        if !path.exists() {
            let mode = Mode::S_IRUSR | Mode::S_IWUSR;
            match mknod(path, SFlag::S_IFCHR, mode, makedev(u64::from(info.major_dev), 0)) {
                Ok(()) => info!(path = %info.path, "created table device node"),
                Err(e) => warn!(path = %info.path, error = %e, "could not create device node"),
            }
        }

        let fd = nix::fcntl::open(path, OFlag::O_RDONLY | OFlag::O_SYNC, Mode::empty())
            .with_context(|| format!("opening table device {}", info.path))?;

        let bytes = usize::try_from(info.size).context("table size out of range")?;
        let len = NonZeroUsize::new(bytes).context("datapath reported an empty table")?;
        // SAFETY: mapping a readable device region; the fd stays open for
        // the mapping's lifetime and the pointer is only read through
        // `slot()` within bounds.
        let base = unsafe {
            mmap(None, len, ProtFlags::PROT_READ, MapFlags::MAP_SHARED, &fd, 0)
                .context("mapping table memory")?
        };
        let entry_size = std::mem::size_of::<KernelFlowSlot>();
        assert_eq!(info.entry_size as usize, entry_size, "table slot ABI mismatch");
        let count = bytes / entry_size;
        info!(path = %info.path, count, "mapped datapath table");
        Ok(Self {
            backing: Backing::Mapped { base: base.cast(), bytes, _fd: fd },
            count,
        })
    }

    /// Heap-backed table for tests and the in-process simulator.
    pub fn heap_with(count: usize, init: impl Fn(usize) -> KernelFlowSlot) -> Self {
        let slots: Box<[KernelFlowSlot]> = (0..count).map(init).collect();
        Self { backing: Backing::Heap(slots), count }
    }

    pub fn heap(count: usize) -> Self {
        Self::heap_with(count, |_| KernelFlowSlot::empty())
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn slot(&self, index: u32) -> Option<&KernelFlowSlot> {
        let index = index as usize;
        if index >= self.count {
            return None;
        }
        match &self.backing {
            // SAFETY: index-checked above; the mapping covers `count` slots.
            Backing::Mapped { base, .. } => Some(unsafe { &*base.as_ptr().add(index) }),
            Backing::Heap(slots) => slots.get(index),
        }
    }

    /// Slot lookup honoring the active flag, the common read path.
    pub fn active_slot(&self, index: u32) -> Option<&KernelFlowSlot> {
        let slot = self.slot(index)?;
        slot.is_active().then_some(slot)
    }

    /// Validate that the slot still belongs to `(key, gen_id)` before
    /// trusting its counters.
    pub fn valid_slot(&self, key: &FlowKey, index: u32, gen_id: u8) -> Option<&KernelFlowSlot> {
        let slot = self.active_slot(index)?;
        if slot.gen_id.load(MemOrder::Acquire) != gen_id {
            return None;
        }
        if slot.key().as_ref() != Some(key) {
            return None;
        }
        Some(slot)
    }
}

impl Drop for SharedTable {
    fn drop(&mut self) {
        if let Backing::Mapped { base, bytes, .. } = &self.backing {
            // SAFETY: unmapping exactly the region mapped in `map_device`.
            let _ = unsafe { munmap(base.cast(), *bytes) };
        }
    }
}

/// Query the datapath for a table's parameters over the priming path.
pub fn query_table_info(transport: &Transport, kind: TableKind) -> anyhow::Result<TableInfo> {
    let mut blobs = Vec::new();
    codec::write_blob(&mut blobs, codec::BLOB_TABLE_REQ, &codec::encode_table_req(kind));
    transport.blocking_send(&blobs).context("sending table query")?;

    let mut info = None;
    transport
        .blocking_recv(|blob_kind, payload| {
            if blob_kind == codec::BLOB_TABLE_INFO {
                info = codec::parse_table_info(payload);
            }
        })
        .context("receiving table parameters")?;
    info.context("datapath did not return table parameters")
}

/// Audit sweep configuration.
#[derive(Debug, Clone, Copy)]
pub struct AuditConfig {
    /// Age a HOLD slot must reach before it is reported abandoned.
    pub timeout: Duration,
    /// Tick period.
    pub interval: Duration,
    /// Budget for one full pass over the table.
    pub sweep: Duration,
    /// Upper bound on slots visited per tick.
    pub yield_max: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            interval: Duration::from_millis(100),
            sweep: Duration::from_secs(180),
            yield_max: 4096,
        }
    }
}

/// Periodic walk over a shared table detecting abandoned HOLD slots.
///
/// Candidates enter a FIFO stamped with their discovery time; a later tick
/// re-checks anything older than the timeout and reports slots still in
/// HOLD so the flow layer can install a short flow and drive deletion.
pub struct AuditSweep {
    table: Arc<SharedTable>,
    sink: Arc<dyn FlowEventSink>,
    candidate: fn(&KernelFlowSlot) -> bool,
    timeout: Duration,
    yield_count: usize,
    interval: Duration,
    cursor: u32,
    pending: VecDeque<(u32, Instant)>,
}

/// HOLD detection for the flow table.
pub fn hold_candidate(slot: &KernelFlowSlot) -> bool {
    slot.is_hold()
}

/// Inactive-marker detection for the bridge table.
pub fn bridge_inactive_candidate(slot: &KernelFlowSlot) -> bool {
    slot.is_active() && slot.is_evicted()
}

impl AuditSweep {
    pub fn new(
        table: Arc<SharedTable>,
        sink: Arc<dyn FlowEventSink>,
        candidate: fn(&KernelFlowSlot) -> bool,
        config: AuditConfig,
    ) -> Self {
        // Size the per-tick yield so one full pass fits the sweep budget.
        let ticks_per_sweep =
            (config.sweep.as_millis() / config.interval.as_millis().max(1)).max(1) as usize;
        let yield_count = (table.count() / ticks_per_sweep).clamp(1, config.yield_max);
        Self {
            table,
            sink,
            candidate,
            timeout: config.timeout,
            yield_count,
            interval: config.interval,
            cursor: 0,
            pending: VecDeque::new(),
        }
    }

    pub fn yield_count(&self) -> usize {
        self.yield_count
    }

    /// One audit step: expire aged candidates, then scan the next window.
    pub fn tick(&mut self, now: Instant) {
        while let Some((index, seen_at)) = self.pending.front().copied() {
            // The FIFO is ordered by discovery time; stop at the first
            // entry still inside the timeout.
            if now.duration_since(seen_at) < self.timeout {
                break;
            }
            self.pending.pop_front();
            let Some(slot) = self.table.slot(index) else {
                continue;
            };
            if (self.candidate)(slot) {
                if let Some(key) = slot.key() {
                    warn!(index, %key, "abandoned datapath slot, requesting short flow");
                    self.sink.audit_short_flow(&key, index);
                }
            }
        }

        for _ in 0..self.yield_count {
            if let Some(slot) = self.table.slot(self.cursor) {
                if (self.candidate)(slot) {
                    self.pending.push_back((self.cursor, now));
                }
            }
            self.cursor += 1;
            if self.cursor as usize == self.table.count() {
                self.cursor = 0;
            }
        }
    }

    /// Run the sweep on its own task until shutdown.
    pub fn spawn(mut self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(self.interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = timer.tick() => self.tick(Instant::now()),
                }
            }
        })
    }
}

#[cfg(test)]
#[path = "shmem_tests.rs"]
mod tests;
