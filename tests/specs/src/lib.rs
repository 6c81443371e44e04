// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end engine tests.
//!
//! Runs a datapath simulator on a real UDP socket and points the engine's
//! production transport at it, so requests travel the full path: state
//! machine → send task → wire → simulator → receive task → ack.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use ksync::flow::INVALID_FLOW_HANDLE;
use ksync::transport::codec;

#[derive(Default)]
struct SimState {
    frames: usize,
    blobs: Vec<(u16, Vec<u8>)>,
    errors: VecDeque<i32>,
    assign_next: Option<(u32, u8)>,
}

/// An out-of-process-style datapath reachable over UDP loopback.
pub struct SimDatapath {
    addr: SocketAddr,
    state: Arc<Mutex<SimState>>,
    shutdown: CancellationToken,
}

impl SimDatapath {
    /// Bind the simulator and start answering requests.
    pub async fn start() -> anyhow::Result<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        let addr = socket.local_addr()?;
        let state: Arc<Mutex<SimState>> = Arc::default();
        let shutdown = CancellationToken::new();

        let task_state = Arc::clone(&state);
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 8192];
            loop {
                let (len, peer) = tokio::select! {
                    _ = cancel.cancelled() => break,
                    recv = socket.recv_from(&mut buf) => match recv {
                        Ok(pair) => pair,
                        Err(_) => break,
                    },
                };
                let frame = &buf[..len];
                if codec::validate_udp_frame(frame).is_err() {
                    continue;
                }
                let reply = answer(&task_state, frame);
                let _ = socket.send_to(&reply, peer).await;
            }
        });

        Ok(Self { addr, state, shutdown })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Inject an errno for the next response envelope.
    pub fn push_error(&self, errno: i32) {
        self.state.lock().errors.push_back(errno);
    }

    /// Program the slot assigned to the next handle-less flow request.
    pub fn assign_next_flow_index(&self, index: u32, gen_id: u8) {
        self.state.lock().assign_next = Some((index, gen_id));
    }

    /// Wire frames received so far.
    pub fn frame_count(&self) -> usize {
        self.state.lock().frames
    }

    /// Request blobs received so far, in arrival order.
    pub fn blobs(&self) -> Vec<(u16, Vec<u8>)> {
        self.state.lock().blobs.clone()
    }

    pub fn blobs_of_kind(&self, kind: u16) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .blobs
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

impl Drop for SimDatapath {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn answer(state: &Mutex<SimState>, frame: &[u8]) -> Vec<u8> {
    let seq = codec::udp_seq(frame);
    let mut state = state.lock();
    state.frames += 1;

    let mut reply = Vec::new();
    for (kind, payload) in codec::BlobIter::new(codec::udp_payload(frame)) {
        state.blobs.push((kind, payload.to_vec()));
        let code = match state.errors.pop_front() {
            Some(errno) => -errno,
            None => 0,
        };
        codec::write_blob(&mut reply, codec::BLOB_VR_RESPONSE, &codec::encode_vr_response(code));

        if kind == codec::BLOB_FLOW_REQ && payload.len() >= 6 {
            let index = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
            let gen_id = payload[5];
            let info = if index == INVALID_FLOW_HANDLE {
                state
                    .assign_next
                    .take()
                    .map(|(index, gen_id)| codec::FlowInfo { index, gen_id, flags: 0 })
            } else {
                Some(codec::FlowInfo { index, gen_id, flags: 0 })
            };
            if let Some(info) = info {
                codec::write_blob(&mut reply, codec::BLOB_FLOW_INFO, &codec::encode_flow_info(&info));
            }
        }
    }

    codec::encode_udp_frame(seq, &reply, false)
}

/// Poll until `predicate` holds or the timeout expires.
pub async fn wait_for(
    timeout: std::time::Duration,
    what: &str,
    mut predicate: impl FnMut() -> bool,
) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if predicate() {
            return Ok(());
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("{what} did not happen within {timeout:?}");
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
}
