// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::future::Future;
use std::io;
use std::pin::Pin;

use crate::error::FramingError;

/// One wire-level socket to the datapath.
///
/// All variants present the same contract: framing, sequence-number
/// extraction, multi-segment detection, and validation. Object-safe for use
/// as `Arc<dyn Wire>`.
pub trait Wire: Send + Sync + 'static {
    /// Frame a blob stream into one outgoing message for this wire.
    fn frame(&self, blobs: &[u8], seq: u32) -> Vec<u8>;

    /// Send one framed message. May sleep briefly under socket pressure but
    /// never waits for the datapath's reply.
    fn send<'a>(
        &'a self,
        frame: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = io::Result<()>> + Send + 'a>>;

    /// Receive one complete message into `buf`, reassembling across reads
    /// where the wire requires it.
    fn recv<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = io::Result<usize>> + Send + 'a>>;

    /// Synchronous send, used only on the startup priming path.
    fn send_blocking(&self, frame: &[u8]) -> io::Result<()>;

    /// Synchronous receive. Returns `WouldBlock` when nothing is pending
    /// (the in-process simulator uses this to signal an empty reply queue).
    fn recv_blocking(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Header sanity for a received message.
    fn validate(&self, data: &[u8]) -> Result<(), FramingError>;

    /// Sequence number of a received message.
    fn seqno(&self, data: &[u8]) -> u32;

    /// Do further segments of this response follow?
    fn is_more_data(&self, data: &[u8]) -> bool;

    /// Blob stream carried by a validated message.
    fn payload<'d>(&self, data: &'d [u8]) -> &'d [u8];
}
