// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! UDP loopback wire: talks to an out-of-process datapath simulator on
//! 127.0.0.1, with a lightweight header instead of the netlink one.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;

use tokio::net::UdpSocket;

use super::codec;
use super::wire::Wire;
use crate::error::FramingError;

pub struct UdpWire {
    sock: UdpSocket,
    /// Separate socket for the synchronous priming path, so the async
    /// receive loop never steals its replies.
    prime: std::net::UdpSocket,
}

impl UdpWire {
    pub async fn connect(server: SocketAddr) -> anyhow::Result<Self> {
        let sock = UdpSocket::bind("127.0.0.1:0").await?;
        sock.connect(server).await?;
        let prime = std::net::UdpSocket::bind("127.0.0.1:0")?;
        prime.connect(server)?;
        Ok(Self { sock, prime })
    }
}

impl Wire for UdpWire {
    fn frame(&self, blobs: &[u8], seq: u32) -> Vec<u8> {
        codec::encode_udp_frame(seq, blobs, false)
    }

    fn send<'a>(
        &'a self,
        frame: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = io::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.sock.send(frame).await?;
            Ok(())
        })
    }

    fn recv<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = io::Result<usize>> + Send + 'a>> {
        Box::pin(async move { self.sock.recv(buf).await })
    }

    fn send_blocking(&self, frame: &[u8]) -> io::Result<()> {
        self.prime.send(frame)?;
        Ok(())
    }

    fn recv_blocking(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.prime.recv(buf)
    }

    fn validate(&self, data: &[u8]) -> Result<(), FramingError> {
        codec::validate_udp_frame(data)
    }

    fn seqno(&self, data: &[u8]) -> u32 {
        codec::udp_seq(data)
    }

    fn is_more_data(&self, data: &[u8]) -> bool {
        codec::udp_has_more(data)
    }

    fn payload<'d>(&self, data: &'d [u8]) -> &'d [u8] {
        codec::udp_payload(data)
    }
}
