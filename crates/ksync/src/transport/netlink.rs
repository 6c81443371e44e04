// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Netlink datagram wire: the production path to an in-kernel datapath.

use std::future::Future;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::pin::Pin;

use nix::sys::socket::{
    self, AddressFamily, MsgFlags, NetlinkAddr, SockFlag, SockProtocol, SockType,
};
use tokio::io::unix::AsyncFd;
use tracing::warn;

use super::codec;
use super::wire::Wire;
use crate::error::FramingError;

/// Kernel receive buffer forced on the socket; vrouter bursts acks.
const RECV_SOCK_BUF: usize = 256 * 1024;

/// Newtype so the fd can be driven by `AsyncFd`.
#[derive(Debug)]
struct SockFd(OwnedFd);

impl AsRawFd for SockFd {
    fn as_raw_fd(&self) -> std::os::fd::RawFd {
        self.0.as_raw_fd()
    }
}

pub struct NetlinkWire {
    afd: AsyncFd<SockFd>,
    family: u16,
    pid: u32,
}

impl NetlinkWire {
    /// Open and connect a generic-netlink socket to the kernel datapath.
    pub fn connect(family: u16) -> anyhow::Result<Self> {
        let fd = socket::socket(
            AddressFamily::Netlink,
            SockType::Datagram,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            SockProtocol::NetlinkGeneric,
        )?;
        socket::bind(fd.as_raw_fd(), &NetlinkAddr::new(0, 0))?;
        if let Err(e) = socket::setsockopt(&fd, socket::sockopt::RcvBufForce, &RECV_SOCK_BUF) {
            warn!(error = %e, "could not force netlink receive buffer size");
        }
        socket::connect(fd.as_raw_fd(), &NetlinkAddr::new(0, 0))?;
        let pid = std::process::id();
        Ok(Self { afd: AsyncFd::new(SockFd(fd))?, family, pid })
    }

    fn send_once(&self, frame: &[u8]) -> nix::Result<usize> {
        socket::send(self.afd.get_ref().as_raw_fd(), frame, MsgFlags::empty())
    }

    fn recv_once(&self, buf: &mut [u8]) -> nix::Result<usize> {
        socket::recv(self.afd.get_ref().as_raw_fd(), buf, MsgFlags::empty())
    }
}

fn io_err(e: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

impl Wire for NetlinkWire {
    fn frame(&self, blobs: &[u8], seq: u32) -> Vec<u8> {
        codec::encode_frame(self.family, seq, self.pid, blobs)
    }

    fn send<'a>(
        &'a self,
        frame: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = io::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            loop {
                let mut guard = self.afd.writable().await?;
                match guard.try_io(|_| self.send_once(frame).map_err(io_err)) {
                    Ok(result) => {
                        result?;
                        return Ok(());
                    }
                    Err(_would_block) => continue,
                }
            }
        })
    }

    fn recv<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = io::Result<usize>> + Send + 'a>> {
        Box::pin(async move {
            loop {
                let mut guard = self.afd.readable().await?;
                match guard.try_io(|_| self.recv_once(buf).map_err(io_err)) {
                    Ok(result) => return result,
                    Err(_would_block) => continue,
                }
            }
        })
    }

    fn send_blocking(&self, frame: &[u8]) -> io::Result<()> {
        loop {
            match self.send_once(frame) {
                Ok(_) => return Ok(()),
                Err(nix::errno::Errno::EAGAIN) => {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Err(e) => return Err(io_err(e)),
            }
        }
    }

    fn recv_blocking(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.recv_once(buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EAGAIN) => {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Err(e) => return Err(io_err(e)),
            }
        }
    }

    fn validate(&self, data: &[u8]) -> Result<(), FramingError> {
        codec::validate_frame(data, self.family)
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
