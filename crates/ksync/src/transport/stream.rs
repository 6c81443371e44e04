// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Stream wire over TCP or a UNIX domain socket, for an out-of-process
//! datapath. Messages are reassembled across socket reads using the length
//! field of the netlink-style header; loss of the connection is fatal to
//! the agent.

use std::future::Future;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::Mutex as AsyncMutex;

use super::codec;
use super::wire::Wire;
use crate::error::FramingError;

/// Where the datapath listens.
#[derive(Debug, Clone)]
pub enum StreamEndpoint {
    Tcp(std::net::SocketAddr),
    Unix(PathBuf),
}

enum PrimeStream {
    Tcp(std::net::TcpStream),
    Unix(std::os::unix::net::UnixStream),
}

impl PrimeStream {
    fn connect(endpoint: &StreamEndpoint) -> io::Result<Self> {
        match endpoint {
            StreamEndpoint::Tcp(addr) => Ok(Self::Tcp(std::net::TcpStream::connect(addr)?)),
            StreamEndpoint::Unix(path) => {
                Ok(Self::Unix(std::os::unix::net::UnixStream::connect(path)?))
            }
        }
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.write_all(data),
            Self::Unix(s) => s.write_all(data),
        }
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.read_exact(buf),
            Self::Unix(s) => s.read_exact(buf),
        }
    }
}

pub struct StreamWire {
    read: AsyncMutex<Box<dyn AsyncRead + Send + Unpin>>,
    write: AsyncMutex<Box<dyn AsyncWrite + Send + Unpin>>,
    /// Lazily-opened second connection for the synchronous priming path
    /// (table parameter queries before the event loop starts).
    prime: parking_lot::Mutex<Option<PrimeStream>>,
    endpoint: StreamEndpoint,
    family: u16,
    pid: u32,
}

impl StreamWire {
    pub async fn connect(endpoint: StreamEndpoint, family: u16) -> anyhow::Result<Self> {
        let (read, write): (
            Box<dyn AsyncRead + Send + Unpin>,
            Box<dyn AsyncWrite + Send + Unpin>,
        ) = match &endpoint {
            StreamEndpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr).await?;
                stream.set_nodelay(true)?;
                let (r, w) = stream.into_split();
                (Box::new(r), Box::new(w))
            }
            StreamEndpoint::Unix(path) => {
                let stream = UnixStream::connect(path).await?;
                let (r, w) = stream.into_split();
                (Box::new(r), Box::new(w))
            }
        };
        Ok(Self {
            read: AsyncMutex::new(read),
            write: AsyncMutex::new(write),
            prime: parking_lot::Mutex::new(None),
            endpoint,
            family,
            pid: std::process::id(),
        })
    }

    fn with_prime<R>(&self, f: impl FnOnce(&mut PrimeStream) -> io::Result<R>) -> io::Result<R> {
        let mut guard = self.prime.lock();
        if guard.is_none() {
            *guard = Some(PrimeStream::connect(&self.endpoint)?);
        }
        match guard.as_mut() {
            Some(stream) => f(stream),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }
}

impl Wire for StreamWire {
    fn frame(&self, blobs: &[u8], seq: u32) -> Vec<u8> {
        codec::encode_frame(self.family, seq, self.pid, blobs)
    }

    fn send<'a>(
        &'a self,
        frame: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = io::Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut write = self.write.lock().await;
            write.write_all(frame).await?;
            write.flush().await
        })
    }

    fn recv<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = io::Result<usize>> + Send + 'a>> {
        Box::pin(async move {
            let mut read = self.read.lock().await;
            read.read_exact(&mut buf[..codec::HEADER_LEN]).await?;
            let total = codec::frame_len(&buf[..codec::HEADER_LEN]) as usize;
            if total < codec::HEADER_LEN || total > buf.len() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("stream message length {total} out of range"),
                ));
            }
            read.read_exact(&mut buf[codec::HEADER_LEN..total]).await?;
            Ok(total)
        })
    }

    fn send_blocking(&self, frame: &[u8]) -> io::Result<()> {
        self.with_prime(|stream| stream.write_all(frame))
    }

    fn recv_blocking(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.with_prime(|stream| {
            stream.read_exact(&mut buf[..codec::HEADER_LEN])?;
            let total = codec::frame_len(&buf[..codec::HEADER_LEN]) as usize;
            if total < codec::HEADER_LEN || total > buf.len() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("stream message length {total} out of range"),
                ));
            }
            stream.read_exact(&mut buf[codec::HEADER_LEN..total])?;
            Ok(total)
        })
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
