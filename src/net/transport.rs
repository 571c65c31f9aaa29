//! Reliable ordered transports
//!
//! The control channel runs over any transport providing reliable ordered
//! framed delivery. `TcpTransport` frames messages over a non-blocking
//! stream with a length prefix; `MemoryTransport` is an in-process
//! loopback pair used by listen-server loopback and tests.

use crate::net::{NetError, NetResult};
use log::warn;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;

/// Largest accepted control frame
pub const MAX_FRAME_SIZE: usize = 65536;

/// A reliable ordered bidirectional byte stream carrying framed messages
pub trait Transport {
    /// Queue one frame for delivery
    fn send(&mut self, frame: &[u8]) -> NetResult<()>;

    /// Drain every complete frame received so far
    fn receive(&mut self) -> Vec<Vec<u8>>;

    /// Push queued outgoing frames to the remote end
    fn flush(&mut self);

    fn close(&mut self);

    fn is_open(&self) -> bool;

    fn remote_addr(&self) -> String;
}

#[derive(Default)]
struct MemoryEndpoint {
    inbox: VecDeque<Vec<u8>>,
    closed: bool,
}

/// One side of an in-process transport pair
pub struct MemoryTransport {
    /// Frames queued locally until flush
    outbox: Vec<Vec<u8>>,
    local: Arc<Mutex<MemoryEndpoint>>,
    remote: Arc<Mutex<MemoryEndpoint>>,
    addr: String,
}

impl MemoryTransport {
    /// Build a connected pair. The first element speaks as `addr_a`.
    pub fn pair(addr_a: &str, addr_b: &str) -> (MemoryTransport, MemoryTransport) {
        let end_a = Arc::new(Mutex::new(MemoryEndpoint::default()));
        let end_b = Arc::new(Mutex::new(MemoryEndpoint::default()));
        (
            MemoryTransport {
                outbox: Vec::new(),
                local: end_a.clone(),
                remote: end_b.clone(),
                addr: addr_b.to_string(),
            },
            MemoryTransport {
                outbox: Vec::new(),
                local: end_b,
                remote: end_a,
                addr: addr_a.to_string(),
            },
        )
    }
}

impl Transport for MemoryTransport {
    fn send(&mut self, frame: &[u8]) -> NetResult<()> {
        if frame.len() > MAX_FRAME_SIZE {
            return Err(NetError::FrameTooLarge { size: frame.len() });
        }
        if self.local.lock().closed {
            return Err(NetError::TransportClosed);
        }
        self.outbox.push(frame.to_vec());
        Ok(())
    }

    fn receive(&mut self) -> Vec<Vec<u8>> {
        let mut endpoint = self.local.lock();
        endpoint.inbox.drain(..).collect()
    }

    fn flush(&mut self) {
        let mut remote = self.remote.lock();
        if remote.closed {
            self.outbox.clear();
            return;
        }
        for frame in self.outbox.drain(..) {
            remote.inbox.push_back(frame);
        }
    }

    fn close(&mut self) {
        // Flush first so a final Failure message still arrives.
        self.flush();
        self.local.lock().closed = true;
        self.remote.lock().closed = true;
    }

    fn is_open(&self) -> bool {
        !self.local.lock().closed
    }

    fn remote_addr(&self) -> String {
        self.addr.clone()
    }
}

/// Transport over a non-blocking TCP stream with 4-byte length prefixes
pub struct TcpTransport {
    stream: TcpStream,
    remote: SocketAddr,
    recv_buffer: Vec<u8>,
    open: bool,
}

impl TcpTransport {
    pub fn new(stream: TcpStream, remote: SocketAddr) -> std::io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        Ok(TcpTransport {
            stream,
            remote,
            recv_buffer: Vec::with_capacity(8192),
            open: true,
        })
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, frame: &[u8]) -> NetResult<()> {
        if !self.open {
            return Err(NetError::TransportClosed);
        }
        if frame.len() > MAX_FRAME_SIZE {
            return Err(NetError::FrameTooLarge { size: frame.len() });
        }
        let len = frame.len() as u32;
        self.stream.write_all(&len.to_be_bytes())?;
        self.stream.write_all(frame)?;
        Ok(())
    }

    fn receive(&mut self) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        if !self.open {
            return frames;
        }

        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.open = false;
                    break;
                }
                Ok(n) => self.recv_buffer.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("tcp receive error from {}: {}", self.remote, e);
                    self.open = false;
                    break;
                }
            }
        }

        while self.recv_buffer.len() >= 4 {
            let len = u32::from_be_bytes([
                self.recv_buffer[0],
                self.recv_buffer[1],
                self.recv_buffer[2],
                self.recv_buffer[3],
            ]) as usize;
            if len > MAX_FRAME_SIZE {
                warn!("oversized frame ({} bytes) from {}", len, self.remote);
                self.open = false;
                break;
            }
            if self.recv_buffer.len() < 4 + len {
                break;
            }
            frames.push(self.recv_buffer[4..4 + len].to_vec());
            self.recv_buffer.drain(..4 + len);
        }
        frames
    }

    fn flush(&mut self) {
        let _ = self.stream.flush();
    }

    fn close(&mut self) {
        self.flush();
        self.open = false;
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn remote_addr(&self) -> String {
        self.remote.to_string()
    }
}
