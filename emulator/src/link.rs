//! Transports that hand the controller MTU-sized segments.
//!
//! The controller treats a segment of exactly one fragment length as "more
//! to follow". Both links cut each packet into fragment-sized pieces and
//! close a packet that is an exact multiple with an empty segment.

use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use acquisition_core::Transport;
use acquisition_core::protocol::{HEADER_LEN, MAGIC, PacketHeader};
use log::{info, warn};

const READ_TIMEOUT: Duration = Duration::from_millis(1);

/// Splits `packet` into the segments the controller expects.
pub fn segments(packet: &[u8], fragment_len: usize) -> impl Iterator<Item = &[u8]> {
    let fragment_len = fragment_len.max(1);
    let terminator = (!packet.is_empty() && packet.len() % fragment_len == 0).then_some(&[][..]);
    packet.chunks(fragment_len).chain(terminator)
}

/// In-process transport used by the REPL.
#[derive(Debug, Default)]
pub struct Loopback {
    inbound: VecDeque<Vec<u8>>,
    outbound: Vec<u8>,
}

impl Loopback {
    pub fn push_packet(&mut self, packet: &[u8], fragment_len: usize) {
        self.inbound
            .extend(segments(packet, fragment_len).map(<[u8]>::to_vec));
    }

    /// Takes every byte the controller has sent since the last call.
    pub fn take_outbound(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.outbound)
    }
}

impl Transport for Loopback {
    type Error = io::Error;

    fn receive(&mut self, buffer: &mut [u8]) -> Result<Option<usize>, Self::Error> {
        let Some(segment) = self.inbound.pop_front() else {
            return Ok(None);
        };
        let len = segment.len().min(buffer.len());
        buffer[..len].copy_from_slice(&segment[..len]);
        Ok(Some(len))
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), Self::Error> {
        self.outbound.extend_from_slice(bytes);
        Ok(())
    }
}

/// TCP link to the most recently connected client.
pub struct TcpLink {
    fragment_len: usize,
    stream: Option<TcpStream>,
    pending: Vec<u8>,
    ready: VecDeque<Vec<u8>>,
}

impl TcpLink {
    pub fn new(fragment_len: usize) -> Self {
        Self {
            fragment_len,
            stream: None,
            pending: Vec::new(),
            ready: VecDeque::new(),
        }
    }

    /// Replaces the active connection; any partial input is dropped.
    ///
    /// # Errors
    ///
    /// Fails when the socket options cannot be applied.
    pub fn attach(&mut self, stream: TcpStream) -> io::Result<()> {
        stream.set_read_timeout(Some(READ_TIMEOUT))?;
        stream.set_nodelay(true)?;
        if self.stream.is_some() {
            info!("link: replacing previous client");
        }
        self.stream = Some(stream);
        self.pending.clear();
        self.ready.clear();
        Ok(())
    }

    pub fn detach(&mut self) {
        self.stream = None;
        self.pending.clear();
        self.ready.clear();
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn fill(&mut self) -> io::Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };

        let mut buffer = [0u8; 4096];
        match stream.read(&mut buffer) {
            Ok(0) => {
                info!("link: client disconnected");
                self.detach();
                return Ok(());
            }
            Ok(len) => self.pending.extend_from_slice(&buffer[..len]),
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(err) => return Err(err),
        }

        self.split_packets();
        Ok(())
    }

    /// Moves every complete packet from `pending` into `ready`.
    fn split_packets(&mut self) {
        while let Some(header) = PacketHeader::decode(&self.pending) {
            let total = if header.magic == MAGIC {
                HEADER_LEN + usize::from(header.length)
            } else {
                // No length to trust; let the controller reject what arrived.
                self.pending.len()
            };
            if self.pending.len() < total {
                return;
            }

            let packet: Vec<u8> = self.pending.drain(..total).collect();
            self.ready
                .extend(segments(&packet, self.fragment_len).map(<[u8]>::to_vec));
        }
    }
}

impl Transport for TcpLink {
    type Error = io::Error;

    fn receive(&mut self, buffer: &mut [u8]) -> Result<Option<usize>, Self::Error> {
        if self.ready.is_empty() {
            self.fill()?;
        }
        let Some(segment) = self.ready.pop_front() else {
            return Ok(None);
        };
        let len = segment.len().min(buffer.len());
        buffer[..len].copy_from_slice(&segment[..len]);
        Ok(Some(len))
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), Self::Error> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(());
        };
        stream.write_all(bytes).inspect_err(|err| {
            warn!("link: send failed: {err}");
        })
    }
}
