use std::io;

use bytes::{Buf, Bytes, BytesMut};
use cellstore_error::{CellstoreResult, cellstore_bail};

use crate::{ByteSink, ByteSource, Channel, NodeId};

/// Default size of the chunks exchanged between the coordinator and workers.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Buffers outgoing payload per peer and sends it in fixed-size chunks.
///
/// Chunk boundaries carry no meaning: both ends execute the same transfer plan and know how
/// many bytes to expect. [`Outbox::finish`] must be called to send the final partial chunks.
pub struct Outbox<'a, C: Channel> {
    channel: &'a mut C,
    chunk_size: usize,
    pending: Vec<BytesMut>,
}

impl<'a, C: Channel> Outbox<'a, C> {
    pub fn new(channel: &'a mut C, chunk_size: usize) -> CellstoreResult<Self> {
        if chunk_size == 0 {
            cellstore_bail!("chunk size must be positive");
        }
        let nodes = channel.nodes();
        let me = channel.node();
        for peer in (0..nodes).filter(|&p| p != me) {
            channel.open(peer)?;
        }
        Ok(Self {
            channel,
            chunk_size,
            pending: (0..nodes).map(|_| BytesMut::new()).collect(),
        })
    }

    /// Queue `data` for `peer`, sending every chunk that fills up.
    pub fn write(&mut self, peer: NodeId, mut data: &[u8]) -> CellstoreResult<()> {
        let chunk_size = self.chunk_size;
        let Some(buffer) = self.pending.get_mut(peer) else {
            cellstore_bail!("no outbox for node {}", peer);
        };
        while !data.is_empty() {
            let take = (chunk_size - buffer.len()).min(data.len());
            buffer.extend_from_slice(&data[..take]);
            data = &data[take..];
            if buffer.len() == chunk_size {
                let chunk = buffer.split().freeze();
                self.channel.send(peer, chunk)?;
            }
        }
        Ok(())
    }

    /// A [`ByteSink`] writing to `peer` through this outbox.
    pub fn sink(&mut self, peer: NodeId) -> PeerSink<'_, 'a, C> {
        PeerSink { outbox: self, peer }
    }

    /// Send every partial chunk and close the streams.
    pub fn finish(mut self) -> CellstoreResult<()> {
        for peer in 0..self.pending.len() {
            if peer == self.channel.node() {
                continue;
            }
            if !self.pending[peer].is_empty() {
                let chunk = self.pending[peer].split().freeze();
                self.channel.send(peer, chunk)?;
            }
            self.channel.close(peer)?;
        }
        Ok(())
    }
}

/// A [`ByteSink`] for a single peer of an [`Outbox`].
pub struct PeerSink<'o, 'a, C: Channel> {
    outbox: &'o mut Outbox<'a, C>,
    peer: NodeId,
}

impl<C: Channel> ByteSink for PeerSink<'_, '_, C> {
    fn write_all_from(&mut self, buf: &[u8]) -> CellstoreResult<()> {
        self.outbox.write(self.peer, buf)
    }
}

/// Reassembles the chunks sent by the [`Outbox`]es of the peers.
///
/// Each peer's stream is read through [`Inbox::source`]; streams are independent, so reads
/// from several peers may interleave freely.
pub struct Inbox<'a, C: Channel> {
    channel: &'a mut C,
    current: Vec<Bytes>,
}

impl<'a, C: Channel> Inbox<'a, C> {
    pub fn new(channel: &'a mut C) -> Self {
        let nodes = channel.nodes();
        Self {
            channel,
            current: vec![Bytes::new(); nodes],
        }
    }

    /// A [`ByteSource`] over the stream sent by `peer`.
    pub fn source(&mut self, peer: NodeId) -> PeerSource<'_, 'a, C> {
        PeerSource { inbox: self, peer }
    }

    fn read(&mut self, peer: NodeId, mut buf: &mut [u8]) -> CellstoreResult<()> {
        if peer >= self.current.len() {
            cellstore_bail!("no inbox for node {}", peer);
        }
        while !buf.is_empty() {
            if !self.current[peer].has_remaining() {
                let chunk = self.channel.recv(peer)?;
                if chunk.is_empty() {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("empty chunk from node {}", peer),
                    )
                    .into());
                }
                self.current[peer] = chunk;
            }
            let current = &mut self.current[peer];
            let take = current.remaining().min(buf.len());
            current.copy_to_slice(&mut buf[..take]);
            buf = &mut buf[take..];
        }
        Ok(())
    }

    /// Check that every received byte was consumed.
    pub fn finish(self) -> CellstoreResult<()> {
        for (peer, current) in self.current.iter().enumerate() {
            if current.has_remaining() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "{} unexpected bytes left over from node {}",
                        current.remaining(),
                        peer
                    ),
                )
                .into());
            }
        }
        Ok(())
    }
}

/// A [`ByteSource`] for a single peer of an [`Inbox`].
pub struct PeerSource<'i, 'a, C: Channel> {
    inbox: &'i mut Inbox<'a, C>,
    peer: NodeId,
}

impl<C: Channel> ByteSource for PeerSource<'_, '_, C> {
    fn read_exact_into(&mut self, buf: &mut [u8]) -> CellstoreResult<()> {
        self.inbox.read(self.peer, buf)
    }
}
