use std::io;

use bytes::Bytes;
use cellstore_error::{CellstoreResult, cellstore_bail};

/// Index of a cooperating process. Node 0 is the coordinator, the only node doing file IO.
pub type NodeId = usize;

/// The coordinating node.
pub const COORDINATOR: NodeId = 0;

/// Point-to-point transport between the cooperating processes of one run.
///
/// Messages between a pair of nodes are delivered in order. Operations block until they
/// complete; there is no timeout, so a peer that never answers hangs the caller.
pub trait Channel {
    /// The node this end of the channel belongs to.
    fn node(&self) -> NodeId;

    /// Number of cooperating nodes.
    fn nodes(&self) -> usize;

    /// Open the stream towards `peer`. Sending on a stream that is not open fails.
    fn open(&mut self, peer: NodeId) -> CellstoreResult<()>;

    /// Close the stream towards `peer`.
    fn close(&mut self, peer: NodeId) -> CellstoreResult<()>;

    /// Send one message to `peer`.
    fn send(&mut self, peer: NodeId, message: Bytes) -> CellstoreResult<()>;

    /// Receive the next message from `peer`.
    fn recv(&mut self, peer: NodeId) -> CellstoreResult<Bytes>;

    /// Distribute structural data from `root` to every node. The root passes `Some(data)`,
    /// everyone else `None`; every node returns the root's data.
    fn broadcast(&mut self, root: NodeId, data: Option<Bytes>) -> CellstoreResult<Bytes> {
        if self.node() == root {
            let Some(data) = data else {
                cellstore_bail!(Programming: "broadcast root {} has nothing to send", root);
            };
            for peer in (0..self.nodes()).filter(|&p| p != root) {
                self.open(peer)?;
                self.send(peer, data.clone())?;
                self.close(peer)?;
            }
            Ok(data)
        } else {
            self.recv(root)
        }
    }

    /// Whether this is the coordinating node.
    fn is_coordinator(&self) -> bool {
        self.node() == COORDINATOR
    }
}

/// One end of an in-process mesh of channels, one per simulated node.
///
/// Each node runs on its own thread; messages travel over unbounded [`flume`] channels.
pub struct LocalChannel {
    node: NodeId,
    senders: Vec<flume::Sender<Bytes>>,
    receivers: Vec<flume::Receiver<Bytes>>,
    open: Vec<bool>,
}

/// Builds a fully connected set of [`LocalChannel`]s.
pub struct LocalMesh;

impl LocalMesh {
    /// Create channel ends for `nodes` nodes, indexed by [`NodeId`].
    pub fn new(nodes: usize) -> Vec<LocalChannel> {
        // links[from][to]
        let links: Vec<Vec<(flume::Sender<Bytes>, flume::Receiver<Bytes>)>> = (0..nodes)
            .map(|_| (0..nodes).map(|_| flume::unbounded()).collect())
            .collect();
        (0..nodes)
            .map(|node| LocalChannel {
                node,
                senders: (0..nodes).map(|to| links[node][to].0.clone()).collect(),
                receivers: (0..nodes).map(|from| links[from][node].1.clone()).collect(),
                open: vec![false; nodes],
            })
            .collect()
    }

    /// The channel of a run with a single node, which never has a peer to talk to.
    pub fn single() -> LocalChannel {
        let (sender, receiver) = flume::unbounded();
        LocalChannel {
            node: 0,
            senders: vec![sender],
            receivers: vec![receiver],
            open: vec![false],
        }
    }
}

impl LocalChannel {
    fn check_peer(&self, peer: NodeId) -> CellstoreResult<()> {
        if peer >= self.senders.len() || peer == self.node {
            cellstore_bail!(
                "node {} cannot address peer {} in a mesh of {}",
                self.node,
                peer,
                self.senders.len()
            );
        }
        Ok(())
    }
}

impl Channel for LocalChannel {
    fn node(&self) -> NodeId {
        self.node
    }

    fn nodes(&self) -> usize {
        self.senders.len()
    }

    fn open(&mut self, peer: NodeId) -> CellstoreResult<()> {
        self.check_peer(peer)?;
        self.open[peer] = true;
        Ok(())
    }

    fn close(&mut self, peer: NodeId) -> CellstoreResult<()> {
        self.check_peer(peer)?;
        self.open[peer] = false;
        Ok(())
    }

    fn send(&mut self, peer: NodeId, message: Bytes) -> CellstoreResult<()> {
        self.check_peer(peer)?;
        if !self.open[peer] {
            cellstore_bail!(Programming: "node {} sent to {} without opening the stream", self.node, peer);
        }
        log::trace!("node {} -> {}: {} bytes", self.node, peer, message.len());
        self.senders[peer].send(message).map_err(|_| {
            io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("node {} is no longer receiving from {}", peer, self.node),
            )
            .into()
        })
    }

    fn recv(&mut self, peer: NodeId) -> CellstoreResult<Bytes> {
        self.check_peer(peer)?;
        self.receivers[peer].recv().map_err(|_| {
            io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("node {} hung up on {}", peer, self.node),
            )
            .into()
        })
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn point_to_point_in_order() {
        let mut mesh = LocalMesh::new(2);
        let mut b = mesh.pop().unwrap();
        let mut a = mesh.pop().unwrap();
        a.open(1).unwrap();
        a.send(1, Bytes::from_static(b"one")).unwrap();
        a.send(1, Bytes::from_static(b"two")).unwrap();
        assert_eq!(b.recv(0).unwrap(), Bytes::from_static(b"one"));
        assert_eq!(b.recv(0).unwrap(), Bytes::from_static(b"two"));
    }

    #[test]
    fn single_node_broadcasts_to_itself() {
        let mut channel = LocalMesh::single();
        assert_eq!(channel.nodes(), 1);
        assert!(channel.is_coordinator());
        assert!(channel.open(0).is_err());
        let data = channel
            .broadcast(COORDINATOR, Some(Bytes::from_static(b"plan")))
            .unwrap();
        assert_eq!(data, Bytes::from_static(b"plan"));
    }

    #[test]
    fn send_requires_open_stream() {
        let mut mesh = LocalMesh::new(2);
        assert!(mesh[0].send(1, Bytes::new()).is_err());
        assert!(mesh[0].open(0).is_err());
    }

    #[test]
    fn broadcast_reaches_every_node() {
        let handles = LocalMesh::new(3)
            .into_iter()
            .map(|mut channel| {
                thread::spawn(move || {
                    let data = channel
                        .is_coordinator()
                        .then(|| Bytes::from_static(b"structure"));
                    channel.broadcast(COORDINATOR, data)
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            assert_eq!(handle.join().unwrap().unwrap(), Bytes::from_static(b"structure"));
        }
    }

    #[test]
    fn dropped_peer_is_broken_pipe() {
        let mut mesh = LocalMesh::new(2);
        let b = mesh.pop().unwrap();
        let mut a = mesh.pop().unwrap();
        drop(b);
        a.open(1).unwrap();
        assert!(a.send(1, Bytes::from_static(b"x")).is_err());
        assert!(a.recv(1).is_err());
    }
}
