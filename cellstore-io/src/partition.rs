use std::ops::Range;

use crate::NodeId;

/// Contiguous block distribution of the elements of a population over the nodes of a run.
///
/// With `count = q * nodes + r`, the first `r` nodes own `q + 1` elements and the others `q`.
/// Every node computes the same ownership without talking to the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partition {
    nodes: usize,
}

impl Partition {
    /// A partition over `nodes` nodes. A partition over zero nodes behaves like a single node.
    pub fn new(nodes: usize) -> Self {
        Self {
            nodes: nodes.max(1),
        }
    }

    pub fn nodes(&self) -> usize {
        self.nodes
    }

    /// Elements owned by `node` out of a population of `count`.
    pub fn range(&self, count: u32, node: NodeId) -> Range<u32> {
        if node >= self.nodes {
            return count..count;
        }
        let nodes = self.nodes as u64;
        let node = node as u64;
        let count64 = u64::from(count);
        let (q, r) = (count64 / nodes, count64 % nodes);
        let start = node * q + node.min(r);
        let len = q + u64::from(node < r);
        // start + len <= count, so both fit in u32
        let start = u32::try_from(start).unwrap_or(count);
        let end = u32::try_from(u64::from(start) + len).unwrap_or(count);
        start..end
    }

    /// The node owning element `element` of a population of `count`.
    pub fn owner(&self, count: u32, element: u32) -> NodeId {
        let nodes = self.nodes as u64;
        let (q, r) = (u64::from(count) / nodes, u64::from(count) % nodes);
        let element = u64::from(element);
        let wide = r * (q + 1);
        let node = if element < wide {
            element / (q + 1)
        } else if q == 0 {
            nodes - 1
        } else {
            r + (element - wide) / q
        };
        usize::try_from(node).unwrap_or(self.nodes - 1).min(self.nodes - 1)
    }
}
