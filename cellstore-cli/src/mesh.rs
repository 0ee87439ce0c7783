use std::thread;

use anyhow::anyhow;
use cellstore::error::CellstoreResult;
use cellstore::io::{LocalChannel, LocalMesh, NodeId};

/// Run a job on `nodes` threads connected by a [`LocalMesh`]: the coordinator on the calling
/// thread, every worker on its own.
pub fn on_mesh<R>(
    nodes: usize,
    coordinator: impl FnOnce(&mut LocalChannel) -> CellstoreResult<R>,
    worker: impl Fn(NodeId, &mut LocalChannel) -> CellstoreResult<()> + Sync,
) -> anyhow::Result<R> {
    let mut mesh = LocalMesh::new(nodes).into_iter();
    let mut first = mesh
        .next()
        .ok_or_else(|| anyhow!("a run needs at least one node"))?;
    thread::scope(|s| {
        let worker = &worker;
        let handles: Vec<_> = mesh
            .enumerate()
            .map(|(i, mut channel)| s.spawn(move || worker(i + 1, &mut channel)))
            .collect();
        let result = coordinator(&mut first);
        for (i, handle) in handles.into_iter().enumerate() {
            handle
                .join()
                .map_err(|_| anyhow!("node {} panicked", i + 1))??;
        }
        Ok(result?)
    })
}
