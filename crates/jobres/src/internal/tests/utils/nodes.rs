use crate::internal::plugins::topology::{NodeRecord, NodeTable, NodeTopology};

/// `count` identical nodes named `n0`, `n1`, ...
pub fn uniform_nodes(count: usize, sockets: u16, cores: u16, threads: u16) -> NodeTable {
    NodeTable::new(
        (0..count)
            .map(|index| {
                NodeRecord::new(
                    format!("n{index}"),
                    NodeTopology::new(sockets, cores, threads, 16_000),
                )
            })
            .collect(),
    )
}

/// Nodes with the given (sockets, cores) layouts, one thread per core.
pub fn mixed_nodes(layouts: &[(u16, u16)]) -> NodeTable {
    NodeTable::new(
        layouts
            .iter()
            .enumerate()
            .map(|(index, (sockets, cores))| {
                NodeRecord::new(
                    format!("n{index}"),
                    NodeTopology::new(*sockets, *cores, 1, 16_000),
                )
            })
            .collect(),
    )
}
