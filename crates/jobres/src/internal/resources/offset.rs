use crate::internal::common::error::layout_error;
use crate::internal::common::rle::RunLengthVec;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Socket and core counts of a node; one run-length element of a resource map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SocketCores {
    pub sockets: u16,
    pub cores: u16,
}

crate::static_assert_size!(SocketCores, 4);

impl SocketCores {
    #[inline]
    pub fn new(sockets: u16, cores: u16) -> Self {
        SocketCores { sockets, cores }
    }

    /// Number of cores on the node
    #[inline]
    pub fn total(&self) -> usize {
        self.sockets as usize * self.cores as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorePosition {
    pub job_node: usize,
    pub socket: u16,
    pub core: u16,
}

/// Core bit `(node, socket, core)` of a job lives at
/// `sum(cores of nodes before) + socket * cores_per_socket + core`.
#[derive(Clone, Copy)]
pub struct CoreLayout<'a> {
    runs: &'a RunLengthVec<SocketCores>,
}

impl<'a> CoreLayout<'a> {
    pub fn new(runs: &'a RunLengthVec<SocketCores>) -> Self {
        CoreLayout { runs }
    }

    pub fn total_cores(&self) -> usize {
        self.runs
            .runs()
            .map(|(sc, reps)| sc.total() * reps as usize)
            .sum()
    }

    /// First bit of a node and its socket/core shape.
    fn node_base(&self, job_node: usize) -> Option<(usize, SocketCores)> {
        let mut bit = 0;
        let mut first_node = 0;
        for (sc, reps) in self.runs.runs() {
            let reps = reps as usize;
            if job_node < first_node + reps {
                return Some((bit + (job_node - first_node) * sc.total(), sc));
            }
            bit += sc.total() * reps;
            first_node += reps;
        }
        None
    }

    pub fn node_shape(&self, job_node: usize) -> Option<SocketCores> {
        self.node_base(job_node).map(|(_, sc)| sc)
    }

    pub fn node_range(&self, job_node: usize) -> Option<Range<usize>> {
        self.node_base(job_node)
            .map(|(base, sc)| base..base + sc.total())
    }

    pub fn offset_of(
        &self,
        job_node: usize,
        socket: u16,
        core: u16,
        bitmap_size: usize,
    ) -> crate::Result<usize> {
        let (base, sc) = self.node_base(job_node).ok_or_else(|| {
            layout_error(format!(
                "node {job_node} is outside of a layout with {} nodes",
                self.runs.total()
            ))
        })?;
        if socket >= sc.sockets {
            return Err(layout_error(format!(
                "socket {socket} is out of range on node {job_node} ({} sockets)",
                sc.sockets
            )));
        }
        if core >= sc.cores {
            return Err(layout_error(format!(
                "core {core} is out of range on node {job_node} ({} cores per socket)",
                sc.cores
            )));
        }
        let bit = base + socket as usize * sc.cores as usize + core as usize;
        if bit >= bitmap_size {
            return Err(layout_error(format!(
                "core offset {bit} is beyond the core bitmap size {bitmap_size}"
            )));
        }
        Ok(bit)
    }

    pub fn position_of(&self, bit: usize) -> Option<CorePosition> {
        let mut base = 0;
        let mut first_node = 0;
        for (sc, reps) in self.runs.runs() {
            let total = sc.total();
            let run_bits = total * reps as usize;
            if bit < base + run_bits {
                let inside = bit - base;
                let local = inside % total;
                return Some(CorePosition {
                    job_node: first_node + inside / total,
                    socket: (local / sc.cores as usize) as u16,
                    core: (local % sc.cores as usize) as u16,
                });
            }
            base += run_bits;
            first_node += reps as usize;
        }
        None
    }

    /// Iterates `(job node, core bit range, shape)` over all nodes of the layout.
    pub fn nodes(self) -> impl Iterator<Item = (usize, Range<usize>, SocketCores)> + 'a {
        let runs: &'a RunLengthVec<SocketCores> = self.runs;
        let mut bit = 0;
        runs.iter().map(move |item| {
            let start = bit;
            bit += item.value.total();
            (item.index, start..bit, item.value)
        })
    }
}
