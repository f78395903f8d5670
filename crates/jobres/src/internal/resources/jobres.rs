use crate::internal::common::bitmap::Bitmap;
use crate::internal::common::error::layout_error;
use crate::internal::common::ids::NodeIndex;
use crate::internal::common::rle::RunLengthVec;
use crate::internal::plugins::topology::{NodeTopologyProvider, TopologySource};
use crate::internal::resources::offset::{CoreLayout, SocketCores};
use std::ops::Range;

/// Resources allocated to a job.
///
/// Nodes of the job are addressed by their *job node index*, i.e. the rank of the node in
/// `node_bitmap`. Cores of all nodes share one bit space (see [`CoreLayout`]); the same space
/// is used by the core bitmaps of the job's steps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobResources {
    pub(crate) nhosts: u32,
    pub(crate) ncpus: u32,
    pub(crate) whole_node: bool,
    /// Global node indices; empty (size 0) when restored from a blob that does not carry it
    pub(crate) node_bitmap: Bitmap,
    pub(crate) node_index: Vec<NodeIndex>,
    pub(crate) cpus: Vec<u16>,
    pub(crate) cpus_used: Vec<u16>,
    pub(crate) cpu_array: RunLengthVec<u16>,
    pub(crate) memory_allocated: Vec<u64>,
    pub(crate) memory_used: Vec<u64>,
    pub(crate) sock_core: RunLengthVec<SocketCores>,
    pub(crate) core_bitmap: Bitmap,
    pub(crate) core_bitmap_used: Bitmap,
}

/// Describes how the bit space of a job changed after one of its nodes was removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRemap {
    pub removed_job_node: usize,
    pub removed_node: NodeIndex,
    /// Core bits of the removed node in the old bit space
    pub removed_cores: Range<usize>,
    pub old_core_count: usize,
}

impl NodeRemap {
    /// Translates a bitmap from the old core bit space into the new one.
    pub fn remap_core_bitmap(&self, bitmap: &Bitmap) -> crate::Result<Bitmap> {
        if bitmap.size() != self.old_core_count {
            return Err(layout_error(format!(
                "cannot remap a core bitmap of size {}, expected {}",
                bitmap.size(),
                self.old_core_count
            )));
        }
        Ok(bitmap.remove_range(self.removed_cores.clone()))
    }

    /// New job node index of a node that was not removed.
    pub fn remap_job_node(&self, job_node: usize) -> Option<usize> {
        match job_node.cmp(&self.removed_job_node) {
            std::cmp::Ordering::Less => Some(job_node),
            std::cmp::Ordering::Equal => None,
            std::cmp::Ordering::Greater => Some(job_node - 1),
        }
    }
}

pub(crate) fn index_nodes(node_bitmap: &Bitmap) -> Vec<NodeIndex> {
    node_bitmap
        .ones()
        .map(|index| NodeIndex::new(index as u32))
        .collect()
}

impl JobResources {
    /// Creates an empty allocation over the nodes of `node_bitmap`.
    ///
    /// Socket and core counts are read from the provider through `source`; CPU counts,
    /// memory and core bits are left for the scheduler to fill in.
    pub fn build(
        node_bitmap: &Bitmap,
        source: TopologySource,
        provider: &dyn NodeTopologyProvider,
    ) -> crate::Result<Self> {
        if node_bitmap.is_clear() {
            return Err(layout_error(
                "cannot build resources from an empty node set".to_string(),
            ));
        }
        let mut sock_core = RunLengthVec::new();
        let node_index = index_nodes(node_bitmap);
        for node in &node_index {
            let topology = provider.topology(*node, source).ok_or_else(|| {
                layout_error(format!("node {node} is missing from the node table"))
            })?;
            sock_core.push(SocketCores::new(topology.sockets, topology.cores));
        }
        let nhosts = node_index.len();
        let core_count = CoreLayout::new(&sock_core).total_cores();
        let mut resources = JobResources {
            nhosts: nhosts as u32,
            ncpus: 0,
            whole_node: false,
            node_bitmap: node_bitmap.clone(),
            node_index,
            cpus: vec![0; nhosts],
            cpus_used: vec![0; nhosts],
            cpu_array: RunLengthVec::new(),
            memory_allocated: vec![0; nhosts],
            memory_used: vec![0; nhosts],
            sock_core,
            core_bitmap: Bitmap::new(core_count),
            core_bitmap_used: Bitmap::new(core_count),
        };
        resources.build_cpu_array();
        log::debug!(
            "Built resources for {nhosts} nodes with {core_count} cores ({} topology)",
            match source {
                TopologySource::Configured => "configured",
                TopologySource::Live => "live",
            }
        );
        Ok(resources)
    }

    #[inline]
    pub fn nhosts(&self) -> u32 {
        self.nhosts
    }

    #[inline]
    pub fn ncpus(&self) -> u32 {
        self.ncpus
    }

    #[inline]
    pub fn whole_node(&self) -> bool {
        self.whole_node
    }

    pub fn set_whole_node(&mut self, whole_node: bool) {
        self.whole_node = whole_node;
    }

    #[inline]
    pub fn node_bitmap(&self) -> &Bitmap {
        &self.node_bitmap
    }

    #[inline]
    pub fn cpus(&self) -> &[u16] {
        &self.cpus
    }

    #[inline]
    pub fn cpus_used(&self) -> &[u16] {
        &self.cpus_used
    }

    #[inline]
    pub fn memory_allocated(&self) -> &[u64] {
        &self.memory_allocated
    }

    #[inline]
    pub fn memory_used(&self) -> &[u64] {
        &self.memory_used
    }

    #[inline]
    pub fn core_bitmap(&self) -> &Bitmap {
        &self.core_bitmap
    }

    #[inline]
    pub fn core_bitmap_used(&self) -> &Bitmap {
        &self.core_bitmap_used
    }

    #[inline]
    pub fn sock_core(&self) -> &RunLengthVec<SocketCores> {
        &self.sock_core
    }

    #[inline]
    pub fn cpu_array(&self) -> &RunLengthVec<u16> {
        &self.cpu_array
    }

    #[inline]
    pub fn layout(&self) -> CoreLayout<'_> {
        CoreLayout::new(&self.sock_core)
    }

    /// False for maps restored from a blob without node indices, see
    /// [`JobResources::attach_node_bitmap`].
    #[inline]
    pub fn has_node_bitmap(&self) -> bool {
        self.node_bitmap.size() > 0
    }

    pub fn node_indices(&self) -> &[NodeIndex] {
        &self.node_index
    }

    pub fn node_index(&self, job_node: usize) -> Option<NodeIndex> {
        self.node_index.get(job_node).copied()
    }

    pub fn job_node_index(&self, node: NodeIndex) -> Option<usize> {
        self.node_index.binary_search(&node).ok()
    }

    pub fn node_shape(&self, job_node: usize) -> Option<SocketCores> {
        self.sock_core.get(job_node)
    }

    pub fn node_core_range(&self, job_node: usize) -> Option<Range<usize>> {
        self.layout().node_range(job_node)
    }

    fn core_range_or_err(&self, job_node: usize) -> crate::Result<Range<usize>> {
        self.node_core_range(job_node).ok_or_else(|| {
            layout_error(format!(
                "job node {job_node} is out of range ({} nodes)",
                self.nhosts
            ))
        })
    }

    pub fn offset_of(&self, job_node: usize, socket: u16, core: u16) -> crate::Result<usize> {
        self.layout()
            .offset_of(job_node, socket, core, self.core_bitmap.size())
    }

    pub fn get_bit(&self, job_node: usize, socket: u16, core: u16) -> crate::Result<bool> {
        let bit = self.offset_of(job_node, socket, core)?;
        Ok(self.core_bitmap.test(bit))
    }

    pub fn set_bit(&mut self, job_node: usize, socket: u16, core: u16) -> crate::Result<()> {
        let bit = self.offset_of(job_node, socket, core)?;
        self.core_bitmap.set(bit);
        Ok(())
    }

    pub fn clear_bit(&mut self, job_node: usize, socket: u16, core: u16) -> crate::Result<()> {
        let bit = self.offset_of(job_node, socket, core)?;
        self.core_bitmap.clear(bit);
        Ok(())
    }

    /// Returns true if any core of the node is allocated to the job.
    pub fn node_used(&self, job_node: usize) -> bool {
        self.node_core_range(job_node)
            .is_some_and(|range| self.core_bitmap.any_in_range(range))
    }

    /// Returns true if any step holds CPUs or cores of the node.
    pub fn node_in_use(&self, job_node: usize) -> bool {
        self.cpus_used.get(job_node).is_some_and(|c| *c > 0)
            || self
                .node_core_range(job_node)
                .is_some_and(|range| self.core_bitmap_used.any_in_range(range))
    }

    /// Number of cores of the node allocated to the job.
    pub fn count_node_cores(&self, job_node: usize) -> usize {
        self.node_core_range(job_node)
            .map(|range| self.core_bitmap.count_range(range))
            .unwrap_or(0)
    }

    /// Allocates every core of a node together with `cpus` CPUs and `memory` MB.
    pub fn allocate_node(&mut self, job_node: usize, cpus: u16, memory: u64) -> crate::Result<()> {
        let range = self.core_range_or_err(job_node)?;
        self.core_bitmap.set_range(range);
        self.cpus[job_node] = cpus;
        self.memory_allocated[job_node] = memory;
        self.build_cpu_array();
        Ok(())
    }

    /// Allocates a single core and the CPUs (hardware threads) that belong to it.
    pub fn allocate_core(
        &mut self,
        job_node: usize,
        socket: u16,
        core: u16,
        cpus_per_core: u16,
    ) -> crate::Result<()> {
        let bit = self.offset_of(job_node, socket, core)?;
        if !self.core_bitmap.test(bit) {
            self.core_bitmap.set(bit);
            self.cpus[job_node] = self.cpus[job_node].saturating_add(cpus_per_core);
            self.build_cpu_array();
        }
        Ok(())
    }

    pub fn set_node_memory(&mut self, job_node: usize, memory: u64) -> crate::Result<()> {
        let slot = self.memory_allocated.get_mut(job_node).ok_or_else(|| {
            layout_error(format!("job node {job_node} is out of range"))
        })?;
        *slot = memory;
        Ok(())
    }

    /// Recomputes the cpu array and the total CPU count from `cpus`.
    pub fn build_cpu_array(&mut self) -> u32 {
        self.cpu_array = self.cpus.iter().copied().collect();
        self.ncpus = self.cpus.iter().map(|c| *c as u32).sum();
        self.ncpus
    }

    /// Restores `cpus` from the cpu array.
    pub fn cpus_from_cpu_array(&mut self) -> crate::Result<()> {
        let cpus = self.cpu_array.expand();
        if cpus.len() != self.nhosts as usize {
            return Err(layout_error(format!(
                "cpu array expands to {} nodes, the job has {}",
                cpus.len(),
                self.nhosts
            )));
        }
        self.cpus = cpus;
        Ok(())
    }

    /// Checks all structural invariants of the map.
    pub fn validate(&self) -> crate::Result<()> {
        let nhosts = self.nhosts as usize;
        self.sock_core
            .check_total(nhosts as u64)
            .map_err(|e| layout_error(format!("socket/core runs: {e}")))?;
        for (name, len) in [
            ("cpus", self.cpus.len()),
            ("cpus_used", self.cpus_used.len()),
            ("memory_allocated", self.memory_allocated.len()),
            ("memory_used", self.memory_used.len()),
        ] {
            if len != nhosts {
                return Err(layout_error(format!(
                    "{name} has {len} entries for {nhosts} nodes"
                )));
            }
        }
        if self.cpu_array.expand() != self.cpus {
            return Err(layout_error(
                "cpu array does not reproduce the per-node cpu counts".to_string(),
            ));
        }
        let core_count = self.layout().total_cores();
        for (name, bitmap) in [
            ("core bitmap", &self.core_bitmap),
            ("used core bitmap", &self.core_bitmap_used),
        ] {
            if bitmap.size() != core_count {
                return Err(layout_error(format!(
                    "{name} has {} bits, the layout has {core_count} cores",
                    bitmap.size()
                )));
            }
        }
        if self.has_node_bitmap()
            && (self.node_bitmap.set_count() != nhosts || self.node_index.len() != nhosts)
        {
            return Err(layout_error(format!(
                "node bitmap holds {} nodes, expected {nhosts}",
                self.node_bitmap.set_count()
            )));
        }
        if let Some(job_node) =
            (0..nhosts).find(|j| self.memory_used[*j] > self.memory_allocated[*j])
        {
            return Err(layout_error(format!(
                "job node {job_node} uses {} MB of {} MB allocated",
                self.memory_used[job_node], self.memory_allocated[job_node]
            )));
        }
        Ok(())
    }

    /// Deep copy.
    ///
    /// The socket/core runs are re-derived from their repetition counts; the copy fails
    /// unless the counts add up to exactly the number of nodes.
    pub fn copy(&self) -> crate::Result<Self> {
        let mut sock_core = RunLengthVec::new();
        let mut nodes = 0u64;
        for (sc, reps) in self.sock_core.runs() {
            if nodes >= self.nhosts as u64 {
                break;
            }
            sock_core.push_run(sc, reps);
            nodes += reps as u64;
        }
        if nodes != self.nhosts as u64 {
            return Err(layout_error(format!(
                "socket/core repetitions cover {nodes} nodes, the job has {}",
                self.nhosts
            )));
        }
        let mut copy = self.clone();
        copy.sock_core = sock_core;
        Ok(copy)
    }

    /// Attaches global node indices to a map restored without them.
    pub fn attach_node_bitmap(&mut self, node_bitmap: Bitmap) -> crate::Result<()> {
        if node_bitmap.set_count() != self.nhosts as usize {
            return Err(layout_error(format!(
                "node bitmap holds {} nodes, the allocation has {}",
                node_bitmap.set_count(),
                self.nhosts
            )));
        }
        self.node_index = index_nodes(&node_bitmap);
        self.node_bitmap = node_bitmap;
        Ok(())
    }

    /// Checks that the socket/core layout still matches the node table.
    pub fn validate_against(
        &self,
        provider: &dyn NodeTopologyProvider,
        source: TopologySource,
    ) -> crate::Result<()> {
        if !self.has_node_bitmap() {
            return Err(layout_error(
                "node bitmap is not attached, cannot compare topology".to_string(),
            ));
        }
        for (job_node, (node, sc)) in self
            .node_index
            .iter()
            .zip(self.sock_core.iter().map(|item| item.value))
            .enumerate()
        {
            let name = provider.node_name(*node).unwrap_or("?");
            let topology = provider.topology(*node, source).ok_or_else(|| {
                layout_error(format!("node {name} is missing from the node table"))
            })?;
            if topology.sockets != sc.sockets || topology.cores != sc.cores {
                return Err(layout_error(format!(
                    "topology of node {name} (job node {job_node}) changed: \
                     {}x{} allocated, {}x{} now",
                    sc.sockets, sc.cores, topology.sockets, topology.cores
                )));
            }
        }
        Ok(())
    }

    /// Removes a node from the allocation.
    pub fn remove_node(&mut self, job_node: usize) -> crate::Result<NodeRemap> {
        let range = self.core_range_or_err(job_node)?;
        let node = self.node_index(job_node).ok_or_else(|| {
            layout_error("cannot remove a node from a map without node indices".to_string())
        })?;
        let old_core_count = self.core_bitmap.size();

        let mut shapes = self.sock_core.expand();
        shapes.remove(job_node);
        self.sock_core = shapes.into_iter().collect();
        self.cpus.remove(job_node);
        self.cpus_used.remove(job_node);
        self.memory_allocated.remove(job_node);
        self.memory_used.remove(job_node);
        self.core_bitmap = self.core_bitmap.remove_range(range.clone());
        self.core_bitmap_used = self.core_bitmap_used.remove_range(range.clone());
        self.node_bitmap.clear(node.as_num() as usize);
        self.node_index.remove(job_node);
        self.nhosts -= 1;
        self.build_cpu_array();

        log::debug!("Removed node {node} (job node {job_node}) from allocation");
        Ok(NodeRemap {
            removed_job_node: job_node,
            removed_node: node,
            removed_cores: range,
            old_core_count,
        })
    }

    /// Dumps the map at debug level.
    pub fn log_job_resources(&self, label: &str) {
        if !log::log_enabled!(log::Level::Debug) {
            return;
        }
        log::debug!(
            "{label}: nhosts={} ncpus={} whole_node={} nodes={}",
            self.nhosts,
            self.ncpus,
            self.whole_node,
            self.node_bitmap
        );
        for (job_node, range, sc) in self.layout().nodes() {
            let node = self
                .node_index(job_node)
                .map(|n| n.to_string())
                .unwrap_or_else(|| "?".to_string());
            let cores: String = range
                .clone()
                .map(|bit| match (self.core_bitmap.test(bit), self.core_bitmap_used.test(bit)) {
                    (true, true) => 'U',
                    (true, false) => 'A',
                    (false, true) => '!',
                    (false, false) => '.',
                })
                .collect();
            log::debug!(
                "  [{job_node}] node={node} sockets={} cores={} cpus={}/{} memory={}/{} [{cores}]",
                sc.sockets,
                sc.cores,
                self.cpus_used.get(job_node).copied().unwrap_or(0),
                self.cpus.get(job_node).copied().unwrap_or(0),
                self.memory_used.get(job_node).copied().unwrap_or(0),
                self.memory_allocated.get(job_node).copied().unwrap_or(0),
            );
        }
    }
}
