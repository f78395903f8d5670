use crate::internal::common::bitmap::Bitmap;
use crate::internal::common::buffer::{PackBuffer, ProtocolVersion, UnpackBuffer};
use crate::internal::common::error::{layout_error, unpack_error};
use crate::internal::common::ids::NO_VAL;
use crate::internal::common::rle::RunLengthVec;
use crate::internal::resources::jobres::{JobResources, index_nodes};
use crate::internal::resources::offset::{CoreLayout, SocketCores};

/// Upper bounds applied while reading untrusted blobs.
pub(crate) const MAX_PACKED_NODES: u32 = 1 << 20;
pub(crate) const MAX_PACKED_CORES: usize = 1 << 26;

/// Writes a resource map.
///
/// Field order: node count, memory runs (values, repetitions), socket/core runs (sockets,
/// cores, repetitions), core count, allocated and used core bit strings. `CURRENT` appends
/// total CPUs, whole-node flag, node bitmap, per-node CPU counters, the cpu array and used
/// memory. An absent map is a single `NO_VAL`.
pub fn pack_job_resources(
    resources: Option<&JobResources>,
    buffer: &mut PackBuffer,
    version: ProtocolVersion,
) -> crate::Result<()> {
    let Some(resources) = resources else {
        buffer.pack32(NO_VAL);
        return Ok(());
    };
    let core_count = resources.layout().total_cores();
    for bitmap in [&resources.core_bitmap, &resources.core_bitmap_used] {
        if bitmap.size() != core_count {
            return Err(layout_error(format!(
                "refusing to pack a core bitmap of {} bits for {core_count} cores",
                bitmap.size()
            )));
        }
    }
    if resources.memory_allocated.len() != resources.nhosts as usize {
        return Err(layout_error(format!(
            "refusing to pack {} memory entries for {} nodes",
            resources.memory_allocated.len(),
            resources.nhosts
        )));
    }

    buffer.pack32(resources.nhosts);

    let memory: RunLengthVec<u64> = resources.memory_allocated.iter().copied().collect();
    buffer.pack64_array(memory.values());
    buffer.pack32_array(memory.reps());

    let sockets: Vec<u16> = resources.sock_core.values().iter().map(|sc| sc.sockets).collect();
    let cores: Vec<u16> = resources.sock_core.values().iter().map(|sc| sc.cores).collect();
    buffer.pack16_array(&sockets);
    buffer.pack16_array(&cores);
    buffer.pack32_array(resources.sock_core.reps());

    buffer.pack32(core_count as u32);
    buffer.pack_bit_str(&resources.core_bitmap, version);
    buffer.pack_bit_str(&resources.core_bitmap_used, version);

    if version.has_usage_fields() {
        buffer.pack32(resources.ncpus);
        buffer.pack_bool(resources.whole_node);
        buffer.pack_bitmap(Some(&resources.node_bitmap), version);
        buffer.pack16_array(&resources.cpus);
        buffer.pack16_array(&resources.cpus_used);
        buffer.pack16_array(resources.cpu_array.values());
        buffer.pack32_array(resources.cpu_array.reps());
        buffer.pack64_array(&resources.memory_used);
    }
    Ok(())
}

fn check_len(what: &str, len: usize, nhosts: u32) -> crate::Result<()> {
    if len != nhosts as usize {
        return Err(unpack_error(format!(
            "{what} has {len} entries for {nhosts} nodes"
        )));
    }
    Ok(())
}

/// Reads a resource map written by [`pack_job_resources`].
///
/// Blobs without the node bitmap (`LEGACY`) produce a map with an empty node bitmap, CPU
/// counts derived from the socket/core layout and zero usage.
pub fn unpack_job_resources(
    buffer: &mut UnpackBuffer,
    version: ProtocolVersion,
) -> crate::Result<Option<JobResources>> {
    if !version.is_supported() {
        return Err(unpack_error(format!("unsupported protocol version {version}")));
    }
    let nhosts = buffer.unpack32()?;
    if nhosts == NO_VAL {
        return Ok(None);
    }
    if nhosts > MAX_PACKED_NODES {
        return Err(unpack_error(format!("node count {nhosts} is too large")));
    }

    let memory_values = buffer.unpack64_array()?;
    let memory_reps = buffer.unpack32_array()?;
    let memory = RunLengthVec::from_parts(memory_values, memory_reps)
        .map_err(|e| unpack_error(format!("memory runs: {e}")))?;
    memory
        .check_total(nhosts as u64)
        .map_err(|e| unpack_error(format!("memory runs: {e}")))?;

    let sockets = buffer.unpack16_array()?;
    let cores = buffer.unpack16_array()?;
    let reps = buffer.unpack32_array()?;
    if sockets.len() != cores.len() {
        return Err(unpack_error(format!(
            "{} socket counts and {} core counts",
            sockets.len(),
            cores.len()
        )));
    }
    let shapes = sockets
        .into_iter()
        .zip(cores)
        .map(|(sockets, cores)| SocketCores::new(sockets, cores))
        .collect();
    let sock_core = RunLengthVec::from_parts(shapes, reps)
        .map_err(|e| unpack_error(format!("socket/core runs: {e}")))?;
    sock_core
        .check_total(nhosts as u64)
        .map_err(|e| unpack_error(format!("socket/core runs: {e}")))?;

    let core_count = buffer.unpack32()? as usize;
    let expected_cores = CoreLayout::new(&sock_core).total_cores();
    if core_count != expected_cores {
        return Err(unpack_error(format!(
            "core count {core_count} does not match the layout ({expected_cores} cores)"
        )));
    }
    if core_count > MAX_PACKED_CORES {
        return Err(unpack_error(format!("core count {core_count} is too large")));
    }
    let core_bitmap = buffer.unpack_bit_str(core_count, version)?;
    let core_bitmap_used = buffer.unpack_bit_str(core_count, version)?;

    let mut resources = JobResources {
        nhosts,
        ncpus: 0,
        whole_node: false,
        node_bitmap: Bitmap::new(0),
        node_index: Vec::new(),
        cpus: sock_core
            .iter()
            .map(|item| item.value.total().min(u16::MAX as usize) as u16)
            .collect(),
        cpus_used: vec![0; nhosts as usize],
        cpu_array: RunLengthVec::new(),
        memory_allocated: memory.expand(),
        memory_used: vec![0; nhosts as usize],
        sock_core,
        core_bitmap,
        core_bitmap_used,
    };

    if version.has_usage_fields() {
        resources.ncpus = buffer.unpack32()?;
        resources.whole_node = buffer.unpack_bool()?;
        let node_bitmap = buffer
            .unpack_bitmap(version, MAX_PACKED_NODES as usize)?
            .unwrap_or_default();
        if node_bitmap.size() > 0 && node_bitmap.set_count() != nhosts as usize {
            return Err(unpack_error(format!(
                "node bitmap holds {} nodes, expected {nhosts}",
                node_bitmap.set_count()
            )));
        }
        resources.node_index = index_nodes(&node_bitmap);
        resources.node_bitmap = node_bitmap;
        resources.cpus = buffer.unpack16_array()?;
        check_len("cpus", resources.cpus.len(), nhosts)?;
        resources.cpus_used = buffer.unpack16_array()?;
        check_len("cpus_used", resources.cpus_used.len(), nhosts)?;
        let cpu_values = buffer.unpack16_array()?;
        let cpu_reps = buffer.unpack32_array()?;
        resources.cpu_array = RunLengthVec::from_parts(cpu_values, cpu_reps)
            .map_err(|e| unpack_error(format!("cpu array: {e}")))?;
        resources.memory_used = buffer.unpack64_array()?;
        check_len("memory_used", resources.memory_used.len(), nhosts)?;
        if resources.cpu_array.expand() != resources.cpus {
            return Err(unpack_error(
                "cpu array does not reproduce the per-node cpu counts".to_string(),
            ));
        }
        let total: u32 = resources.cpus.iter().map(|c| *c as u32).sum();
        if total != resources.ncpus {
            return Err(unpack_error(format!(
                "cpu total {} does not match the per-node counts ({total})",
                resources.ncpus
            )));
        }
    } else {
        resources.build_cpu_array();
    }

    resources
        .validate()
        .map_err(|e| unpack_error(e.to_string()))?;
    Ok(Some(resources))
}
