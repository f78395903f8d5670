use crate::internal::common::buffer::{PackBuffer, ProtocolVersion, UnpackBuffer};
use crate::internal::common::error::unpack_error;
use crate::internal::common::ids::{JobId, StepId};
use crate::internal::plugins::gres::GresRequest;
use crate::internal::resources::pack::{MAX_PACKED_CORES, MAX_PACKED_NODES};
use crate::internal::step::record::{StepLayout, StepRecord, StepState};
use crate::internal::step::request::{MemoryRequest, StepFlags, TaskDistribution};
use chrono::{DateTime, Utc};

fn pack_memory_request(memory: MemoryRequest, buffer: &mut PackBuffer) {
    let (kind, value) = match memory {
        MemoryRequest::None => (0, 0),
        MemoryRequest::PerNode(value) => (1, value),
        MemoryRequest::PerCpu(value) => (2, value),
    };
    buffer.pack8(kind);
    buffer.pack64(value);
}

fn unpack_memory_request(buffer: &mut UnpackBuffer) -> crate::Result<MemoryRequest> {
    let kind = buffer.unpack8()?;
    let value = buffer.unpack64()?;
    match kind {
        0 => Ok(MemoryRequest::None),
        1 => Ok(MemoryRequest::PerNode(value)),
        2 => Ok(MemoryRequest::PerCpu(value)),
        _ => Err(unpack_error(format!("invalid memory request kind {kind}"))),
    }
}

fn pack_layout(layout: Option<&StepLayout>, buffer: &mut PackBuffer) {
    let Some(layout) = layout else {
        buffer.pack8(0);
        return;
    };
    buffer.pack8(1);
    let (code, plane_size) = layout.distribution.to_code();
    buffer.pack16(code);
    buffer.pack16(plane_size);
    buffer.pack32(layout.task_count);
    buffer.pack16_array(&layout.tasks);
    buffer.pack32(layout.tids.len() as u32);
    for tids in &layout.tids {
        buffer.pack32_array(tids);
    }
    buffer.pack32(layout.node_names.len() as u32);
    for name in &layout.node_names {
        buffer.pack_str(Some(name));
    }
}

fn unpack_layout(buffer: &mut UnpackBuffer) -> crate::Result<Option<StepLayout>> {
    if !buffer.unpack_bool()? {
        return Ok(None);
    }
    let code = buffer.unpack16()?;
    let plane_size = buffer.unpack16()?;
    let distribution = TaskDistribution::from_code(code, plane_size)
        .ok_or_else(|| unpack_error(format!("invalid task distribution {code}")))?;
    let task_count = buffer.unpack32()?;
    let tasks = buffer.unpack16_array()?;
    let node_count = buffer.unpack32()?;
    if node_count > MAX_PACKED_NODES {
        return Err(unpack_error(format!("layout node count {node_count} is too large")));
    }
    let tids = (0..node_count)
        .map(|_| buffer.unpack32_array())
        .collect::<crate::Result<Vec<_>>>()?;
    let name_count = buffer.unpack32()?;
    if name_count > MAX_PACKED_NODES {
        return Err(unpack_error(format!("layout name count {name_count} is too large")));
    }
    let node_names = (0..name_count)
        .map(|_| {
            buffer
                .unpack_str()?
                .ok_or_else(|| unpack_error("missing node name".to_string()))
        })
        .collect::<crate::Result<Vec<_>>>()?;
    Ok(Some(StepLayout {
        node_names,
        tasks,
        tids,
        task_count,
        distribution,
    }))
}

/// Writes a step record.
///
/// Interconnect state is not written; it is rebuilt by the interconnect itself after a
/// restart.
pub fn pack_step(step: &StepRecord, buffer: &mut PackBuffer, version: ProtocolVersion) {
    buffer.pack32(step.id.job_id().as_num());
    buffer.pack32(step.id.step_id());
    buffer.pack32(step.id.het_component_raw());
    buffer.pack8(step.state.to_code());
    buffer.pack16(step.flags.bits());
    buffer.pack_str(Some(&step.name));
    buffer.pack32(step.cpu_count);
    buffer.pack16(step.cpus_per_task);
    buffer.pack32(step.num_tasks);
    pack_memory_request(step.memory_request, buffer);
    buffer.pack_opt32(step.time_limit);
    buffer.pack64(step.start_time.timestamp().max(0) as u64);
    buffer.pack_str(step.callback.as_deref());

    buffer.pack_bitmap(Some(&step.node_bitmap), version);
    buffer.pack_bitmap(step.core_bitmap_job.as_ref(), version);
    buffer.pack16_array(&step.cpus_alloc);
    buffer.pack64_array(&step.memory_allocated);
    buffer.pack_bitmap(step.exit_node_bitmap.as_ref(), version);
    buffer.pack_opt32(step.exit_code.map(|code| code as u32));
    pack_layout(step.layout.as_ref(), buffer);

    if version.has_usage_fields() {
        buffer.pack32(step.gres.len() as u32);
        for gres in &step.gres {
            buffer.pack_str(Some(&gres.name));
            buffer.pack64(gres.per_node);
            buffer.pack_opt16(gres.cpus_per_gres);
            buffer.pack_opt64(gres.mem_per_gres);
        }
        buffer.pack_opt32(step.last_signal.map(|signal| signal as u32));
    }
}

/// Reads a step record written by [`pack_step`].
pub fn unpack_step(
    buffer: &mut UnpackBuffer,
    version: ProtocolVersion,
) -> crate::Result<StepRecord> {
    let job_id = JobId::new(buffer.unpack32()?);
    let step_number = buffer.unpack32()?;
    let het_component = buffer.unpack32()?;
    let id = StepId::with_het_component(job_id, step_number, het_component);
    let state_code = buffer.unpack8()?;
    let state = StepState::from_code(state_code)
        .ok_or_else(|| unpack_error(format!("invalid step state {state_code}")))?;
    let flags = StepFlags::from_bits_truncate(buffer.unpack16()?);
    let name = buffer.unpack_str()?.unwrap_or_default();
    let cpu_count = buffer.unpack32()?;
    let cpus_per_task = buffer.unpack16()?;
    let num_tasks = buffer.unpack32()?;
    let memory_request = unpack_memory_request(buffer)?;
    let time_limit = buffer.unpack_opt32()?;
    let start_time = i64::try_from(buffer.unpack64()?)
        .ok()
        .and_then(|seconds| DateTime::<Utc>::from_timestamp(seconds, 0))
        .ok_or_else(|| unpack_error("invalid step start time".to_string()))?;
    let callback = buffer.unpack_str()?;

    let node_bitmap = buffer
        .unpack_bitmap(version, MAX_PACKED_NODES as usize)?
        .ok_or_else(|| unpack_error(format!("step {id} has no node bitmap")))?;
    let core_bitmap_job = buffer.unpack_bitmap(version, MAX_PACKED_CORES)?;
    let cpus_alloc = buffer.unpack16_array()?;
    let memory_allocated = buffer.unpack64_array()?;
    let exit_node_bitmap = buffer.unpack_bitmap(version, MAX_PACKED_NODES as usize)?;
    let exit_code = buffer.unpack_opt32()?.map(|code| code as i32);
    let layout = unpack_layout(buffer)?;

    let mut gres = Vec::new();
    let mut last_signal = None;
    if version.has_usage_fields() {
        let count = buffer.unpack32()?;
        if count > MAX_PACKED_NODES {
            return Err(unpack_error(format!("GRES count {count} is too large")));
        }
        for _ in 0..count {
            let name = buffer
                .unpack_str()?
                .ok_or_else(|| unpack_error("missing GRES name".to_string()))?;
            let mut request = GresRequest::new(name, buffer.unpack64()?);
            request.cpus_per_gres = buffer.unpack_opt16()?;
            request.mem_per_gres = buffer.unpack_opt64()?;
            gres.push(request);
        }
        last_signal = buffer.unpack_opt32()?.map(|signal| signal as i32);
    }

    let node_count = node_bitmap.set_count();
    if state != StepState::Pending
        && (cpus_alloc.len() != node_count || memory_allocated.len() != node_count)
    {
        return Err(unpack_error(format!(
            "step {id} has {} CPU and {} memory entries for {node_count} nodes",
            cpus_alloc.len(),
            memory_allocated.len()
        )));
    }
    if exit_node_bitmap
        .as_ref()
        .is_some_and(|exit| exit.size() != node_count)
    {
        return Err(unpack_error(format!(
            "step {id} has an exit bitmap that does not match its {node_count} nodes"
        )));
    }

    Ok(StepRecord {
        id,
        name,
        state,
        flags,
        node_bitmap,
        core_bitmap_job,
        cpus_per_task,
        cpu_count,
        num_tasks,
        memory_request,
        cpus_alloc,
        memory_allocated,
        gres,
        layout,
        exit_node_bitmap,
        exit_code,
        time_limit,
        start_time,
        last_signal,
        switch_job: None,
        callback,
    })
}
