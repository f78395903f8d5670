use crate::internal::common::buffer::{PackBuffer, ProtocolVersion, UnpackBuffer};
use crate::internal::common::error::unpack_error;
use crate::internal::common::ids::JobId;
use crate::internal::job::jobmap::JobTable;
use crate::internal::job::record::{JobRecord, JobState};
use crate::internal::resources::pack::{
    MAX_PACKED_NODES, pack_job_resources, unpack_job_resources,
};
use crate::internal::step::pack::{pack_step, unpack_step};
use bytes::Bytes;
use std::ffi::OsString;
use std::fs::{File, remove_file, rename};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const STATE_HEADER: &[u8] = b"jobres-state\0";

/// Serializes all jobs, their resource maps and their steps.
///
/// `LEGACY` resource maps do not carry node indices, so the job's node bitmap is written
/// next to them. GRES and interconnect state belong to their plugins and are not written.
pub fn save_state(jobs: &JobTable, version: ProtocolVersion) -> crate::Result<Bytes> {
    if !version.is_supported() {
        return Err(format!("cannot save state with protocol version {version}").into());
    }
    let mut buffer = PackBuffer::new();
    buffer.pack_raw(STATE_HEADER);
    buffer.pack16(version.as_num());
    buffer.pack32(jobs.len() as u32);
    for job in jobs.sorted_jobs() {
        buffer.pack32(job.job_id.as_num());
        buffer.pack8(job.state.to_code());
        buffer.pack_opt32(job.time_limit);
        buffer.pack_bool(job.gres_enforce_bind);
        buffer.pack32(job.next_step_id);
        if !version.has_usage_fields() {
            buffer.pack_bitmap(job.resources().map(|r| r.node_bitmap()), version);
        }
        pack_job_resources(job.resources(), &mut buffer, version)?;
        buffer.pack32(job.steps.len() as u32);
        for step in &job.steps {
            pack_step(step, &mut buffer, version);
        }
    }
    log::debug!(
        "Saved state of {} job(s), {} bytes, version {version}",
        jobs.len(),
        buffer.len()
    );
    Ok(buffer.freeze())
}

fn unpack_job(
    buffer: &mut UnpackBuffer,
    version: ProtocolVersion,
    track_memory: bool,
) -> crate::Result<JobRecord> {
    let job_id = JobId::new(buffer.unpack32()?);
    let state_code = buffer.unpack8()?;
    let state = JobState::from_code(state_code)
        .ok_or_else(|| unpack_error(format!("job {job_id} has invalid state {state_code}")))?;
    let time_limit = buffer.unpack_opt32()?;
    let gres_enforce_bind = buffer.unpack_bool()?;
    let next_step_id = buffer.unpack32()?;
    let legacy_nodes = if version.has_usage_fields() {
        None
    } else {
        buffer.unpack_bitmap(version, MAX_PACKED_NODES as usize)?
    };
    let mut job_resrcs = unpack_job_resources(buffer, version)?;
    if let (Some(resources), Some(node_bitmap)) = (job_resrcs.as_mut(), legacy_nodes) {
        resources
            .attach_node_bitmap(node_bitmap)
            .map_err(|e| unpack_error(format!("job {job_id}: {e}")))?;
    }

    let step_count = buffer.unpack32()?;
    if step_count > MAX_PACKED_NODES {
        return Err(unpack_error(format!("job {job_id} has {step_count} steps")));
    }
    let steps = (0..step_count)
        .map(|_| unpack_step(buffer, version))
        .collect::<crate::Result<Vec<_>>>()?;

    if let Some(resources) = &job_resrcs {
        let core_count = resources.core_bitmap().size();
        for step in &steps {
            if step.id.job_id() != job_id {
                return Err(unpack_error(format!(
                    "step {} is stored under job {job_id}",
                    step.id
                )));
            }
            if step
                .core_bitmap_job
                .as_ref()
                .is_some_and(|cores| cores.size() != core_count)
            {
                return Err(unpack_error(format!(
                    "step {} does not match the core layout of its job",
                    step.id
                )));
            }
        }
    }

    let mut job = JobRecord {
        job_id,
        state,
        time_limit,
        gres_enforce_bind,
        job_resrcs,
        steps,
        next_step_id,
    };
    if !version.has_usage_fields() {
        job.rebuild_usage(track_memory)
            .map_err(|e| unpack_error(format!("job {job_id}: {e}")))?;
    }
    Ok(job)
}

/// Restores jobs written by [`save_state`].
///
/// Usage counters of `LEGACY` state are recomputed from the running steps, memory usage
/// only when `track_memory` is set.
pub fn load_state(data: &[u8], track_memory: bool) -> crate::Result<JobTable> {
    let mut buffer = UnpackBuffer::new(data);
    let header = buffer.unpack_raw(STATE_HEADER.len())?;
    if header != STATE_HEADER {
        return Err(unpack_error("not a job state file".to_string()));
    }
    let version = ProtocolVersion::new(buffer.unpack16()?);
    if !version.is_supported() {
        return Err(unpack_error(format!("unsupported state version {version}")));
    }
    let count = buffer.unpack32()?;
    let mut jobs = JobTable::new();
    for _ in 0..count {
        let job = unpack_job(&mut buffer, version, track_memory)?;
        let job_id = job.job_id;
        if jobs.insert(job).is_some() {
            return Err(unpack_error(format!("job {job_id} is stored twice")));
        }
    }
    if buffer.remaining() > 0 {
        return Err(unpack_error(format!(
            "{} trailing bytes after the last job",
            buffer.remaining()
        )));
    }
    log::debug!("Loaded state of {count} job(s), version {version}");
    Ok(jobs)
}

/// Writes the state into a temporary file first and then moves it over `path`.
pub fn save_state_to_file(
    jobs: &JobTable,
    version: ProtocolVersion,
    path: &Path,
) -> crate::Result<()> {
    let data = save_state(jobs, version)?;
    let mut tmp_path: OsString = path.into();
    tmp_path.push(".tmp");
    let tmp_path: PathBuf = tmp_path.into();
    let written = (|| -> std::io::Result<()> {
        let mut file = BufWriter::new(File::create(&tmp_path)?);
        file.write_all(&data)?;
        file.flush()?;
        Ok(())
    })();
    if let Err(error) = written {
        let _ = remove_file(&tmp_path);
        return Err(error.into());
    }
    rename(&tmp_path, path)?;
    Ok(())
}

pub fn load_state_from_file(path: &Path, track_memory: bool) -> crate::Result<JobTable> {
    let mut data = Vec::new();
    File::open(path)?.read_to_end(&mut data)?;
    load_state(&data, track_memory)
}
