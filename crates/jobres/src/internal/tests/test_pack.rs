use crate::internal::common::bitmap::Bitmap;
use crate::internal::common::buffer::{PackBuffer, ProtocolVersion, UnpackBuffer};
use crate::internal::common::error::ErrorKind;
use crate::internal::common::ids::{JobId, NO_VAL};
use crate::internal::job::state::{
    load_state, load_state_from_file, save_state, save_state_to_file,
};
use crate::internal::resources::jobres::JobResources;
use crate::internal::resources::pack::{pack_job_resources, unpack_job_resources};
use crate::internal::step::request::MemoryRequest;
use crate::internal::tests::utils::env::{TestEnv, request};
use crate::internal::tests::utils::nodes::{mixed_nodes, uniform_nodes};

fn pack(resources: Option<&JobResources>, version: ProtocolVersion) -> Vec<u8> {
    let mut buffer = PackBuffer::new();
    pack_job_resources(resources, &mut buffer, version).unwrap();
    buffer.as_slice().to_vec()
}

fn unpack(data: &[u8], version: ProtocolVersion) -> crate::Result<Option<JobResources>> {
    let mut reader = UnpackBuffer::new(data);
    let resources = unpack_job_resources(&mut reader, version)?;
    assert_eq!(reader.remaining(), 0);
    Ok(resources)
}

/// Heterogeneous job with one running step.
fn busy_env() -> (TestEnv, JobId) {
    let mut env = TestEnv::new(mixed_nodes(&[(2, 4), (2, 4), (1, 6), (2, 2), (2, 2)]));
    let job_id = env.new_job(1, &[0, 1, 2, 4], 2000);
    env.create(
        request(1)
            .num_tasks(3)
            .cpu_count(6)
            .min_nodes(2)
            .memory(MemoryRequest::PerNode(500)),
    );
    (env, job_id)
}

#[test]
fn test_pack_absent_map() {
    let data = pack(None, ProtocolVersion::CURRENT);
    assert_eq!(data, NO_VAL.to_be_bytes());
    assert_eq!(unpack(&data, ProtocolVersion::CURRENT).unwrap(), None);
}

#[test]
fn test_pack_empty_map() {
    let resources = JobResources::default();
    for version in [ProtocolVersion::LEGACY, ProtocolVersion::CURRENT] {
        let data = pack(Some(&resources), version);
        assert_eq!(unpack(&data, version).unwrap(), Some(resources.clone()));
    }
}

#[test]
fn test_pack_single_node() {
    let mut env = TestEnv::new(uniform_nodes(1, 2, 2, 2));
    let job_id = env.new_job(1, &[0], 1000);
    env.create(request(1).num_tasks(2));
    let resources = env.resources(job_id).clone();
    assert!(resources.cpus_used()[0] > 0);

    let data = pack(Some(&resources), ProtocolVersion::CURRENT);
    assert_eq!(unpack(&data, ProtocolVersion::CURRENT).unwrap(), Some(resources));
}

#[test]
fn test_pack_heterogeneous_nodes() {
    let (env, job_id) = busy_env();
    let resources = env.resources(job_id);
    assert_eq!(resources.sock_core().run_count(), 3);

    let data = pack(Some(resources), ProtocolVersion::CURRENT);
    let restored = unpack(&data, ProtocolVersion::CURRENT).unwrap().unwrap();
    assert_eq!(&restored, resources);
    assert_eq!(restored.node_bitmap().ones().collect::<Vec<_>>(), vec![0, 1, 2, 4]);
}

#[test]
fn test_pack_legacy_layout() {
    let (env, job_id) = busy_env();
    let resources = env.resources(job_id);
    let data = pack(Some(resources), ProtocolVersion::LEGACY);
    let restored = unpack(&data, ProtocolVersion::LEGACY).unwrap().unwrap();

    assert_eq!(restored.nhosts(), 4);
    assert!(!restored.has_node_bitmap());
    assert_eq!(restored.sock_core(), resources.sock_core());
    assert_eq!(restored.core_bitmap(), resources.core_bitmap());
    assert_eq!(restored.core_bitmap_used(), resources.core_bitmap_used());
    assert_eq!(restored.memory_allocated(), resources.memory_allocated());
    assert_eq!(restored.cpus(), &[8, 8, 6, 4]);
    assert!(restored.cpus_used().iter().all(|c| *c == 0));
    assert!(restored.memory_used().iter().all(|m| *m == 0));
    restored.validate().unwrap();

    // Range lists instead of hex masks
    let core_bits = resources.core_bitmap().fmt_ranges();
    assert_eq!(core_bits, "0-25");
    assert!(data.windows(core_bits.len()).any(|w| w == core_bits.as_bytes()));
}

#[test]
fn test_unpack_truncated() {
    let (env, job_id) = busy_env();
    for version in [ProtocolVersion::LEGACY, ProtocolVersion::CURRENT] {
        let data = pack(env.job(job_id).resources(), version);
        for len in 0..data.len() {
            let mut reader = UnpackBuffer::new(&data[..len]);
            let error = unpack_job_resources(&mut reader, version).unwrap_err();
            assert_eq!(error.kind(), ErrorKind::Malformed, "prefix of {len} bytes");
        }
    }
}

fn single_node_blob(core_count: u32, core_bits: &str) -> Vec<u8> {
    let mut buffer = PackBuffer::new();
    buffer.pack32(1);
    buffer.pack64_array(&[1000]);
    buffer.pack32_array(&[1]);
    buffer.pack16_array(&[1]);
    buffer.pack16_array(&[4]);
    buffer.pack32_array(&[1]);
    buffer.pack32(core_count);
    buffer.pack_str(Some(core_bits));
    buffer.pack_str(Some("0x0"));
    buffer.pack32(4);
    buffer.pack_bool(false);
    buffer.pack_bitmap(Some(&Bitmap::from_indices(3, [2])), ProtocolVersion::CURRENT);
    buffer.pack16_array(&[4]);
    buffer.pack16_array(&[0]);
    buffer.pack16_array(&[4]);
    buffer.pack32_array(&[1]);
    buffer.pack64_array(&[0]);
    buffer.as_slice().to_vec()
}

#[test]
fn test_unpack_inconsistent_blobs() {
    let valid = unpack(&single_node_blob(4, "0xF"), ProtocolVersion::CURRENT)
        .unwrap()
        .unwrap();
    assert_eq!(valid.node_indices().len(), 1);
    assert_eq!(valid.core_bitmap().set_count(), 4);

    let wrong_count = unpack(&single_node_blob(5, "0xF"), ProtocolVersion::CURRENT).unwrap_err();
    assert_eq!(wrong_count.kind(), ErrorKind::Malformed);

    let wrong_bits = unpack(&single_node_blob(4, "0x1F"), ProtocolVersion::CURRENT).unwrap_err();
    assert_eq!(wrong_bits.kind(), ErrorKind::Malformed);

    let garbage = unpack(&single_node_blob(4, "zz"), ProtocolVersion::CURRENT).unwrap_err();
    assert_eq!(garbage.kind(), ErrorKind::Malformed);

    let unsupported =
        unpack(&single_node_blob(4, "0xF"), ProtocolVersion::new(0x1000)).unwrap_err();
    assert_eq!(unsupported.kind(), ErrorKind::Malformed);
}

#[test]
fn test_pack_rejects_broken_map() {
    let (env, job_id) = busy_env();
    let mut resources = env.resources(job_id).clone();
    resources.core_bitmap = Bitmap::new(3);
    let mut buffer = PackBuffer::new();
    let error =
        pack_job_resources(Some(&resources), &mut buffer, ProtocolVersion::CURRENT).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Internal);
}

#[test]
fn test_state_file_round_trip() {
    let (mut env, job_id) = busy_env();
    let second = env.create(request(1).num_tasks(2).cpus_per_task(2).min_nodes(2));
    env.manager
        .partial_complete(&mut env.jobs, second, 0, 0, 3)
        .unwrap();
    env.job_mut(job_id).time_limit = Some(60);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("jobs.state");
    save_state_to_file(&env.jobs, ProtocolVersion::CURRENT, &path).unwrap();
    let jobs = load_state_from_file(&path, true).unwrap();

    let original = env.job(job_id);
    let restored = jobs.get_job(job_id);
    assert_eq!(restored.time_limit, Some(60));
    assert_eq!(restored.next_step_id(), original.next_step_id());
    assert_eq!(restored.resources(), original.resources());
    assert_eq!(restored.steps().len(), original.steps().len());
    for (a, b) in restored.steps().iter().zip(original.steps()) {
        assert_eq!(a.id, b.id);
        assert_eq!(a.node_bitmap, b.node_bitmap);
        assert_eq!(a.core_bitmap_job, b.core_bitmap_job);
        assert_eq!(a.cpus_alloc, b.cpus_alloc);
        assert_eq!(a.memory_allocated, b.memory_allocated);
        assert_eq!(a.exit_node_bitmap, b.exit_node_bitmap);
        assert_eq!(a.exit_code, b.exit_code);
        assert_eq!(a.layout, b.layout);
        assert!(a.switch_job.is_none());
    }
}

#[test]
fn test_legacy_state_rebuilds_usage() {
    let (mut env, job_id) = busy_env();
    let second = env.create(request(1).num_tasks(2).cpus_per_task(2).min_nodes(2));
    env.manager
        .partial_complete(&mut env.jobs, second, 0, 0, 0)
        .unwrap();
    let data = save_state(&env.jobs, ProtocolVersion::LEGACY).unwrap();
    let jobs = load_state(&data, true).unwrap();

    let restored = jobs.get_job(job_id).resources().unwrap();
    assert_eq!(restored, env.resources(job_id));
    assert!(restored.has_node_bitmap());
}

#[test]
fn test_load_rejects_foreign_data() {
    let error = load_state(b"definitely not a state file", true).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Malformed);

    let (env, _) = busy_env();
    let mut data = save_state(&env.jobs, ProtocolVersion::CURRENT)
        .unwrap()
        .to_vec();
    data.push(0);
    let error = load_state(&data, true).unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Malformed);
}
