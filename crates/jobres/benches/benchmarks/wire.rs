use criterion::{BenchmarkId, Criterion};

use jobres::job::{JobTable, load_state, save_state};
use jobres::step::StepRequestBuilder;
use jobres::wire::{
    PackBuffer, ProtocolVersion, UnpackBuffer, pack_job_resources, unpack_job_resources,
};

use crate::{create_job, create_manager};

fn bench_pack_resources(c: &mut Criterion) {
    for node_count in [1, 64, 1024] {
        let manager = create_manager(node_count);
        let mut jobs = JobTable::new();
        let job_id = create_job(&manager, &mut jobs, 1);
        let resources = jobs.get_job(job_id).resources().unwrap().clone();

        c.bench_with_input(
            BenchmarkId::new("pack resources", node_count),
            &resources,
            |b, resources| {
                b.iter(|| {
                    let mut buffer = PackBuffer::new();
                    pack_job_resources(Some(resources), &mut buffer, ProtocolVersion::CURRENT)
                        .unwrap();
                    buffer
                });
            },
        );

        let mut buffer = PackBuffer::new();
        pack_job_resources(Some(&resources), &mut buffer, ProtocolVersion::CURRENT).unwrap();
        let data = buffer.freeze();
        c.bench_with_input(
            BenchmarkId::new("unpack resources", node_count),
            &data,
            |b, data| {
                b.iter(|| {
                    let mut reader = UnpackBuffer::new(data);
                    unpack_job_resources(&mut reader, ProtocolVersion::CURRENT).unwrap()
                });
            },
        );
    }
}

fn bench_state(c: &mut Criterion) {
    let mut manager = create_manager(64);
    let mut jobs = JobTable::new();
    for job_id in 1..=32 {
        let job_id = create_job(&manager, &mut jobs, job_id);
        for _ in 0..8 {
            let request = StepRequestBuilder::default()
                .job_id(job_id)
                .num_tasks(16)
                .build()
                .unwrap();
            manager.create_step(&mut jobs, request).unwrap();
        }
    }
    for version in [ProtocolVersion::LEGACY, ProtocolVersion::CURRENT] {
        let data = save_state(&jobs, version).unwrap();
        c.bench_with_input(
            BenchmarkId::new("load state", version),
            &data,
            |b, data| {
                b.iter(|| load_state(data, true).unwrap());
            },
        );
    }
}

pub fn benchmark(c: &mut Criterion) {
    bench_pack_resources(c);
    bench_state(c);
}
