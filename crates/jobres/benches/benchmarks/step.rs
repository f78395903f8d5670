use criterion::{BatchSize, BenchmarkId, Criterion};

use jobres::job::JobTable;
use jobres::step::{MemoryRequest, StepRequestBuilder};

use crate::{create_job, create_manager};

fn bench_create_steps(c: &mut Criterion) {
    for step_count in [1, 16, 256] {
        c.bench_with_input(
            BenchmarkId::new("create steps", step_count),
            &step_count,
            |b, &step_count| {
                b.iter_batched_ref(
                    || {
                        let manager = create_manager(64);
                        let mut jobs = JobTable::new();
                        let job_id = create_job(&manager, &mut jobs, 1);
                        (manager, jobs, job_id)
                    },
                    |(manager, jobs, job_id)| {
                        for _ in 0..step_count {
                            let request = StepRequestBuilder::default()
                                .job_id(*job_id)
                                .num_tasks(8)
                                .memory(MemoryRequest::PerCpu(100))
                                .build()
                                .unwrap();
                            manager.create_step(jobs, request).unwrap();
                        }
                    },
                    BatchSize::SmallInput,
                );
            },
        );
    }
}

fn bench_create_complete(c: &mut Criterion) {
    c.bench_function("create and complete wide step", |b| {
        b.iter_batched_ref(
            || {
                let manager = create_manager(64);
                let mut jobs = JobTable::new();
                let job_id = create_job(&manager, &mut jobs, 1);
                (manager, jobs, job_id)
            },
            |(manager, jobs, job_id)| {
                let request = StepRequestBuilder::default()
                    .job_id(*job_id)
                    .num_tasks(64 * 32)
                    .min_nodes(64)
                    .build()
                    .unwrap();
                let step_id = manager.create_step(jobs, request).unwrap();
                manager.complete_step(jobs, step_id).unwrap();
            },
            BatchSize::SmallInput,
        );
    });
}

pub fn benchmark(c: &mut Criterion) {
    bench_create_steps(c);
    bench_create_complete(c);
}
