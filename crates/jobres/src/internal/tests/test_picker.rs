use crate::internal::common::bitmap::Bitmap;
use crate::internal::common::ids::{JobId, NodeIndex, StepId};
use crate::internal::plugins::gres::{GresRequest, GresTable};
use crate::internal::step::error::StepError;
use crate::internal::step::record::StepRecord;
use crate::internal::step::request::{MemoryRequest, StepFlags, TaskDistribution};
use crate::internal::tests::utils::env::{TestEnv, request};
use crate::internal::tests::utils::expect_step_error;
use crate::internal::tests::utils::nodes::uniform_nodes;

fn step(env: &TestEnv, step_id: StepId) -> &StepRecord {
    env.job(step_id.job_id()).find_step(step_id).unwrap()
}

fn step_nodes(env: &TestEnv, step_id: StepId) -> Vec<u32> {
    step(env, step_id).nodes().map(|n| n.as_num()).collect()
}

fn step_cores(env: &TestEnv, step_id: StepId) -> Vec<usize> {
    step(env, step_id)
        .core_bitmap_job
        .as_ref()
        .unwrap()
        .ones()
        .collect()
}

#[test]
fn test_pick_fills_first_node() {
    let mut env = TestEnv::new(uniform_nodes(2, 1, 4, 1));
    env.new_job(1, &[0, 1], 1000);
    let s = env.create(request(1).num_tasks(4));

    assert_eq!(step_nodes(&env, s), vec![0]);
    let record = step(&env, s);
    assert_eq!(record.cpus_alloc, vec![4]);
    assert_eq!(record.cpu_count, 4);
    let layout = record.layout.as_ref().unwrap();
    assert_eq!(layout.node_names, vec!["n0".to_string()]);
    assert_eq!(layout.tasks, vec![4]);
    assert_eq!(layout.tids, vec![vec![0, 1, 2, 3]]);
    assert_eq!(step_cores(&env, s), vec![0, 1, 2, 3]);
}

#[test]
fn test_pick_prefers_idle_nodes() {
    let mut env = TestEnv::new(uniform_nodes(3, 1, 4, 1));
    let job_id = env.new_job(1, &[0, 1, 2], 1000);
    let s1 = env.create(request(1));
    let s2 = env.create(request(1));
    let s3 = env.create(request(1));
    assert_eq!(step_nodes(&env, s1), vec![0]);
    assert_eq!(step_nodes(&env, s2), vec![1]);
    assert_eq!(step_nodes(&env, s3), vec![2]);
    assert_eq!(env.cpus_used(job_id), vec![1, 1, 1]);
    env.check_consistency(job_id);
}

#[test]
fn test_pick_spreads_over_min_nodes() {
    let mut env = TestEnv::new(uniform_nodes(3, 1, 4, 1));
    env.new_job(1, &[0, 1, 2], 1000);
    let s = env.create(request(1).num_tasks(5).min_nodes(2));
    assert_eq!(step_nodes(&env, s), vec![0, 1]);
    assert_eq!(step(&env, s).cpus_alloc, vec![4, 1]);
    assert_eq!(step(&env, s).layout.as_ref().unwrap().tasks, vec![4, 1]);
}

#[test]
fn test_pick_request_never_fits() {
    let mut env = TestEnv::new(uniform_nodes(10, 1, 4, 1));
    let job_id = env.new_job(1, &(0..10).collect::<Vec<_>>(), 1000);
    let result = env.try_create(request(1).num_tasks(41).callback("client"));
    expect_step_error(result, StepError::TooManyCpus);
    assert_eq!(env.job(job_id).pending_count(), 0);

    expect_step_error(
        env.try_create(request(1).num_tasks(11).min_nodes(11).max_nodes(11)),
        StepError::NodeConfigUnavailable,
    );
    expect_step_error(
        env.try_create(request(1).num_tasks(4).min_nodes(3).max_nodes(2)),
        StepError::InvalidNodeCount,
    );
    expect_step_error(
        env.try_create(request(1).num_tasks(2).cpu_count(5)),
        StepError::BadCpusPerTask {
            cpu_count: 5,
            num_tasks: 2,
        },
    );
    expect_step_error(
        env.try_create(request(1).num_tasks(0)),
        StepError::BadTaskCount,
    );
    env.check_idle(job_id);
}

#[test]
fn test_pick_node_list() {
    let mut env = TestEnv::new(uniform_nodes(4, 1, 2, 1));
    env.new_job(1, &[0, 1, 2], 1000);
    let s = env.create(request(1).node_list(vec!["n2".to_string()]));
    assert_eq!(step_nodes(&env, s), vec![2]);

    expect_step_error(
        env.try_create(request(1).node_list(vec!["n3".to_string()])),
        StepError::NodeNotInJob("n3".to_string()),
    );
    expect_step_error(
        env.try_create(request(1).node_list(vec!["nowhere".to_string()])),
        StepError::InvalidNodeName("nowhere".to_string()),
    );
    expect_step_error(
        env.try_create(request(1).exclude(vec!["nowhere".to_string()])),
        StepError::InvalidNodeName("nowhere".to_string()),
    );

    let s = env.create(request(1).exclude(vec!["n0".to_string(), "n1".to_string()]));
    assert_eq!(step_nodes(&env, s), vec![2]);
}

#[test]
fn test_pick_exclusive() {
    let mut env = TestEnv::new(uniform_nodes(2, 1, 4, 1));
    let job_id = env.new_job(1, &[0, 1], 1000);
    let shared = env.create(request(1));
    let exclusive = env.create(request(1).num_tasks(4).flags(StepFlags::EXCLUSIVE));
    assert_eq!(step_nodes(&env, shared), vec![0]);
    assert_eq!(step_nodes(&env, exclusive), vec![1]);

    let result = env.try_create(request(1).flags(StepFlags::EXCLUSIVE));
    expect_step_error(result, StepError::NodesBusy);

    env.complete(shared);
    let s = env.create(request(1).num_tasks(2).flags(StepFlags::EXCLUSIVE));
    assert_eq!(step_nodes(&env, s), vec![0]);
    env.check_consistency(job_id);
}

#[test]
fn test_pick_memory_limits() {
    let mut env = TestEnv::new(uniform_nodes(1, 1, 4, 1));
    let job_id = env.new_job(1, &[0], 1000);
    env.create(request(1).memory(MemoryRequest::PerNode(600)));
    assert_eq!(env.resources(job_id).memory_used(), &[600]);

    let result = env.try_create(request(1).memory(MemoryRequest::PerNode(600)));
    expect_step_error(result, StepError::MemoryBusy);
    let result = env.try_create(request(1).memory(MemoryRequest::PerNode(2000)));
    expect_step_error(result, StepError::InvalidTaskMemory);
    let result = env.try_create(request(1).num_tasks(4).memory(MemoryRequest::PerCpu(300)));
    expect_step_error(result, StepError::InvalidTaskMemory);

    let s = env.create(
        request(1)
            .memory(MemoryRequest::PerNode(600))
            .flags(StepFlags::MEM_ZERO),
    );
    assert_eq!(step(&env, s).memory_allocated, vec![0]);
    assert_eq!(env.resources(job_id).memory_used(), &[600]);

    let s = env.create(request(1).memory(MemoryRequest::PerCpu(200)));
    assert_eq!(step(&env, s).memory_allocated, vec![200]);
    assert_eq!(env.resources(job_id).memory_used(), &[800]);
    env.check_consistency(job_id);
}

#[test]
fn test_pick_gres() {
    let job_id = JobId::new(1);
    let mut gres = GresTable::new();
    gres.add_job_gres(job_id, "gpu", vec![2, 0], None);
    let mut env = TestEnv::new(uniform_nodes(2, 1, 4, 1)).gres(gres);
    env.new_job(1, &[0, 1], 1000);

    let gpu = |count| vec![GresRequest::new("gpu", count)];
    let s1 = env.create(request(1).gres(gpu(1)));
    let s2 = env.create(request(1).gres(gpu(1)));
    assert_eq!(step_nodes(&env, s1), vec![0]);
    assert_eq!(step_nodes(&env, s2), vec![0]);
    assert_eq!(env.manager.gres().in_use(job_id), 2);

    expect_step_error(env.try_create(request(1).gres(gpu(1))), StepError::GresBusy);
    expect_step_error(
        env.try_create(request(1).gres(gpu(3))),
        StepError::InvalidGres("gpu:3".to_string()),
    );
    expect_step_error(
        env.try_create(request(1).gres(vec![GresRequest::new("fpga", 1)])),
        StepError::InvalidGres("fpga".to_string()),
    );

    env.complete(s1);
    assert_eq!(env.manager.gres().in_use(job_id), 1);
    env.create(request(1).gres(gpu(1)));
    assert_eq!(env.manager.gres().in_use(job_id), 2);
}

#[test]
fn test_pick_gres_core_binding() {
    let job_id = JobId::new(1);
    let mut gres = GresTable::new();
    gres.add_job_gres(
        job_id,
        "gpu",
        vec![2],
        Some(vec![Bitmap::from_indices(4, [2, 3])]),
    );
    let mut env = TestEnv::new(uniform_nodes(1, 1, 4, 1)).gres(gres);
    env.new_job(1, &[0], 1000);
    env.job_mut(job_id).gres_enforce_bind = true;

    let gpu = vec![GresRequest::new("gpu", 1)];
    let bound = env.create(request(1).num_tasks(2).gres(gpu.clone()));
    assert_eq!(step_cores(&env, bound), vec![2, 3]);

    // Bound cores are taken, strict binding has nowhere else to go
    expect_step_error(
        env.try_create(request(1).gres(gpu.clone())),
        StepError::GresBusy,
    );
    env.job_mut(job_id).gres_enforce_bind = false;
    let loose = env.create(request(1).gres(gpu));
    assert_eq!(step_cores(&env, loose), vec![0]);
    env.check_consistency(job_id);
}

#[test]
fn test_pick_relative() {
    let mut env = TestEnv::new(uniform_nodes(4, 1, 2, 1));
    env.new_job(1, &[0, 1, 2, 3], 1000);
    let s = env.create(request(1).relative(2).num_tasks(3));
    assert_eq!(step_nodes(&env, s), vec![2, 3]);
    expect_step_error(
        env.try_create(request(1).relative(4)),
        StepError::InvalidRelative(4),
    );
}

#[test]
fn test_pick_skips_down_nodes_and_features() {
    let mut nodes = uniform_nodes(3, 1, 2, 1);
    nodes.set_down(NodeIndex::new(0), true);
    nodes
        .get_node_mut(NodeIndex::new(1))
        .unwrap()
        .features
        .push("fast".to_string());
    let mut env = TestEnv::new(nodes);
    env.new_job(1, &[0, 1, 2], 1000);

    let s = env.create(request(1));
    assert_eq!(step_nodes(&env, s), vec![1]);
    env.complete(s);

    let s = env.create(request(1).num_tasks(2).features(vec!["fast".to_string()]));
    assert_eq!(step_nodes(&env, s), vec![1]);
    env.complete(s);

    expect_step_error(
        env.try_create(
            request(1)
                .num_tasks(2)
                .min_nodes(2)
                .features(vec!["fast".to_string()]),
        ),
        StepError::NodeConfigUnavailable,
    );
    expect_step_error(
        env.try_create(request(1).node_list(vec!["n0".to_string()])),
        StepError::NodeConfigUnavailable,
    );
}

#[test]
fn test_pick_threads_per_core() {
    let mut env = TestEnv::new(uniform_nodes(1, 1, 2, 2));
    let job_id = env.new_job(1, &[0], 1000);
    let single = env.create(request(1));
    assert_eq!(step(&env, single).cpus_alloc, vec![1]);
    assert_eq!(step_cores(&env, single), vec![0]);
    env.complete(single);

    let spread = env.create(request(1).num_tasks(2).threads_per_core(1));
    assert_eq!(step_cores(&env, spread), vec![0, 1]);
    env.complete(spread);

    expect_step_error(
        env.try_create(request(1).threads_per_core(4)),
        StepError::BadThreadPerCore,
    );
    env.check_idle(job_id);
}

#[test]
fn test_pick_core_distribution() {
    let mut env = TestEnv::new(uniform_nodes(1, 2, 2, 1));
    env.new_job(1, &[0], 1000);
    let cyclic = env.create(
        request(1)
            .num_tasks(2)
            .distribution(TaskDistribution::Cyclic),
    );
    assert_eq!(step_cores(&env, cyclic), vec![0, 2]);
    let block = env.create(request(1).num_tasks(2));
    assert_eq!(step_cores(&env, block), vec![1, 3]);
}

#[test]
fn test_pick_arbitrary_distribution() {
    let mut env = TestEnv::new(uniform_nodes(3, 1, 4, 1));
    env.new_job(1, &[0, 1, 2], 1000);
    let node_list = vec!["n2".to_string(), "n0".to_string(), "n2".to_string()];
    let s = env.create(
        request(1)
            .num_tasks(3)
            .node_list(node_list)
            .distribution(TaskDistribution::Arbitrary),
    );
    assert_eq!(step_nodes(&env, s), vec![0, 2]);
    let layout = step(&env, s).layout.as_ref().unwrap();
    assert_eq!(layout.tasks, vec![1, 2]);
    assert_eq!(layout.tids, vec![vec![1], vec![0, 2]]);
    assert_eq!(step(&env, s).cpus_alloc, vec![1, 2]);

    expect_step_error(
        env.try_create(
            request(1)
                .num_tasks(2)
                .node_list(vec!["n1".to_string()])
                .distribution(TaskDistribution::Arbitrary),
        ),
        StepError::BadDistribution,
    );
}

#[test]
fn test_pick_whole_and_overcommit() {
    let mut env = TestEnv::new(uniform_nodes(1, 1, 4, 1));
    let job_id = env.new_job(1, &[0], 1000);
    let whole = env.create(request(1).flags(StepFlags::WHOLE));
    assert_eq!(step(&env, whole).cpus_alloc, vec![4]);
    env.complete(whole);

    let packed = env.create(request(1).num_tasks(8).flags(StepFlags::OVERCOMMIT));
    assert_eq!(step(&env, packed).cpus_alloc, vec![4]);
    assert_eq!(step(&env, packed).layout.as_ref().unwrap().tasks, vec![8]);
    env.check_consistency(job_id);
}

#[test]
fn test_pick_named_node_without_free_memory() {
    let mut env = TestEnv::new(uniform_nodes(2, 1, 4, 1));
    let job_id = env.new_job(1, &[0, 1], 4000);
    let a = env.create(
        request(1)
            .node_list(vec!["n0".to_string()])
            .memory(MemoryRequest::PerNode(4000)),
    );
    let result = env.try_create(
        request(1)
            .num_tasks(2)
            .node_list(vec!["n0".to_string(), "n1".to_string()])
            .memory(MemoryRequest::PerNode(1000)),
    );
    assert!(result.as_ref().is_err_and(|e| e.is_retryable()));
    expect_step_error(result, StepError::MemoryBusy);
    assert_eq!(env.resources(job_id).memory_used(), &[4000, 0]);
    env.check_consistency(job_id);

    env.complete(a);
    let b = env.create(
        request(1)
            .num_tasks(2)
            .node_list(vec!["n0".to_string(), "n1".to_string()])
            .memory(MemoryRequest::PerNode(1000)),
    );
    assert_eq!(step_nodes(&env, b), vec![0, 1]);
    assert_eq!(env.resources(job_id).memory_used(), &[1000, 1000]);
    env.check_consistency(job_id);
}

#[test]
fn test_pick_exclusive_named_node_in_use() {
    let mut env = TestEnv::new(uniform_nodes(2, 1, 4, 1));
    let job_id = env.new_job(1, &[0, 1], 4000);
    let a = env.create(request(1).node_list(vec!["n0".to_string()]));
    let exclusive = || {
        request(1)
            .num_tasks(2)
            .node_list(vec!["n0".to_string(), "n1".to_string()])
            .flags(StepFlags::EXCLUSIVE)
    };
    expect_step_error(env.try_create(exclusive()), StepError::NodesBusy);
    expect_step_error(
        env.try_create(exclusive().flags(StepFlags::EXCLUSIVE | StepFlags::OVERCOMMIT)),
        StepError::NodesBusy,
    );
    assert_eq!(env.cpus_used(job_id), vec![1, 0]);
    env.check_consistency(job_id);

    env.complete(a);
    let b = env.create(exclusive());
    assert_eq!(step_nodes(&env, b), vec![0, 1]);
    assert_eq!(env.cpus_used(job_id), vec![1, 1]);
    env.check_consistency(job_id);
}

#[test]
fn test_pick_overcommit_keeps_memory_limit() {
    let mut env = TestEnv::new(uniform_nodes(1, 1, 4, 1));
    let job_id = env.new_job(1, &[0], 4000);
    env.create(request(1).memory(MemoryRequest::PerNode(3000)));
    let result = env.try_create(
        request(1)
            .num_tasks(2)
            .memory(MemoryRequest::PerCpu(1000))
            .flags(StepFlags::OVERCOMMIT),
    );
    expect_step_error(result, StepError::MemoryBusy);
    assert_eq!(env.resources(job_id).memory_used(), &[3000]);
    env.check_consistency(job_id);
}

#[test]
fn test_pick_oversubscribed_claim_stops_at_task_cpus() {
    let mut env = TestEnv::new(uniform_nodes(1, 1, 4, 1));
    let job_id = env.new_job(1, &[0], 4000);
    let wide = || {
        request(1)
            .num_tasks(2)
            .cpus_per_task(1)
            .cpu_count(4)
            .flags(StepFlags::OVERCOMMIT)
    };
    let full = env.create(request(1).num_tasks(4));
    let s = env.create(wide());
    assert_eq!(step(&env, s).cpus_alloc, vec![2]);
    assert_eq!(env.cpus_used(job_id), vec![6]);
    env.check_consistency(job_id);

    env.complete(full);
    env.complete(s);
    let s = env.create(wide());
    assert_eq!(step(&env, s).cpus_alloc, vec![4]);
    env.check_consistency(job_id);
}
