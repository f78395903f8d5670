use jobres::JobId;
use jobres::bitmap::Bitmap;
use jobres::config::StepMgrConfig;
use jobres::job::{JobRecord, JobTable};
use jobres::plugins::{NodeRecord, NodeTable, NodeTopology};
use jobres::step::StepManager;

pub fn create_nodes(count: usize) -> NodeTable {
    NodeTable::new(
        (0..count)
            .map(|index| {
                NodeRecord::new(format!("n{index}"), NodeTopology::new(2, 16, 2, 256_000))
            })
            .collect(),
    )
}

pub fn create_manager(node_count: usize) -> StepManager {
    StepManager::new(StepMgrConfig::default(), Box::new(create_nodes(node_count)))
}

/// Job over all nodes of the manager with every CPU allocated.
pub fn create_job(manager: &StepManager, jobs: &mut JobTable, job_id: u32) -> JobId {
    let node_count = manager.nodes().node_count();
    let mut resources = manager
        .build_job_resources(&Bitmap::full(node_count))
        .unwrap();
    for job_node in 0..node_count {
        resources.allocate_node(job_node, 64, 128_000).unwrap();
    }
    let job_id = JobId::new(job_id);
    jobs.insert(JobRecord::new(job_id, resources));
    job_id
}
