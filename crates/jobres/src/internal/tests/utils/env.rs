use crate::internal::common::bitmap::Bitmap;
use crate::internal::common::config::StepMgrConfig;
use crate::internal::common::ids::{JobId, StepId};
use crate::internal::job::jobmap::JobTable;
use crate::internal::job::record::JobRecord;
use crate::internal::plugins::accounting::AccountingSink;
use crate::internal::plugins::gres::GresAllocator;
use crate::internal::plugins::switch::SwitchPlugin;
use crate::internal::plugins::topology::{NodeTable, NodeTopologyProvider};
use crate::internal::resources::jobres::JobResources;
use crate::internal::step::manager::StepManager;
use crate::internal::step::request::{StepFlags, StepRequest, StepRequestBuilder};

pub fn request(job_id: u32) -> StepRequestBuilder {
    StepRequestBuilder::default().job_id(JobId::new(job_id))
}

pub struct TestEnv {
    pub manager: StepManager,
    pub jobs: JobTable,
}

impl TestEnv {
    pub fn new(nodes: NodeTable) -> TestEnv {
        Self::with_config(nodes, StepMgrConfig::default())
    }

    pub fn with_config(nodes: NodeTable, config: StepMgrConfig) -> TestEnv {
        TestEnv {
            manager: StepManager::new(config, Box::new(nodes)),
            jobs: JobTable::new(),
        }
    }

    pub fn gres(mut self, gres: impl GresAllocator + 'static) -> Self {
        self.manager = self.manager.with_gres(Box::new(gres));
        self
    }

    pub fn switch(mut self, switch: impl SwitchPlugin + 'static) -> Self {
        self.manager = self.manager.with_switch(Box::new(switch));
        self
    }

    pub fn accounting(mut self, accounting: impl AccountingSink + 'static) -> Self {
        self.manager = self.manager.with_accounting(Box::new(accounting));
        self
    }

    /// Resources over the given global nodes with every core and CPU allocated and
    /// `memory` MB on each node.
    pub fn build_resources(&self, nodes: &[usize], memory: u64) -> JobResources {
        let provider = self.manager.nodes();
        let node_bitmap = Bitmap::from_indices(provider.node_count(), nodes.iter().copied());
        let mut resources = self.manager.build_job_resources(&node_bitmap).unwrap();
        for job_node in 0..resources.nhosts() as usize {
            let node = resources.node_index(job_node).unwrap();
            let cpus = provider
                .topology(node, self.manager.config().topology_source)
                .unwrap()
                .cpus;
            resources.allocate_node(job_node, cpus, memory).unwrap();
        }
        resources
    }

    pub fn new_job(&mut self, job_id: u32, nodes: &[usize], memory: u64) -> JobId {
        let resources = self.build_resources(nodes, memory);
        let job_id = JobId::new(job_id);
        self.jobs.insert(JobRecord::new(job_id, resources));
        job_id
    }

    pub fn job(&self, job_id: JobId) -> &JobRecord {
        self.jobs.get_job(job_id)
    }

    pub fn job_mut(&mut self, job_id: JobId) -> &mut JobRecord {
        self.jobs.get_job_mut(job_id)
    }

    pub fn resources(&self, job_id: JobId) -> &JobResources {
        self.job(job_id).resources().unwrap()
    }

    pub fn try_create(&mut self, request: StepRequestBuilder) -> crate::Result<StepId> {
        let request: StepRequest = request.build().unwrap();
        self.manager.create_step(&mut self.jobs, request)
    }

    pub fn create(&mut self, request: StepRequestBuilder) -> StepId {
        self.try_create(request).unwrap()
    }

    pub fn complete(&mut self, step_id: StepId) -> Vec<String> {
        self.manager.complete_step(&mut self.jobs, step_id).unwrap()
    }

    pub fn cpus_used(&self, job_id: JobId) -> Vec<u16> {
        self.resources(job_id).cpus_used().to_vec()
    }

    /// Checks that no step holds anything of the job.
    pub fn check_idle(&self, job_id: JobId) {
        let resources = self.resources(job_id);
        assert!(resources.cpus_used().iter().all(|c| *c == 0));
        assert!(resources.memory_used().iter().all(|m| *m == 0));
        assert!(resources.core_bitmap_used().is_clear());
        assert_eq!(self.manager.gres().in_use(job_id), 0);
    }

    /// Checks that job counters agree with the claims of its running steps.
    pub fn check_consistency(&self, job_id: JobId) {
        let job = self.job(job_id);
        let resources = self.resources(job_id);
        let nhosts = resources.nhosts() as usize;
        let mut cpus = vec![0u16; nhosts];
        let mut memory = vec![0u64; nhosts];
        let mut cores = Bitmap::new(resources.core_bitmap().size());
        for step in job.running_steps() {
            for (position, node) in step.nodes().enumerate() {
                if step.node_released(position) {
                    continue;
                }
                let job_node = resources.job_node_index(node).unwrap();
                cpus[job_node] += step.cpus_alloc[position];
                memory[job_node] += step.memory_allocated[position];
                if let Some(step_cores) = &step.core_bitmap_job {
                    let range = resources.node_core_range(job_node).unwrap();
                    for bit in step_cores.ones_in(range) {
                        cores.set(bit);
                    }
                }
            }
        }
        assert_eq!(resources.cpus_used(), &cpus[..]);
        if self.manager.config().track_memory {
            assert_eq!(resources.memory_used(), &memory[..]);
        }
        for job_node in 0..nhosts {
            let overcommitted = resources.node_index(job_node).is_some_and(|node| {
                job.running_steps()
                    .any(|step| step.has_flag(StepFlags::OVERCOMMIT) && step.holds_node(node))
            });
            assert!(
                overcommitted || resources.cpus_used()[job_node] <= resources.cpus()[job_node],
                "job node {job_node} uses {} of {} CPUs",
                resources.cpus_used()[job_node],
                resources.cpus()[job_node]
            );
            if self.manager.config().track_memory {
                assert!(
                    resources.memory_used()[job_node] <= resources.memory_allocated()[job_node],
                    "job node {job_node} uses {} of {} MB",
                    resources.memory_used()[job_node],
                    resources.memory_allocated()[job_node]
                );
            }
        }
        assert_eq!(resources.core_bitmap_used(), &cores);
        assert!(resources.core_bitmap().is_superset_of(resources.core_bitmap_used()));
        resources.validate().unwrap();
    }
}
