use crate::internal::common::bitmap::Bitmap;
use crate::internal::common::config::StepMgrConfig;
use crate::internal::common::error::layout_error;
use crate::internal::common::ids::{
    BATCH_STEP, EXTERN_STEP, JobId, NodeIndex, PENDING_STEP, StepId,
};
use crate::internal::job::jobmap::JobTable;
use crate::internal::job::record::JobRecord;
use crate::internal::plugins::accounting::{AccountingSink, NoAccounting};
use crate::internal::plugins::gres::{GresAllocator, NoGres};
use crate::internal::plugins::switch::{NoSwitch, SwitchError, SwitchPlugin};
use crate::internal::plugins::topology::NodeTopologyProvider;
use crate::internal::resources::jobres::{JobResources, NodeRemap};
use crate::internal::step::error::StepError;
use crate::internal::step::picker::{PickContext, StepPick, pick_step};
use crate::internal::step::record::{StepLayout, StepRecord, StepState};
use crate::internal::step::request::{StepFlags, StepRequest, TaskDistribution};

pub const SIGKILL: i32 = 9;

/// Steps created by the controller itself rather than requested by a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImplicitStep {
    /// Batch script, runs on the first node of the job
    Batch,
    /// Holds processes started outside of any step, spans all job nodes
    Extern,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialCompletion {
    /// Step nodes that have not reported yet
    pub remaining: usize,
    /// Nodes of the range that had already reported before
    pub duplicates: usize,
    pub completed: bool,
    /// Requesters that may retry now
    pub callbacks: Vec<String>,
}

/// Nodes that have to be signalled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalTarget {
    pub step_id: StepId,
    pub signal: i32,
    pub nodes: Vec<String>,
}

/// Creates, completes and reshapes steps inside job allocations.
///
/// All step claims go through the job's resource map: creation commits CPUs, memory, cores
/// and GRES of every step node, completion (full or per node range) gives them back.
pub struct StepManager {
    config: StepMgrConfig,
    nodes: Box<dyn NodeTopologyProvider>,
    gres: Box<dyn GresAllocator>,
    switch: Box<dyn SwitchPlugin>,
    accounting: Box<dyn AccountingSink>,
}

impl StepManager {
    pub fn new(config: StepMgrConfig, nodes: Box<dyn NodeTopologyProvider>) -> Self {
        StepManager {
            config,
            nodes,
            gres: Box::new(NoGres),
            switch: Box::new(NoSwitch),
            accounting: Box::new(NoAccounting),
        }
    }

    pub fn with_gres(mut self, gres: Box<dyn GresAllocator>) -> Self {
        self.gres = gres;
        self
    }

    pub fn with_switch(mut self, switch: Box<dyn SwitchPlugin>) -> Self {
        self.switch = switch;
        self
    }

    pub fn with_accounting(mut self, accounting: Box<dyn AccountingSink>) -> Self {
        self.accounting = accounting;
        self
    }

    #[inline]
    pub fn config(&self) -> &StepMgrConfig {
        &self.config
    }

    #[inline]
    pub fn nodes(&self) -> &dyn NodeTopologyProvider {
        self.nodes.as_ref()
    }

    #[inline]
    pub fn gres(&self) -> &dyn GresAllocator {
        self.gres.as_ref()
    }

    /// Empty resource map over `node_bitmap` using the configured topology source.
    pub fn build_job_resources(&self, node_bitmap: &Bitmap) -> crate::Result<JobResources> {
        JobResources::build(node_bitmap, self.config.topology_source, self.nodes.as_ref())
    }

    fn node_name(&self, node: NodeIndex) -> String {
        self.nodes
            .node_name(node)
            .map(|name| name.to_string())
            .unwrap_or_else(|| format!("node{node}"))
    }

    fn tracks_memory(&self, step: &StepRecord) -> bool {
        self.config.track_memory
            && !step.has_flag(StepFlags::MEM_ZERO)
            && !step.has_flag(StepFlags::OVERLAP_FORCE)
    }

    /// Creates a step from a request.
    ///
    /// Busy errors leave a pending placeholder behind when the request carries a callback;
    /// the callback is handed back once some step of the job releases resources.
    pub fn create_step(
        &mut self,
        jobs: &mut JobTable,
        request: StepRequest,
    ) -> crate::Result<StepId> {
        let job_id = request.job_id;
        let job = jobs
            .find_job_mut(job_id)
            .ok_or(StepError::InvalidJobId(job_id))?;
        if !job.is_running() {
            return Err(StepError::JobNotRunning(job_id).into());
        }
        if let Some(limit) = self.config.max_steps_per_job {
            if request.step_id.is_none() && job.next_step_id >= limit {
                log::debug!("Job {job_id} reached its step limit {limit}");
                return Err(StepError::StepLimit.into());
            }
        }
        let step_number = match request.step_id {
            Some(number @ (BATCH_STEP | EXTERN_STEP | PENDING_STEP)) => {
                return Err(StepError::InvalidStepId(StepId::new(job_id, number)).into());
            }
            Some(number) => {
                if job.find_step(StepId::new(job_id, number)).is_some() {
                    return Err(StepError::DuplicateStepId(StepId::new(job_id, number)).into());
                }
                number
            }
            None => job.next_step_id,
        };

        let nhosts = job.resources().map(|r| r.nhosts()).unwrap_or(0);
        let spec = request.normalize(nhosts)?;
        let ctx = PickContext {
            nodes: self.nodes.as_ref(),
            gres: self.gres.as_ref(),
            config: &self.config,
        };
        let pick = match pick_step(job, &request, &spec, &ctx) {
            Ok(pick) => pick,
            Err(error) => {
                if error.is_retryable() {
                    if let Some(callback) = &request.callback {
                        job.add_pending_step(callback.clone());
                    }
                }
                return Err(error.into());
            }
        };

        let step_id = StepId::new(job_id, step_number);
        let mut step = self.build_step_record(step_id, &request, job.time_limit, pick);
        if let Err(error) = self.commit_step(job, &step) {
            if error.is_retryable() {
                if let Some(callback) = &request.callback {
                    job.add_pending_step(callback.clone());
                }
            }
            return Err(error);
        }
        if let Err(error) = self.attach_switch(&mut step) {
            self.release_step(job, &step);
            if error.is_retryable() {
                if let Some(callback) = &request.callback {
                    job.add_pending_step(callback.clone());
                }
            }
            return Err(error.into());
        }

        if request.step_id.is_none() || (step_number >= job.next_step_id && !step_id.is_implicit())
        {
            job.next_step_id = step_number.saturating_add(1);
        }
        if let Err(error) = self.accounting.step_start(&step) {
            log::warn!("Accounting of step {step_id} start failed: {error}");
        }
        log::debug!(
            "Step {step_id} created on {} node(s), {} CPU(s), {} task(s)",
            step.node_count(),
            step.cpus_alloc.iter().map(|c| *c as u32).sum::<u32>(),
            step.num_tasks
        );
        job.steps.push(step);
        if let Some(resources) = job.resources() {
            resources.log_job_resources(&format!("job {job_id} after step {step_id}"));
        }
        Ok(step_id)
    }

    fn build_step_record(
        &self,
        step_id: StepId,
        request: &StepRequest,
        job_time_limit: Option<u32>,
        pick: StepPick,
    ) -> StepRecord {
        let node_names: Vec<String> = pick
            .node_bitmap
            .ones()
            .map(|index| self.node_name(NodeIndex::new(index as u32)))
            .collect();
        let time_limit = match (request.time_limit, job_time_limit) {
            (Some(step), Some(job)) => Some(step.min(job)),
            (step, job) => step.or(job),
        };
        let mut step = StepRecord::new(step_id, pick.node_bitmap);
        step.name = request.name.clone();
        step.flags = request.flags;
        step.core_bitmap_job = Some(pick.core_bitmap);
        step.cpus_per_task = pick.spec.cpus_per_task;
        step.cpu_count = pick.cpus.iter().map(|c| *c as u32).sum();
        step.num_tasks = pick.spec.num_tasks;
        step.memory_request = request.memory;
        step.cpus_alloc = pick.cpus;
        step.memory_allocated = pick.memory;
        step.gres = request.gres.clone();
        step.time_limit = time_limit;
        step.layout = Some(StepLayout {
            node_names,
            tasks: pick.placement.tasks,
            tids: pick.placement.tids,
            task_count: pick.spec.num_tasks,
            distribution: request.distribution,
        });
        step
    }

    fn attach_switch(&mut self, step: &mut StepRecord) -> Result<(), StepError> {
        let to_step_error = |error: SwitchError| match error {
            SwitchError::Busy => StepError::InterconnectBusy,
            SwitchError::Failed(message) => StepError::InterconnectFailure(message),
        };
        let mut info = self.switch.alloc_jobinfo(step.id).map_err(to_step_error)?;
        if let Some(layout) = &step.layout {
            if let Err(error) = self.switch.build_jobinfo(&mut info, layout) {
                self.switch.free_jobinfo(info);
                return Err(to_step_error(error));
            }
        }
        step.switch_job = Some(info);
        Ok(())
    }

    /// Job node index of every step node.
    fn step_job_nodes(resources: &JobResources, step: &StepRecord) -> crate::Result<Vec<usize>> {
        step.nodes()
            .map(|node| {
                resources.job_node_index(node).ok_or_else(|| {
                    layout_error(format!("step {} uses node {node} outside of its job", step.id))
                })
            })
            .collect()
    }

    /// Commits claims of a new step, all nodes or none.
    fn commit_step(&mut self, job: &mut JobRecord, step: &StepRecord) -> crate::Result<()> {
        let JobRecord {
            job_id,
            job_resrcs,
            steps,
            ..
        } = job;
        let resources = job_resrcs
            .as_mut()
            .ok_or(StepError::JobNotRunning(*job_id))?;
        let job_nodes = Self::step_job_nodes(resources, step)?;
        for (position, job_node) in job_nodes.iter().enumerate() {
            if let Err(error) = self.commit_node(resources, step, position, *job_node) {
                for (done, done_node) in job_nodes[..position].iter().enumerate().rev() {
                    self.release_node(resources, steps, step, done, *done_node);
                }
                log::debug!("Step {} rolled back: {error}", step.id);
                return Err(error);
            }
        }
        Ok(())
    }

    fn commit_node(
        &mut self,
        resources: &mut JobResources,
        step: &StepRecord,
        position: usize,
        job_node: usize,
    ) -> crate::Result<()> {
        if step.has_flag(StepFlags::OVERLAP_FORCE) {
            return Ok(());
        }
        let cpus = step.cpus_alloc.get(position).copied().unwrap_or(0);
        let Some(cpus_used) = resources.cpus_used[job_node].checked_add(cpus) else {
            return Err(layout_error(format!(
                "step {} overflows the CPU counter of job node {job_node}",
                step.id
            )));
        };
        if !step.gres.is_empty() {
            self.gres.alloc(step.id, job_node, &step.gres)?;
        }
        resources.cpus_used[job_node] = cpus_used;
        if self.tracks_memory(step) {
            let memory = step.memory_allocated.get(position).copied().unwrap_or(0);
            resources.memory_used[job_node] = resources.memory_used[job_node].saturating_add(memory);
        }
        if let (Some(cores), Some(range)) =
            (&step.core_bitmap_job, resources.node_core_range(job_node))
        {
            for bit in cores.ones_in(range) {
                resources.core_bitmap_used.set(bit);
            }
        }
        Ok(())
    }

    /// Gives back claims of one step node. `others` are the remaining steps of the job, their
    /// cores stay marked as used.
    fn release_node(
        &mut self,
        resources: &mut JobResources,
        others: &[StepRecord],
        step: &StepRecord,
        position: usize,
        job_node: usize,
    ) {
        if step.has_flag(StepFlags::OVERLAP_FORCE) {
            return;
        }
        if !step.gres.is_empty() {
            self.gres.dealloc(step.id, job_node, &step.gres);
        }
        let cpus = step.cpus_alloc.get(position).copied().unwrap_or(0);
        let cpus_used = resources.cpus_used[job_node];
        resources.cpus_used[job_node] = cpus_used.checked_sub(cpus).unwrap_or_else(|| {
            log::error!(
                "Step {}: CPU counter of job node {job_node} underflows ({cpus_used} - {cpus})",
                step.id
            );
            0
        });
        if self.tracks_memory(step) {
            let memory = step.memory_allocated.get(position).copied().unwrap_or(0);
            let memory_used = resources.memory_used[job_node];
            resources.memory_used[job_node] = memory_used.checked_sub(memory).unwrap_or_else(|| {
                log::error!(
                    "Step {}: memory counter of job node {job_node} underflows \
                     ({memory_used} - {memory})",
                    step.id
                );
                0
            });
        }

        let (Some(cores), Some(range)) =
            (&step.core_bitmap_job, resources.node_core_range(job_node))
        else {
            return;
        };
        if cores.size() != resources.core_bitmap_used.size() {
            log::error!(
                "Step {} has {} core bits, its job has {}",
                step.id,
                cores.size(),
                resources.core_bitmap_used.size()
            );
            return;
        }
        for bit in cores.ones_in(range.clone()) {
            resources.core_bitmap_used.clear(bit);
        }
        let Some(node) = resources.node_index(job_node) else {
            return;
        };
        for other in others
            .iter()
            .filter(|other| other.commits_cores() && other.holds_node(node))
        {
            if let Some(other_cores) = &other.core_bitmap_job {
                for bit in other_cores.ones_in(range.clone()) {
                    resources.core_bitmap_used.set(bit);
                }
            }
        }
    }

    /// Releases every node the step still holds. The step must not be in `job.steps`.
    fn release_step(&mut self, job: &mut JobRecord, step: &StepRecord) {
        let JobRecord {
            job_resrcs, steps, ..
        } = job;
        let Some(resources) = job_resrcs.as_mut() else {
            return;
        };
        for (position, node) in step.nodes().enumerate() {
            if step.node_released(position) {
                continue;
            }
            match resources.job_node_index(node) {
                Some(job_node) => self.release_node(resources, steps, step, position, job_node),
                None => log::error!("Step {} holds node {node} outside of its job", step.id),
            }
        }
    }

    /// Creates the batch or extern step of a job. These steps claim no CPUs, memory or cores.
    pub fn create_implicit_step(
        &mut self,
        jobs: &mut JobTable,
        job_id: JobId,
        kind: ImplicitStep,
    ) -> crate::Result<StepId> {
        let job = jobs
            .find_job_mut(job_id)
            .ok_or(StepError::InvalidJobId(job_id))?;
        let resources = match job.resources() {
            Some(resources) if job.is_running() => resources,
            _ => return Err(StepError::JobNotRunning(job_id).into()),
        };
        let (number, name) = match kind {
            ImplicitStep::Batch => (BATCH_STEP, "batch"),
            ImplicitStep::Extern => (EXTERN_STEP, "extern"),
        };
        let step_id = StepId::new(job_id, number);
        if job.find_step(step_id).is_some() {
            return Err(StepError::DuplicateStepId(step_id).into());
        }
        let node_bitmap = match kind {
            ImplicitStep::Batch => Bitmap::from_indices(
                resources.node_bitmap().size(),
                resources.node_index(0).map(|node| node.as_num() as usize),
            ),
            ImplicitStep::Extern => resources.node_bitmap().clone(),
        };
        let node_count = node_bitmap.set_count();
        if node_count == 0 {
            return Err(StepError::NodeConfigUnavailable.into());
        }

        let mut step = StepRecord::new(step_id, node_bitmap);
        step.name = name.to_string();
        step.num_tasks = node_count as u32;
        step.cpus_alloc = vec![0; node_count];
        step.memory_allocated = vec![0; node_count];
        step.time_limit = job.time_limit;
        step.layout = Some(StepLayout {
            node_names: step.nodes().map(|node| self.node_name(node)).collect(),
            tasks: vec![1; node_count],
            tids: (0..node_count as u32).map(|rank| vec![rank]).collect(),
            task_count: node_count as u32,
            distribution: TaskDistribution::Block,
        });
        if let Err(error) = self.accounting.step_start(&step) {
            log::warn!("Accounting of step {step_id} start failed: {error}");
        }
        log::debug!("Step {step_id} created on {node_count} node(s)");
        job.steps.push(step);
        Ok(step_id)
    }

    /// Records that nodes `first..=last` (positions among the step's nodes) finished.
    ///
    /// Claims of those nodes are released immediately. Nodes that already reported are
    /// ignored. Once every node has reported, the step is completed.
    pub fn partial_complete(
        &mut self,
        jobs: &mut JobTable,
        step_id: StepId,
        first: u32,
        last: u32,
        exit_code: i32,
    ) -> crate::Result<PartialCompletion> {
        let job = jobs
            .find_job_mut(step_id.job_id())
            .ok_or(StepError::InvalidJobId(step_id.job_id()))?;
        let index = job
            .step_position(step_id)
            .filter(|index| job.steps[*index].is_running())
            .ok_or(StepError::InvalidStepId(step_id))?;
        let node_count = job.steps[index].node_count();
        if first > last || last as usize >= node_count {
            return Err(StepError::InvalidNodeRange {
                step_id,
                first,
                last,
            }
            .into());
        }

        let mut step = job.steps.remove(index);
        let fresh: Vec<usize> = (first as usize..=last as usize)
            .filter(|position| !step.node_released(*position))
            .collect();
        let duplicates = (last - first + 1) as usize - fresh.len();
        if duplicates > 0 {
            log::warn!(
                "Step {step_id}: {duplicates} node(s) of range {first}-{last} already completed"
            );
        }
        step.exit_code = Some(step.exit_code.map_or(exit_code, |code| code.max(exit_code)));

        let nodes: Vec<NodeIndex> = step.nodes().collect();
        {
            let JobRecord {
                job_resrcs, steps, ..
            } = &mut *job;
            if let Some(resources) = job_resrcs.as_mut() {
                for position in &fresh {
                    match resources.job_node_index(nodes[*position]) {
                        Some(job_node) => {
                            self.release_node(resources, steps, &step, *position, job_node)
                        }
                        None => log::error!(
                            "Step {step_id} holds node {} outside of its job",
                            nodes[*position]
                        ),
                    }
                }
            }
        }
        let exit = step
            .exit_node_bitmap
            .get_or_insert_with(|| Bitmap::new(node_count));
        for position in &fresh {
            exit.set(*position);
        }
        let remaining = node_count - exit.set_count();
        job.steps.insert(index, step);

        let callbacks = if remaining == 0 {
            self.complete_step(jobs, step_id)?
        } else if fresh.is_empty() {
            Vec::new()
        } else {
            job.take_pending_callbacks()
        };
        Ok(PartialCompletion {
            remaining,
            duplicates,
            completed: remaining == 0,
            callbacks,
        })
    }

    /// Completes a step: releases whatever it still holds and removes it from its job.
    ///
    /// Returns the requesters of pending steps, which may retry now.
    pub fn complete_step(
        &mut self,
        jobs: &mut JobTable,
        step_id: StepId,
    ) -> crate::Result<Vec<String>> {
        let job = jobs
            .find_job_mut(step_id.job_id())
            .ok_or(StepError::InvalidJobId(step_id.job_id()))?;
        let Some(index) = job
            .step_position(step_id)
            .filter(|index| job.steps[*index].state != StepState::Pending)
        else {
            log::warn!("Step {step_id} is not running, it may have completed already");
            return Err(StepError::InvalidStepId(step_id).into());
        };
        let mut step = job.steps.remove(index);
        step.state = StepState::Completing;
        self.release_step(job, &step);
        if let Some(info) = step.switch_job.take() {
            self.switch.free_jobinfo(info);
        }
        if let Err(error) = self.accounting.step_complete(&step) {
            log::warn!("Accounting of step {step_id} completion failed: {error}");
        }
        log::debug!("Step {step_id} completed");
        if let Some(resources) = job.resources() {
            resources.log_job_resources(&format!("job {} after step {step_id}", job.job_id));
        }
        Ok(job.take_pending_callbacks())
    }

    /// Sets the time limit of one step (or all running steps) of a job. Limits above the
    /// job's own limit are clamped to it. Returns the number of updated steps.
    pub fn update_time_limit(
        &mut self,
        jobs: &mut JobTable,
        job_id: JobId,
        step: Option<u32>,
        time_limit: Option<u32>,
    ) -> crate::Result<usize> {
        let job = jobs
            .find_job_mut(job_id)
            .ok_or(StepError::InvalidJobId(job_id))?;
        let time_limit = match (time_limit, job.time_limit) {
            (Some(limit), Some(job_limit)) if limit > job_limit => {
                log::debug!("Step limit {limit} of job {job_id} clamped to {job_limit}");
                Some(job_limit)
            }
            (None, job_limit) => job_limit,
            (limit, _) => limit,
        };
        let mut updated = 0;
        for record in job
            .steps
            .iter_mut()
            .filter(|s| s.is_running() && step.is_none_or(|number| s.id.step_id() == number))
        {
            record.time_limit = time_limit;
            updated += 1;
        }
        if let (Some(number), 0) = (step, updated) {
            return Err(StepError::InvalidStepId(StepId::new(job_id, number)).into());
        }
        Ok(updated)
    }

    /// Resolves the nodes that should receive a signal.
    ///
    /// Killing the pending step id cancels all waiting requests of the job.
    pub fn signal_step(
        &mut self,
        jobs: &mut JobTable,
        step_id: StepId,
        signal: i32,
    ) -> crate::Result<SignalTarget> {
        let job = jobs
            .find_job_mut(step_id.job_id())
            .ok_or(StepError::InvalidJobId(step_id.job_id()))?;
        if step_id.is_pending() {
            if signal == SIGKILL {
                let cancelled = job.take_pending_callbacks();
                log::debug!(
                    "Cancelled {} pending request(s) of job {}",
                    cancelled.len(),
                    job.job_id
                );
            }
            return Ok(SignalTarget {
                step_id,
                signal,
                nodes: Vec::new(),
            });
        }
        let step = job
            .find_step_mut(step_id)
            .filter(|step| step.is_running())
            .ok_or(StepError::InvalidStepId(step_id))?;
        step.last_signal = Some(signal);
        let step = &*step;
        let nodes = step
            .nodes()
            .enumerate()
            .filter(|(position, _)| !step.node_released(*position))
            .map(|(_, node)| self.node_name(node))
            .collect();
        Ok(SignalTarget {
            step_id,
            signal,
            nodes,
        })
    }

    /// Removes a node from a running job and moves all its steps into the new bit space.
    pub fn resize_job(
        &mut self,
        jobs: &mut JobTable,
        job_id: JobId,
        node: NodeIndex,
    ) -> crate::Result<NodeRemap> {
        let job = jobs
            .find_job_mut(job_id)
            .ok_or(StepError::InvalidJobId(job_id))?;
        let resources = job.resources().ok_or(StepError::JobNotRunning(job_id))?;
        let job_node = resources
            .job_node_index(node)
            .ok_or_else(|| StepError::NodeNotInJob(self.node_name(node)))?;
        if resources.nhosts() <= 1 {
            return Err(StepError::InvalidNodeCount.into());
        }
        for step in job.steps.iter().filter(|step| {
            step.is_running()
                && step.holds_node(node)
                && !step.gres.is_empty()
                && !step.has_flag(StepFlags::OVERLAP_FORCE)
        }) {
            self.gres.dealloc(step.id, job_node, &step.gres);
        }
        let remap = job
            .resources_mut()
            .ok_or(StepError::JobNotRunning(job_id))?
            .remove_node(job_node)?;
        job.apply_node_remap(&remap)?;
        self.gres.job_resized(job_id, job_node);
        log::info!("Job {job_id} shrunk by node {}", self.node_name(node));
        Ok(remap)
    }

    /// Completes every step of a job, removes the job and frees its resources.
    pub fn purge_job(&mut self, jobs: &mut JobTable, job_id: JobId) -> crate::Result<JobRecord> {
        let step_ids: Vec<StepId> = jobs
            .find_job(job_id)
            .ok_or(StepError::InvalidJobId(job_id))?
            .steps
            .iter()
            .filter(|step| step.state != StepState::Pending)
            .map(|step| step.id)
            .collect();
        for step_id in step_ids {
            self.complete_step(jobs, step_id)?;
        }
        let mut job = jobs
            .remove(job_id)
            .ok_or(StepError::InvalidJobId(job_id))?;
        let cancelled = job.take_pending_callbacks();
        if !cancelled.is_empty() {
            log::debug!("Dropped {} pending request(s) of job {job_id}", cancelled.len());
        }
        self.gres.job_finished(job_id);
        job.free_job_resources();
        Ok(job)
    }
}
