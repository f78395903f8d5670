use crate::internal::common::error::layout_error;
use crate::internal::common::ids::{JobId, NodeIndex, StepId};
use crate::internal::resources::jobres::{JobResources, NodeRemap};
use crate::internal::step::record::{StepRecord, StepState};
use crate::internal::step::request::StepFlags;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Running,
    Suspended,
    Completing,
}

impl JobState {
    pub(crate) fn to_code(self) -> u8 {
        match self {
            JobState::Running => 1,
            JobState::Suspended => 2,
            JobState::Completing => 3,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(JobState::Running),
            2 => Some(JobState::Suspended),
            3 => Some(JobState::Completing),
            _ => None,
        }
    }
}

/// A job allocation together with the steps running inside it.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub job_id: JobId,
    pub state: JobState,
    /// Minutes
    pub time_limit: Option<u32>,
    /// Steps may only use cores bound to their GRES
    pub gres_enforce_bind: bool,
    pub(crate) job_resrcs: Option<JobResources>,
    pub(crate) steps: Vec<StepRecord>,
    pub(crate) next_step_id: u32,
}

impl JobRecord {
    pub fn new(job_id: JobId, resources: JobResources) -> Self {
        JobRecord {
            job_id,
            state: JobState::Running,
            time_limit: None,
            gres_enforce_bind: false,
            job_resrcs: Some(resources),
            steps: Vec::new(),
            next_step_id: 0,
        }
    }

    #[inline]
    pub fn resources(&self) -> Option<&JobResources> {
        self.job_resrcs.as_ref()
    }

    #[inline]
    pub fn resources_mut(&mut self) -> Option<&mut JobResources> {
        self.job_resrcs.as_mut()
    }

    /// Drops the resource map. Calling it again is a no-op.
    pub fn free_job_resources(&mut self) {
        if self.job_resrcs.take().is_some() {
            log::debug!("Freed resources of job {}", self.job_id);
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == JobState::Running && self.job_resrcs.is_some()
    }

    #[inline]
    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    /// Number that the next step without an explicit id gets.
    #[inline]
    pub fn next_step_id(&self) -> u32 {
        self.next_step_id
    }

    pub fn find_step(&self, step_id: StepId) -> Option<&StepRecord> {
        self.steps.iter().find(|step| step.id == step_id)
    }

    pub fn find_step_mut(&mut self, step_id: StepId) -> Option<&mut StepRecord> {
        self.steps.iter_mut().find(|step| step.id == step_id)
    }

    pub(crate) fn step_position(&self, step_id: StepId) -> Option<usize> {
        self.steps.iter().position(|step| step.id == step_id)
    }

    pub fn running_steps(&self) -> impl Iterator<Item = &StepRecord> {
        self.steps.iter().filter(|step| step.is_running())
    }

    pub fn pending_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|step| step.state == StepState::Pending)
            .count()
    }

    /// A regular step still holds the node.
    pub fn node_has_running_step(&self, node: NodeIndex) -> bool {
        self.steps
            .iter()
            .any(|step| step.occupies_nodes() && step.holds_node(node))
    }

    /// Remembers a requester that should be told when resources are released.
    pub(crate) fn add_pending_step(&mut self, callback: String) {
        let known = self
            .steps
            .iter()
            .any(|step| step.state == StepState::Pending && step.callback.as_ref() == Some(&callback));
        if !known {
            log::debug!("Job {}: request of {callback} waits for resources", self.job_id);
            self.steps
                .push(StepRecord::new_pending(self.job_id, callback));
        }
    }

    /// Removes all pending placeholders and returns their requesters.
    pub(crate) fn take_pending_callbacks(&mut self) -> Vec<String> {
        let mut callbacks = Vec::new();
        self.steps.retain_mut(|step| {
            if step.state == StepState::Pending {
                callbacks.extend(step.callback.take());
                false
            } else {
                true
            }
        });
        callbacks
    }

    pub(crate) fn apply_node_remap(&mut self, remap: &NodeRemap) -> crate::Result<()> {
        for step in &mut self.steps {
            step.apply_node_remap(remap)?;
        }
        Ok(())
    }

    /// Recomputes usage counters of the resource map from the running steps.
    pub(crate) fn rebuild_usage(&mut self, track_memory: bool) -> crate::Result<()> {
        let Some(resources) = self.job_resrcs.as_mut() else {
            return Ok(());
        };
        resources.cpus_used.iter_mut().for_each(|c| *c = 0);
        resources.memory_used.iter_mut().for_each(|m| *m = 0);
        resources.core_bitmap_used.clear_all();

        for step in self.steps.iter().filter(|step| step.is_running()) {
            if step.has_flag(StepFlags::OVERLAP_FORCE) {
                continue;
            }
            if let Some(cores) = &step.core_bitmap_job {
                if cores.size() != resources.core_bitmap_used.size() {
                    return Err(layout_error(format!(
                        "step {} has {} core bits, its job has {}",
                        step.id,
                        cores.size(),
                        resources.core_bitmap_used.size()
                    )));
                }
            }
            for (position, node) in step.nodes().enumerate() {
                if step.node_released(position) {
                    continue;
                }
                let Some(job_node) = resources.job_node_index(node) else {
                    return Err(layout_error(format!(
                        "step {} uses node {node} outside of its job",
                        step.id
                    )));
                };
                let cpus = step.cpus_alloc.get(position).copied().unwrap_or(0);
                resources.cpus_used[job_node] = resources.cpus_used[job_node].saturating_add(cpus);
                if track_memory && !step.has_flag(StepFlags::MEM_ZERO) {
                    let memory = step.memory_allocated.get(position).copied().unwrap_or(0);
                    resources.memory_used[job_node] =
                        resources.memory_used[job_node].saturating_add(memory);
                }
                if let (Some(cores), Some(range)) =
                    (&step.core_bitmap_job, resources.node_core_range(job_node))
                {
                    for bit in cores.ones_in(range) {
                        resources.core_bitmap_used.set(bit);
                    }
                }
            }
        }
        Ok(())
    }
}
