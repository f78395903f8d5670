use crate::internal::common::bitmap::Bitmap;
use crate::internal::common::ids::{JobId, NodeIndex, PENDING_STEP, StepId};
use crate::internal::plugins::gres::GresRequest;
use crate::internal::plugins::switch::SwitchJobInfo;
use crate::internal::resources::jobres::NodeRemap;
use crate::internal::step::request::{MemoryRequest, StepFlags, TaskDistribution};
use chrono::{DateTime, Utc};
use std::fmt::{Debug, Formatter};

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    /// Placeholder for a request that waits for resources
    Pending,
    Running,
    Completing,
}

impl StepState {
    pub(crate) fn to_code(self) -> u8 {
        match self {
            StepState::Pending => 0,
            StepState::Running => 1,
            StepState::Completing => 2,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(StepState::Pending),
            1 => Some(StepState::Running),
            2 => Some(StepState::Completing),
            _ => None,
        }
    }
}

impl Debug for StepState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let n = match self {
            Self::Pending => "P",
            Self::Running => "R",
            Self::Completing => "C",
        };
        write!(f, "{n}")
    }
}

/// Placement of the tasks of a step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepLayout {
    pub node_names: Vec<String>,
    /// Number of tasks on every step node
    pub tasks: Vec<u16>,
    /// Global task ranks on every step node
    pub tids: Vec<Vec<u32>>,
    pub task_count: u32,
    pub distribution: TaskDistribution,
}

impl StepLayout {
    fn remove_node(&mut self, position: usize) {
        if position < self.node_names.len() {
            self.node_names.remove(position);
        }
        if position < self.tasks.len() {
            self.tasks.remove(position);
        }
        if position < self.tids.len() {
            let removed = self.tids.remove(position);
            self.task_count -= removed.len() as u32;
        }
    }
}

#[derive(Debug, Clone)]
pub struct StepRecord {
    pub id: StepId,
    pub name: String,
    pub state: StepState,
    pub flags: StepFlags,
    /// Global node indices of the step
    pub node_bitmap: Bitmap,
    /// Cores of the step in the job's core bit space; `None` for steps without a claim
    pub core_bitmap_job: Option<Bitmap>,
    pub cpus_per_task: u16,
    pub cpu_count: u32,
    pub num_tasks: u32,
    pub memory_request: MemoryRequest,
    /// CPUs claimed on every step node
    pub cpus_alloc: Vec<u16>,
    /// Memory (MB) claimed on every step node
    pub memory_allocated: Vec<u64>,
    pub gres: Vec<GresRequest>,
    pub layout: Option<StepLayout>,
    /// Step nodes that already reported completion
    pub exit_node_bitmap: Option<Bitmap>,
    pub exit_code: Option<i32>,
    /// Minutes
    pub time_limit: Option<u32>,
    pub start_time: DateTime<Utc>,
    pub last_signal: Option<i32>,
    pub switch_job: Option<SwitchJobInfo>,
    pub callback: Option<String>,
}

impl StepRecord {
    /// Running step on `node_bitmap` that claims nothing yet.
    pub fn new(id: StepId, node_bitmap: Bitmap) -> Self {
        StepRecord {
            id,
            name: String::new(),
            state: StepState::Running,
            flags: StepFlags::empty(),
            node_bitmap,
            core_bitmap_job: None,
            cpus_per_task: 1,
            cpu_count: 0,
            num_tasks: 0,
            memory_request: MemoryRequest::None,
            cpus_alloc: Vec::new(),
            memory_allocated: Vec::new(),
            gres: Vec::new(),
            layout: None,
            exit_node_bitmap: None,
            exit_code: None,
            time_limit: None,
            start_time: Utc::now(),
            last_signal: None,
            switch_job: None,
            callback: None,
        }
    }

    pub(crate) fn new_pending(job_id: JobId, callback: String) -> Self {
        let mut step = StepRecord::new(StepId::new(job_id, PENDING_STEP), Bitmap::new(0));
        step.state = StepState::Pending;
        step.callback = Some(callback);
        step
    }

    #[inline]
    pub fn id(&self) -> StepId {
        self.id
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.state == StepState::Running
    }

    #[inline]
    pub fn has_flag(&self, flag: StepFlags) -> bool {
        self.flags.contains(flag)
    }

    pub fn node_count(&self) -> usize {
        self.node_bitmap.set_count()
    }

    /// Global node indices of the step in ascending order.
    pub fn nodes(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.node_bitmap
            .ones()
            .map(|index| NodeIndex::new(index as u32))
    }

    /// Position of a node among the step's nodes.
    pub fn node_position(&self, node: NodeIndex) -> Option<usize> {
        let index = node.as_num() as usize;
        self.node_bitmap
            .test(index)
            .then(|| self.node_bitmap.rank(index))
    }

    pub fn node_released(&self, position: usize) -> bool {
        self.exit_node_bitmap
            .as_ref()
            .is_some_and(|bitmap| bitmap.test(position))
    }

    /// The step still holds resources of the node.
    pub fn holds_node(&self, node: NodeIndex) -> bool {
        self.node_position(node)
            .is_some_and(|position| !self.node_released(position))
    }

    /// Steps that make a node busy for the purposes of node selection.
    pub(crate) fn occupies_nodes(&self) -> bool {
        self.is_running() && !self.id.is_implicit()
    }

    /// Steps whose cores are recorded in the job's used core bitmap.
    pub(crate) fn commits_cores(&self) -> bool {
        self.is_running()
            && self.core_bitmap_job.is_some()
            && !self.has_flag(StepFlags::OVERLAP_FORCE)
    }

    /// Moves the step into the bit space of a job that lost a node.
    pub(crate) fn apply_node_remap(&mut self, remap: &NodeRemap) -> crate::Result<()> {
        if let Some(position) = self.node_position(remap.removed_node) {
            self.node_bitmap.clear(remap.removed_node.as_num() as usize);
            if position < self.cpus_alloc.len() {
                self.cpus_alloc.remove(position);
            }
            if position < self.memory_allocated.len() {
                self.memory_allocated.remove(position);
            }
            if let Some(layout) = &mut self.layout {
                layout.remove_node(position);
            }
            if let Some(exit) = &self.exit_node_bitmap {
                self.exit_node_bitmap = Some(exit.remove_range(position..position + 1));
            }
        }
        if let Some(cores) = &self.core_bitmap_job {
            self.core_bitmap_job = Some(remap.remap_core_bitmap(cores)?);
        }
        Ok(())
    }
}
