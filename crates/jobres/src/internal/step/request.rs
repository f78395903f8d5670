use crate::internal::common::ids::JobId;
use crate::internal::plugins::gres::GresRequest;
use crate::internal::step::error::StepError;
use derive_builder::Builder;
use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StepFlags: u16 {
        /// The step must not share CPUs of its nodes with other steps
        const EXCLUSIVE     = 0b00000001;
        /// Tasks may outnumber CPUs; used cores may be oversubscribed
        const OVERCOMMIT    = 0b00000010;
        /// Ignore claims of other steps; nothing is committed into job counters
        const OVERLAP_FORCE = 0b00000100;
        /// Claim all usable CPUs of every selected node
        const WHOLE         = 0b00001000;
        /// Memory is not accounted for this step
        const MEM_ZERO      = 0b00010000;
        const NO_KILL       = 0b00100000;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryRequest {
    #[default]
    None,
    /// MB per node
    PerNode(u64),
    /// MB per allocated CPU
    PerCpu(u64),
}

impl MemoryRequest {
    /// Memory (MB) the step needs on a node where it uses `cpus` CPUs.
    pub fn on_node(&self, cpus: u32) -> u64 {
        match self {
            MemoryRequest::None => 0,
            MemoryRequest::PerNode(memory) => *memory,
            MemoryRequest::PerCpu(memory) => memory * cpus as u64,
        }
    }
}

/// Order in which tasks (and cores) are laid out over the selected nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskDistribution {
    #[default]
    Block,
    Cyclic,
    Plane(u16),
    /// Node of every task is given explicitly by the node list
    Arbitrary,
}

impl TaskDistribution {
    pub(crate) fn to_code(self) -> (u16, u16) {
        match self {
            TaskDistribution::Block => (1, 0),
            TaskDistribution::Cyclic => (2, 0),
            TaskDistribution::Plane(size) => (3, size),
            TaskDistribution::Arbitrary => (4, 0),
        }
    }

    pub(crate) fn from_code(code: u16, plane_size: u16) -> Option<Self> {
        match code {
            1 => Some(TaskDistribution::Block),
            2 => Some(TaskDistribution::Cyclic),
            3 => Some(TaskDistribution::Plane(plane_size)),
            4 => Some(TaskDistribution::Arbitrary),
            _ => None,
        }
    }
}

#[derive(Builder, Debug, Clone)]
#[builder(pattern = "owned")]
pub struct StepRequest {
    pub job_id: JobId,
    /// Explicit step number, allocated from the job when not given
    #[builder(default, setter(strip_option))]
    pub step_id: Option<u32>,
    #[builder(default, setter(into))]
    pub name: String,
    #[builder(default = "1")]
    pub min_nodes: u32,
    #[builder(default, setter(strip_option))]
    pub max_nodes: Option<u32>,
    /// Requested CPU count, 0 derives it from tasks
    #[builder(default)]
    pub cpu_count: u32,
    #[builder(default = "1")]
    pub num_tasks: u32,
    #[builder(default, setter(strip_option))]
    pub cpus_per_task: Option<u16>,
    #[builder(default)]
    pub memory: MemoryRequest,
    #[builder(default)]
    pub gres: Vec<GresRequest>,
    #[builder(default = "StepFlags::empty()")]
    pub flags: StepFlags,
    /// Nodes that must be part of the step; one entry per task for arbitrary distribution
    #[builder(default, setter(strip_option))]
    pub node_list: Option<Vec<String>>,
    #[builder(default)]
    pub exclude: Vec<String>,
    #[builder(default)]
    pub features: Vec<String>,
    /// Skip the first `relative` nodes of the job
    #[builder(default, setter(strip_option))]
    pub relative: Option<u32>,
    #[builder(default)]
    pub distribution: TaskDistribution,
    #[builder(default, setter(strip_option))]
    pub threads_per_core: Option<u16>,
    /// Minutes
    #[builder(default, setter(strip_option))]
    pub time_limit: Option<u32>,
    /// Requester to notify when a busy request may be retried
    #[builder(default, setter(strip_option, into))]
    pub callback: Option<String>,
}

/// Counts derived from a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StepSpec {
    pub cpus_per_task: u16,
    pub cpu_count: u32,
    pub num_tasks: u32,
    pub min_nodes: u32,
    pub max_nodes: u32,
}

impl StepRequest {
    #[inline]
    pub fn has_flag(&self, flag: StepFlags) -> bool {
        self.flags.contains(flag)
    }

    /// Resolves CPUs per task and node bounds.
    ///
    /// An explicit `cpus_per_task` always wins. Otherwise it is `cpu_count / num_tasks`;
    /// a division with a remainder is rejected.
    pub(crate) fn normalize(&self, job_nodes: u32) -> Result<StepSpec, StepError> {
        let overcommit = self.has_flag(StepFlags::OVERCOMMIT);
        let num_tasks = self.num_tasks;
        if num_tasks == 0 {
            return Err(StepError::BadTaskCount);
        }
        let bad_cpt = || StepError::BadCpusPerTask {
            cpu_count: self.cpu_count,
            num_tasks,
        };
        let cpus_per_task = match self.cpus_per_task {
            Some(0) => return Err(bad_cpt()),
            Some(cpus_per_task) => cpus_per_task,
            None if self.cpu_count == 0 => 1,
            None if self.cpu_count < num_tasks && overcommit => 1,
            None => {
                if self.cpu_count % num_tasks != 0 {
                    return Err(bad_cpt());
                }
                u16::try_from(self.cpu_count / num_tasks).map_err(|_| StepError::TooManyCpus)?
            }
        };
        let task_cpus = if overcommit {
            cpus_per_task as u32
        } else {
            (cpus_per_task as u32).saturating_mul(num_tasks)
        };
        let cpu_count = self.cpu_count.max(task_cpus);

        let min_nodes = self.min_nodes.max(1);
        if min_nodes > job_nodes {
            return Err(StepError::NodeConfigUnavailable);
        }
        let max_nodes = self.max_nodes.unwrap_or(job_nodes);
        if max_nodes < min_nodes {
            return Err(StepError::InvalidNodeCount);
        }
        if num_tasks < min_nodes {
            return Err(StepError::BadTaskCount);
        }
        let max_nodes = max_nodes.min(job_nodes).min(num_tasks);

        match self.distribution {
            TaskDistribution::Plane(0) => return Err(StepError::BadDistribution),
            TaskDistribution::Arbitrary => match &self.node_list {
                Some(nodes) if nodes.len() == num_tasks as usize => {}
                _ => return Err(StepError::BadDistribution),
            },
            _ => {}
        }
        if self.threads_per_core == Some(0) {
            return Err(StepError::BadThreadPerCore);
        }

        Ok(StepSpec {
            cpus_per_task,
            cpu_count,
            num_tasks,
            min_nodes,
            max_nodes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> StepRequestBuilder {
        StepRequestBuilder::default().job_id(JobId::new(1))
    }

    #[test]
    fn test_normalize_derives_cpus_per_task() {
        let rq = request().cpu_count(8).num_tasks(4).build().unwrap();
        let spec = rq.normalize(4).unwrap();
        assert_eq!(spec.cpus_per_task, 2);
        assert_eq!(spec.cpu_count, 8);
        assert_eq!(spec.min_nodes, 1);
        assert_eq!(spec.max_nodes, 4);
    }

    #[test]
    fn test_normalize_uneven_division() {
        let rq = request().cpu_count(7).num_tasks(2).build().unwrap();
        assert_eq!(
            rq.normalize(4),
            Err(StepError::BadCpusPerTask {
                cpu_count: 7,
                num_tasks: 2
            })
        );
    }

    #[test]
    fn test_normalize_explicit_cpus_per_task_wins() {
        let rq = request()
            .cpu_count(7)
            .num_tasks(2)
            .cpus_per_task(1)
            .build()
            .unwrap();
        let spec = rq.normalize(4).unwrap();
        assert_eq!(spec.cpus_per_task, 1);
        assert_eq!(spec.cpu_count, 7);
    }

    #[test]
    fn test_normalize_overcommit() {
        let rq = request()
            .cpu_count(2)
            .num_tasks(8)
            .flags(StepFlags::OVERCOMMIT)
            .build()
            .unwrap();
        let spec = rq.normalize(1).unwrap();
        assert_eq!(spec.cpus_per_task, 1);
        assert_eq!(spec.cpu_count, 2);
    }

    #[test]
    fn test_normalize_node_counts() {
        let rq = request().min_nodes(10).num_tasks(10).build().unwrap();
        assert_eq!(rq.normalize(4), Err(StepError::NodeConfigUnavailable));
        let rq = request().min_nodes(5).max_nodes(4).num_tasks(5).build().unwrap();
        assert_eq!(rq.normalize(4), Err(StepError::NodeConfigUnavailable));
        let rq = request().min_nodes(3).max_nodes(2).num_tasks(3).build().unwrap();
        assert_eq!(rq.normalize(4), Err(StepError::InvalidNodeCount));
        let rq = request().min_nodes(2).num_tasks(1).build().unwrap();
        assert_eq!(rq.normalize(4), Err(StepError::BadTaskCount));
        let rq = request().num_tasks(2).build().unwrap();
        assert_eq!(rq.normalize(4).unwrap().max_nodes, 2);
    }

    #[test]
    fn test_normalize_distribution() {
        let rq = request()
            .distribution(TaskDistribution::Plane(0))
            .build()
            .unwrap();
        assert_eq!(rq.normalize(4), Err(StepError::BadDistribution));
        let rq = request()
            .num_tasks(2)
            .distribution(TaskDistribution::Arbitrary)
            .node_list(vec!["n1".to_string()])
            .build()
            .unwrap();
        assert_eq!(rq.normalize(4), Err(StepError::BadDistribution));
    }
}
