use crate::internal::common::ids::{JobId, StepId};
use thiserror::Error;

/// Why a step request or a step operation was refused.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StepError {
    #[error("Requested nodes are busy")]
    NodesBusy,
    #[error("Memory required by the step is not available right now")]
    MemoryBusy,
    #[error("Generic resources required by the step are not available right now")]
    GresBusy,
    #[error("Interconnect resources are busy")]
    InterconnectBusy,

    #[error("Requested node configuration is not available in the job allocation")]
    NodeConfigUnavailable,
    #[error("More processors requested than the job allocation provides")]
    TooManyCpus,
    #[error("Memory required by the step exceeds the job allocation")]
    InvalidTaskMemory,
    #[error("Invalid generic resource specification: {0}")]
    InvalidGres(String),
    #[error("Invalid node name specified: {0}")]
    InvalidNodeName(String),
    #[error("Node {0} is not part of the job allocation")]
    NodeNotInJob(String),
    #[error("Node count specification invalid")]
    InvalidNodeCount,
    #[error("Task count specification invalid")]
    BadTaskCount,
    #[error("CPU count {cpu_count} is not divisible by the task count {num_tasks}")]
    BadCpusPerTask { cpu_count: u32, num_tasks: u32 },
    #[error("Requested threads per core exceed the node capability")]
    BadThreadPerCore,
    #[error("Task distribution specification invalid")]
    BadDistribution,
    #[error("Relative node offset {0} is outside of the job allocation")]
    InvalidRelative(u32),
    #[error("Interconnect failure: {0}")]
    InterconnectFailure(String),
    #[error("Step limit of the job reached")]
    StepLimit,
    #[error("Job {0} is not running")]
    JobNotRunning(JobId),
    #[error("Invalid job id {0}")]
    InvalidJobId(JobId),
    #[error("Invalid step id {0}")]
    InvalidStepId(StepId),
    #[error("Duplicate step id {0}")]
    DuplicateStepId(StepId),
    #[error("Invalid node range {first}-{last} for step {step_id}")]
    InvalidNodeRange {
        step_id: StepId,
        first: u32,
        last: u32,
    },
}

impl StepError {
    /// Busy errors may go away once other steps of the job finish.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StepError::NodesBusy
                | StepError::MemoryBusy
                | StepError::GresBusy
                | StepError::InterconnectBusy
        )
    }
}
