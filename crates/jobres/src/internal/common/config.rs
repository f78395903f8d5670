use crate::internal::common::buffer::ProtocolVersion;
use crate::internal::plugins::topology::TopologySource;
use serde::{Deserialize, Serialize};

/// Runtime options of the step manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StepMgrConfig {
    /// Where node topology is read from when building resource maps and checking
    /// threads-per-core requests.
    pub topology_source: TopologySource,
    /// Memory is a consumable step resource.
    pub track_memory: bool,
    /// Maximum number of steps a single job may create, `None` means unlimited.
    pub max_steps_per_job: Option<u32>,
    /// Layout used when saving state.
    pub protocol_version: ProtocolVersion,
}

impl Default for StepMgrConfig {
    fn default() -> Self {
        StepMgrConfig {
            topology_source: TopologySource::Configured,
            track_memory: true,
            max_steps_per_job: None,
            protocol_version: ProtocolVersion::CURRENT,
        }
    }
}
