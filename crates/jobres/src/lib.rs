#[macro_use]
pub(crate) mod internal;

pub use crate::internal::common::error::ErrorKind;
pub use crate::internal::common::ids::{
    BATCH_STEP, EXTERN_STEP, INTERACTIVE_STEP, JobId, NO_VAL, NO_VAL16, NO_VAL64, NodeIndex,
    PENDING_STEP, StepId,
};
pub use crate::internal::common::utils::format_comma_delimited;
pub use crate::internal::common::{Map, Set};

pub type Error = internal::common::error::JobResError;
pub type Result<T> = std::result::Result<T, Error>;

pub mod bitmap {
    pub use crate::internal::common::bitmap::{Bitmap, BitmapParseError};
    pub use crate::internal::common::rle::{RleError, RunItem, RunLengthVec};
}

pub mod resources {
    pub use crate::internal::resources::jobres::{JobResources, NodeRemap};
    pub use crate::internal::resources::offset::{CoreLayout, CorePosition, SocketCores};
}

pub mod step {
    pub use crate::internal::step::error::StepError;
    pub use crate::internal::step::manager::{
        ImplicitStep, PartialCompletion, SIGKILL, SignalTarget, StepManager,
    };
    pub use crate::internal::step::record::{StepLayout, StepRecord, StepState};
    pub use crate::internal::step::request::{
        MemoryRequest, StepFlags, StepRequest, StepRequestBuilder, StepRequestBuilderError,
        TaskDistribution,
    };
}

pub mod job {
    pub use crate::internal::job::jobmap::JobTable;
    pub use crate::internal::job::record::{JobRecord, JobState};
    pub use crate::internal::job::state::{
        load_state, load_state_from_file, save_state, save_state_to_file,
    };
}

pub mod plugins {
    pub use crate::internal::plugins::accounting::{AccountingSink, NoAccounting};
    pub use crate::internal::plugins::gres::{
        GresAllocator, GresCoreAffinity, GresFitQuery, GresRequest, GresTable, NoGres,
    };
    pub use crate::internal::plugins::switch::{
        NoSwitch, SwitchError, SwitchJobInfo, SwitchPlugin,
    };
    pub use crate::internal::plugins::topology::{
        NodeRecord, NodeTable, NodeTopology, NodeTopologyProvider, TopologySource,
    };
}

pub mod wire {
    pub use crate::internal::common::buffer::{PackBuffer, ProtocolVersion, UnpackBuffer};
    pub use crate::internal::resources::pack::{pack_job_resources, unpack_job_resources};
    pub use crate::internal::step::pack::{pack_step, unpack_step};
}

pub mod config {
    pub use crate::internal::common::config::StepMgrConfig;
}
