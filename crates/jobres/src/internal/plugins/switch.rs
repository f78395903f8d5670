use crate::internal::common::ids::StepId;
use crate::internal::step::record::StepLayout;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SwitchError {
    #[error("Interconnect resources are busy")]
    Busy,
    #[error("{0}")]
    Failed(String),
}

/// Interconnect state attached to a running step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchJobInfo {
    pub step_id: StepId,
    pub nodes: Vec<String>,
}

pub trait SwitchPlugin {
    fn alloc_jobinfo(&mut self, step_id: StepId) -> Result<SwitchJobInfo, SwitchError>;

    fn build_jobinfo(
        &mut self,
        info: &mut SwitchJobInfo,
        layout: &StepLayout,
    ) -> Result<(), SwitchError>;

    fn free_jobinfo(&mut self, info: SwitchJobInfo);
}

/// Interconnect without any per-step state.
#[derive(Debug, Default)]
pub struct NoSwitch;

impl SwitchPlugin for NoSwitch {
    fn alloc_jobinfo(&mut self, step_id: StepId) -> Result<SwitchJobInfo, SwitchError> {
        Ok(SwitchJobInfo {
            step_id,
            nodes: Vec::new(),
        })
    }

    fn build_jobinfo(
        &mut self,
        info: &mut SwitchJobInfo,
        layout: &StepLayout,
    ) -> Result<(), SwitchError> {
        info.nodes = layout.node_names.clone();
        Ok(())
    }

    fn free_jobinfo(&mut self, _info: SwitchJobInfo) {}
}
