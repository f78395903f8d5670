use crate::define_id_type;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Display, Formatter};

define_id_type!(JobId, u32);
define_id_type!(NodeIndex, u32);

/// Generic "value not set" sentinel used on the wire and in step ids.
pub const NO_VAL: u32 = 0xfffffffe;
pub const NO_VAL16: u16 = 0xfffe;
pub const NO_VAL64: u64 = 0xfffffffffffffffe;

/// Reserved step numbers.
pub const PENDING_STEP: u32 = 0xfffffffd;
pub const EXTERN_STEP: u32 = 0xfffffffc;
pub const BATCH_STEP: u32 = 0xfffffffb;
pub const INTERACTIVE_STEP: u32 = 0xfffffffa;

#[derive(Copy, Clone, Hash, PartialOrd, Ord, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepId {
    job_id: JobId,
    step_id: u32,
    het_component: u32,
}

impl Display for StepId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.", self.job_id)?;
        match self.step_id {
            PENDING_STEP => write!(f, "pending")?,
            EXTERN_STEP => write!(f, "extern")?,
            BATCH_STEP => write!(f, "batch")?,
            INTERACTIVE_STEP => write!(f, "interactive")?,
            step => write!(f, "{step}")?,
        }
        if self.het_component != NO_VAL {
            write!(f, "+{}", self.het_component)?;
        }
        Ok(())
    }
}

impl Debug for StepId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

impl StepId {
    #[inline]
    pub fn new(job_id: JobId, step_id: u32) -> Self {
        Self {
            job_id,
            step_id,
            het_component: NO_VAL,
        }
    }

    #[inline]
    pub fn with_het_component(job_id: JobId, step_id: u32, het_component: u32) -> Self {
        Self {
            job_id,
            step_id,
            het_component,
        }
    }

    #[inline]
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    #[inline]
    pub fn step_id(&self) -> u32 {
        self.step_id
    }

    #[inline]
    pub fn het_component(&self) -> Option<u32> {
        (self.het_component != NO_VAL).then_some(self.het_component)
    }

    pub(crate) fn het_component_raw(&self) -> u32 {
        self.het_component
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        self.step_id == PENDING_STEP
    }

    /// Batch, extern and interactive steps are never treated as regular work when deciding
    /// whether a node is idle.
    #[inline]
    pub fn is_implicit(&self) -> bool {
        matches!(self.step_id, EXTERN_STEP | BATCH_STEP | INTERACTIVE_STEP)
    }
}
