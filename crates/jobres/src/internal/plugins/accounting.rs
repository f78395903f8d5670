use crate::internal::step::record::StepRecord;

/// Receives step start/completion records. Failures are only logged by the caller.
pub trait AccountingSink {
    fn step_start(&mut self, step: &StepRecord) -> crate::Result<()>;

    fn step_complete(&mut self, step: &StepRecord) -> crate::Result<()>;
}

#[derive(Debug, Default)]
pub struct NoAccounting;

impl AccountingSink for NoAccounting {
    fn step_start(&mut self, _step: &StepRecord) -> crate::Result<()> {
        Ok(())
    }

    fn step_complete(&mut self, _step: &StepRecord) -> crate::Result<()> {
        Ok(())
    }
}
