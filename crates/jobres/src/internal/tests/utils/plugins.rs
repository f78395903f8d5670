use crate::internal::common::ids::{JobId, StepId};
use crate::internal::plugins::accounting::AccountingSink;
use crate::internal::plugins::gres::{
    GresAllocator, GresCoreAffinity, GresFitQuery, GresRequest, GresTable,
};
use crate::internal::step::error::StepError;
use crate::internal::plugins::switch::{SwitchError, SwitchJobInfo, SwitchPlugin};
use crate::internal::step::record::{StepLayout, StepRecord};
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountingEvent {
    Start(StepId),
    Complete(StepId),
}

/// Accounting sink that remembers every record it received.
#[derive(Default, Clone)]
pub struct RecordingAccounting {
    pub events: Rc<RefCell<Vec<AccountingEvent>>>,
}

impl AccountingSink for RecordingAccounting {
    fn step_start(&mut self, step: &StepRecord) -> crate::Result<()> {
        self.events
            .borrow_mut()
            .push(AccountingEvent::Start(step.id));
        Ok(())
    }

    fn step_complete(&mut self, step: &StepRecord) -> crate::Result<()> {
        self.events
            .borrow_mut()
            .push(AccountingEvent::Complete(step.id));
        Ok(())
    }
}

/// Accounting sink that always fails.
pub struct FailingAccounting;

impl AccountingSink for FailingAccounting {
    fn step_start(&mut self, _step: &StepRecord) -> crate::Result<()> {
        Err("accounting storage is down".into())
    }

    fn step_complete(&mut self, _step: &StepRecord) -> crate::Result<()> {
        Err("accounting storage is down".into())
    }
}

/// Interconnect that answers with `error` while it is set.
#[derive(Default, Clone)]
pub struct TestSwitch {
    pub error: Rc<RefCell<Option<SwitchError>>>,
    pub live: Rc<RefCell<usize>>,
}

impl SwitchPlugin for TestSwitch {
    fn alloc_jobinfo(&mut self, step_id: StepId) -> Result<SwitchJobInfo, SwitchError> {
        *self.live.borrow_mut() += 1;
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
        if let Some(error) = self.error.borrow().clone() {
            return Err(error);
        }
        info.nodes = layout.node_names.clone();
        Ok(())
    }

    fn free_jobinfo(&mut self, _info: SwitchJobInfo) {
        *self.live.borrow_mut() -= 1;
    }
}

/// GRES table whose `alloc` fails on `fail_on` while it is set.
#[derive(Default, Clone)]
pub struct FlakyGres {
    pub table: Rc<RefCell<GresTable>>,
    pub fail_on: Rc<RefCell<Option<usize>>>,
}

impl FlakyGres {
    pub fn new(table: GresTable) -> Self {
        FlakyGres {
            table: Rc::new(RefCell::new(table)),
            fail_on: Default::default(),
        }
    }
}

impl GresAllocator for FlakyGres {
    fn test_step_fit(&self, query: &GresFitQuery) -> Result<Option<u32>, StepError> {
        self.table.borrow().test_step_fit(query)
    }

    fn core_affinity(
        &self,
        job_id: JobId,
        job_node: usize,
        requests: &[GresRequest],
    ) -> Option<GresCoreAffinity> {
        self.table
            .borrow()
            .core_affinity(job_id, job_node, requests)
    }

    fn alloc(
        &mut self,
        step_id: StepId,
        job_node: usize,
        requests: &[GresRequest],
    ) -> Result<(), StepError> {
        if *self.fail_on.borrow() == Some(job_node) {
            return Err(StepError::GresBusy);
        }
        self.table.borrow_mut().alloc(step_id, job_node, requests)
    }

    fn dealloc(&mut self, step_id: StepId, job_node: usize, requests: &[GresRequest]) {
        self.table
            .borrow_mut()
            .dealloc(step_id, job_node, requests)
    }

    fn in_use(&self, job_id: JobId) -> u64 {
        self.table.borrow().in_use(job_id)
    }

    fn job_resized(&mut self, job_id: JobId, removed_job_node: usize) {
        self.table.borrow_mut().job_resized(job_id, removed_job_node)
    }

    fn job_finished(&mut self, job_id: JobId) {
        self.table.borrow_mut().job_finished(job_id)
    }
}
