use crate::internal::common::Map;
use crate::internal::common::ids::JobId;
use crate::internal::job::record::JobRecord;

#[derive(Default, Debug)]
pub struct JobTable {
    jobs: Map<JobId, JobRecord>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    // Insertion
    #[inline(always)]
    pub fn insert(&mut self, job: JobRecord) -> Option<JobRecord> {
        self.jobs.insert(job.job_id, job)
    }

    // Removal
    #[inline(always)]
    pub fn remove(&mut self, job_id: JobId) -> Option<JobRecord> {
        self.jobs.remove(&job_id)
    }

    // Accessors
    #[inline(always)]
    pub fn get_job(&self, job_id: JobId) -> &JobRecord {
        self.jobs.get(&job_id).unwrap_or_else(|| {
            panic!("Asking for invalid job id={job_id}");
        })
    }

    #[inline(always)]
    pub fn get_job_mut(&mut self, job_id: JobId) -> &mut JobRecord {
        self.jobs.get_mut(&job_id).unwrap_or_else(|| {
            panic!("Asking for invalid job id={job_id}");
        })
    }

    #[inline(always)]
    pub fn find_job(&self, job_id: JobId) -> Option<&JobRecord> {
        self.jobs.get(&job_id)
    }

    #[inline(always)]
    pub fn find_job_mut(&mut self, job_id: JobId) -> Option<&mut JobRecord> {
        self.jobs.get_mut(&job_id)
    }

    // Iteration
    #[inline(always)]
    pub fn job_ids(&self) -> impl Iterator<Item = JobId> + '_ {
        self.jobs.keys().copied()
    }

    #[inline(always)]
    pub fn jobs(&self) -> impl Iterator<Item = &JobRecord> {
        self.jobs.values()
    }

    /// Jobs ordered by their id.
    pub fn sorted_jobs(&self) -> Vec<&JobRecord> {
        let mut jobs: Vec<&JobRecord> = self.jobs.values().collect();
        jobs.sort_unstable_by_key(|job| job.job_id);
        jobs
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
