use crate::internal::common::Map;
use crate::internal::common::bitmap::Bitmap;
use crate::internal::common::ids::{JobId, StepId};
use crate::internal::step::error::StepError;
use serde::{Deserialize, Serialize};

/// Generic resource (GPU, NIC, ...) requested by a step on each of its nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GresRequest {
    pub name: String,
    pub per_node: u64,
    /// CPUs usable per allocated unit; limits the CPUs of the step on a node
    #[serde(default)]
    pub cpus_per_gres: Option<u16>,
    /// Memory (MB) needed per allocated unit
    #[serde(default)]
    pub mem_per_gres: Option<u64>,
}

impl GresRequest {
    pub fn new(name: impl Into<String>, per_node: u64) -> Self {
        GresRequest {
            name: name.into(),
            per_node,
            cpus_per_gres: None,
            mem_per_gres: None,
        }
    }
}

pub struct GresFitQuery<'a> {
    pub job_id: JobId,
    /// Index of the node inside the job allocation
    pub job_node: usize,
    pub requests: &'a [GresRequest],
    /// Treat units held by other steps as available
    pub ignore_existing: bool,
    /// Memory the step can still get on the node, `None` when memory is not tracked
    pub available_memory: Option<u64>,
}

/// Cores (node-local indices) close to the requested GRES units.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GresCoreAffinity {
    /// Cores bound to every requested GRES type
    pub all: Bitmap,
    /// Cores bound to at least one requested GRES type
    pub any: Bitmap,
}

pub trait GresAllocator {
    /// Returns the number of CPUs of the node a step may use given its GRES request.
    /// `Ok(None)` means GRES does not limit the step, `Ok(Some(0))` means the node cannot
    /// host the step.
    fn test_step_fit(&self, query: &GresFitQuery) -> Result<Option<u32>, StepError>;

    fn core_affinity(
        &self,
        job_id: JobId,
        job_node: usize,
        requests: &[GresRequest],
    ) -> Option<GresCoreAffinity>;

    fn alloc(
        &mut self,
        step_id: StepId,
        job_node: usize,
        requests: &[GresRequest],
    ) -> Result<(), StepError>;

    fn dealloc(&mut self, step_id: StepId, job_node: usize, requests: &[GresRequest]);

    /// Total number of units currently allocated to steps of the job.
    fn in_use(&self, _job_id: JobId) -> u64 {
        0
    }

    /// A node was removed from the job, indices above `removed_job_node` shift down.
    fn job_resized(&mut self, _job_id: JobId, _removed_job_node: usize) {}

    fn job_finished(&mut self, _job_id: JobId) {}
}

/// Allocator for clusters without generic resources; any GRES request is invalid.
#[derive(Debug, Default)]
pub struct NoGres;

impl GresAllocator for NoGres {
    fn test_step_fit(&self, query: &GresFitQuery) -> Result<Option<u32>, StepError> {
        match query.requests.first() {
            None => Ok(None),
            Some(rq) => Err(StepError::InvalidGres(rq.name.clone())),
        }
    }

    fn core_affinity(&self, _: JobId, _: usize, _: &[GresRequest]) -> Option<GresCoreAffinity> {
        None
    }

    fn alloc(&mut self, _: StepId, _: usize, requests: &[GresRequest]) -> Result<(), StepError> {
        match requests.first() {
            None => Ok(()),
            Some(rq) => Err(StepError::InvalidGres(rq.name.clone())),
        }
    }

    fn dealloc(&mut self, _: StepId, _: usize, _: &[GresRequest]) {}
}

#[derive(Debug, Clone, Default)]
struct NodeGres {
    total: u64,
    used: u64,
    cores: Option<Bitmap>,
}

/// Counting GRES allocator: every job owns a number of units of each type per node,
/// optionally bound to a set of cores.
#[derive(Debug, Default)]
pub struct GresTable {
    jobs: Map<JobId, Map<String, Vec<NodeGres>>>,
    step_allocs: Map<(StepId, usize), Vec<(String, u64)>>,
}

impl GresTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `per_node[i]` units of `name` on the i-th node of the job.
    pub fn add_job_gres(
        &mut self,
        job_id: JobId,
        name: &str,
        per_node: Vec<u64>,
        cores: Option<Vec<Bitmap>>,
    ) {
        let mut cores = cores.map(|c| c.into_iter());
        let nodes = per_node
            .into_iter()
            .map(|total| NodeGres {
                total,
                used: 0,
                cores: cores.as_mut().and_then(|c| c.next()),
            })
            .collect();
        self.jobs
            .entry(job_id)
            .or_default()
            .insert(name.to_string(), nodes);
    }

    pub fn used(&self, job_id: JobId, name: &str, job_node: usize) -> Option<u64> {
        self.node_gres(job_id, name, job_node).map(|n| n.used)
    }

    fn node_gres(&self, job_id: JobId, name: &str, job_node: usize) -> Option<&NodeGres> {
        self.jobs.get(&job_id)?.get(name)?.get(job_node)
    }
}

impl GresAllocator for GresTable {
    fn test_step_fit(&self, query: &GresFitQuery) -> Result<Option<u32>, StepError> {
        let mut cpu_limit: Option<u32> = None;
        for rq in query.requests {
            let node = self
                .node_gres(query.job_id, &rq.name, query.job_node)
                .ok_or_else(|| StepError::InvalidGres(rq.name.clone()))?;
            let mut usable = if query.ignore_existing {
                node.total
            } else {
                node.total.saturating_sub(node.used)
            };
            if let (Some(mem_per_gres), Some(memory)) = (rq.mem_per_gres, query.available_memory) {
                if mem_per_gres > 0 {
                    usable = usable.min(memory / mem_per_gres);
                }
            }
            if usable < rq.per_node {
                return Ok(Some(0));
            }
            if let Some(cpus_per_gres) = rq.cpus_per_gres {
                let limit = (rq.per_node * cpus_per_gres as u64).min(u32::MAX as u64) as u32;
                cpu_limit = Some(cpu_limit.map_or(limit, |c| c.min(limit)));
            }
        }
        Ok(cpu_limit)
    }

    fn core_affinity(
        &self,
        job_id: JobId,
        job_node: usize,
        requests: &[GresRequest],
    ) -> Option<GresCoreAffinity> {
        let mut all: Option<Bitmap> = None;
        let mut any: Option<Bitmap> = None;
        for rq in requests {
            let Some(cores) = self
                .node_gres(job_id, &rq.name, job_node)
                .and_then(|n| n.cores.as_ref())
            else {
                continue;
            };
            all = Some(match all {
                None => cores.clone(),
                Some(mut bitmap) => {
                    bitmap.and_with(cores);
                    bitmap
                }
            });
            any = Some(match any {
                None => cores.clone(),
                Some(mut bitmap) => {
                    bitmap.or_with(cores);
                    bitmap
                }
            });
        }
        Some(GresCoreAffinity {
            all: all?,
            any: any?,
        })
    }

    fn alloc(
        &mut self,
        step_id: StepId,
        job_node: usize,
        requests: &[GresRequest],
    ) -> Result<(), StepError> {
        if requests.is_empty() {
            return Ok(());
        }
        let job = self
            .jobs
            .get_mut(&step_id.job_id())
            .ok_or_else(|| StepError::InvalidGres(requests[0].name.clone()))?;
        for rq in requests {
            let node = job
                .get(&rq.name)
                .and_then(|n| n.get(job_node))
                .ok_or_else(|| StepError::InvalidGres(rq.name.clone()))?;
            if node.used + rq.per_node > node.total {
                return Err(StepError::GresBusy);
            }
        }
        for rq in requests {
            if let Some(node) = job.get_mut(&rq.name).and_then(|n| n.get_mut(job_node)) {
                node.used += rq.per_node;
            }
        }
        self.step_allocs.insert(
            (step_id, job_node),
            requests
                .iter()
                .map(|rq| (rq.name.clone(), rq.per_node))
                .collect(),
        );
        Ok(())
    }

    fn dealloc(&mut self, step_id: StepId, job_node: usize, _requests: &[GresRequest]) {
        let Some(allocated) = self.step_allocs.remove(&(step_id, job_node)) else {
            log::debug!("Step {step_id} holds no GRES on job node {job_node}");
            return;
        };
        if let Some(job) = self.jobs.get_mut(&step_id.job_id()) {
            for (name, count) in allocated {
                if let Some(node) = job.get_mut(&name).and_then(|n| n.get_mut(job_node)) {
                    node.used = node.used.saturating_sub(count);
                }
            }
        }
    }

    fn in_use(&self, job_id: JobId) -> u64 {
        self.jobs
            .get(&job_id)
            .map(|gres| gres.values().flatten().map(|n| n.used).sum())
            .unwrap_or(0)
    }

    fn job_resized(&mut self, job_id: JobId, removed_job_node: usize) {
        if let Some(job) = self.jobs.get_mut(&job_id) {
            for nodes in job.values_mut() {
                if removed_job_node < nodes.len() {
                    nodes.remove(removed_job_node);
                }
            }
        }
        let keys: Vec<(StepId, usize)> = self
            .step_allocs
            .keys()
            .filter(|(step_id, node)| step_id.job_id() == job_id && *node >= removed_job_node)
            .copied()
            .collect();
        let mut moved = Vec::new();
        for key in keys {
            if let Some(allocated) = self.step_allocs.remove(&key) {
                if key.1 > removed_job_node {
                    moved.push(((key.0, key.1 - 1), allocated));
                }
            }
        }
        self.step_allocs.extend(moved);
    }

    fn job_finished(&mut self, job_id: JobId) {
        self.jobs.remove(&job_id);
        self.step_allocs
            .retain(|(step_id, _), _| step_id.job_id() != job_id);
    }
}
