use crate::internal::common::bitmap::Bitmap;
use crate::internal::common::config::StepMgrConfig;
use crate::internal::common::ids::NodeIndex;
use crate::internal::job::record::JobRecord;
use crate::internal::plugins::gres::{GresAllocator, GresFitQuery};
use crate::internal::plugins::topology::NodeTopologyProvider;
use crate::internal::resources::jobres::JobResources;
use crate::internal::step::cores::{CorePick, pick_node_cores};
use crate::internal::step::error::StepError;
use crate::internal::step::layout::{TaskPlacement, arbitrary_placement, distribute_tasks};
use crate::internal::step::request::{
    MemoryRequest, StepFlags, StepRequest, StepSpec, TaskDistribution,
};

pub(crate) struct PickContext<'a> {
    pub nodes: &'a dyn NodeTopologyProvider,
    pub gres: &'a dyn GresAllocator,
    pub config: &'a StepMgrConfig,
}

/// Nodes, CPUs, memory and cores proposed for a step. Nothing is committed yet.
#[derive(Debug, Clone)]
pub(crate) struct StepPick {
    /// Global node bitmap of the step
    pub node_bitmap: Bitmap,
    pub cpus: Vec<u16>,
    pub memory: Vec<u64>,
    /// Cores in the job's core bit space
    pub core_bitmap: Bitmap,
    pub placement: TaskPlacement,
    pub spec: StepSpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Limit {
    Cpus,
    Memory,
    Gres,
    Threads,
}

#[derive(Debug, Clone)]
struct Candidate {
    job_node: usize,
    node: NodeIndex,
    /// CPUs the step may use right now
    cpus_now: u32,
    /// CPUs the step could use once all other steps are gone
    cpus_ever: u32,
    limit_now: Limit,
    limit_ever: Limit,
    /// A regular step runs on the node
    busy: bool,
    /// The request is exclusive and another step holds the node
    held: bool,
    required: bool,
}

fn cap(cpus: &mut u32, limit: &mut Limit, value: u32, reason: Limit) {
    if value < *cpus {
        *cpus = value;
        *limit = reason;
    }
}

/// Number of tasks that fit into `cpus`.
fn task_slots(cpus: u32, cpus_per_task: u32, overcommit: bool) -> u32 {
    let slots = cpus / cpus_per_task;
    if overcommit && cpus > 0 {
        slots.max(1)
    } else {
        slots
    }
}

fn permanent_error<'a>(
    candidates: impl Iterator<Item = &'a Candidate>,
    request: &StepRequest,
    fallback: StepError,
) -> StepError {
    let limits: Vec<Limit> = candidates.map(|c| c.limit_ever).collect();
    if limits.contains(&Limit::Threads) {
        StepError::BadThreadPerCore
    } else if limits.contains(&Limit::Memory) {
        StepError::InvalidTaskMemory
    } else if limits.contains(&Limit::Gres) {
        StepError::InvalidGres(
            request
                .gres
                .iter()
                .map(|g| format!("{}:{}", g.name, g.per_node))
                .collect::<Vec<_>>()
                .join(","),
        )
    } else {
        fallback
    }
}

fn busy_error<'a>(candidates: impl Iterator<Item = &'a Candidate>) -> StepError {
    let limits: Vec<Limit> = candidates.map(|c| c.limit_now).collect();
    if limits.contains(&Limit::Memory) {
        StepError::MemoryBusy
    } else if limits.contains(&Limit::Gres) {
        StepError::GresBusy
    } else {
        StepError::NodesBusy
    }
}

fn node_capacity(
    job: &JobRecord,
    resources: &JobResources,
    request: &StepRequest,
    spec: &StepSpec,
    job_node: usize,
    required: bool,
    ctx: &PickContext,
) -> Result<Candidate, StepError> {
    let force = request.has_flag(StepFlags::OVERLAP_FORCE);
    let node = resources.node_indices()[job_node];
    let total = resources.cpus[job_node] as u32;
    let mut c = Candidate {
        job_node,
        node,
        cpus_now: if force {
            total
        } else {
            total.saturating_sub(resources.cpus_used[job_node] as u32)
        },
        cpus_ever: total,
        limit_now: Limit::Cpus,
        limit_ever: Limit::Cpus,
        busy: job.node_has_running_step(node),
        held: request.has_flag(StepFlags::EXCLUSIVE) && !force && resources.node_in_use(job_node),
        required,
    };
    if c.held {
        c.cpus_now = 0;
    }

    if let Some(threads_per_core) = request.threads_per_core {
        let threads = ctx
            .nodes
            .topology(node, ctx.config.topology_source)
            .map(|t| t.threads)
            .unwrap_or(1);
        if threads_per_core > threads {
            cap(&mut c.cpus_now, &mut c.limit_now, 0, Limit::Threads);
            cap(&mut c.cpus_ever, &mut c.limit_ever, 0, Limit::Threads);
        }
    }

    let cpus_per_task = spec.cpus_per_task as u64;
    let track_memory =
        ctx.config.track_memory && !request.has_flag(StepFlags::MEM_ZERO);
    let memory_ever = resources.memory_allocated[job_node];
    let memory_now = if force {
        memory_ever
    } else {
        memory_ever.saturating_sub(resources.memory_used[job_node])
    };
    if track_memory {
        match request.memory {
            MemoryRequest::None => {}
            MemoryRequest::PerNode(memory) => {
                if memory > memory_now {
                    cap(&mut c.cpus_now, &mut c.limit_now, 0, Limit::Memory);
                }
                if memory > memory_ever {
                    cap(&mut c.cpus_ever, &mut c.limit_ever, 0, Limit::Memory);
                }
            }
            MemoryRequest::PerCpu(memory) => {
                let per_task = memory.saturating_mul(cpus_per_task);
                if per_task > 0 {
                    let cpus = |available: u64| {
                        ((available / per_task).saturating_mul(cpus_per_task)).min(u32::MAX as u64)
                            as u32
                    };
                    cap(&mut c.cpus_now, &mut c.limit_now, cpus(memory_now), Limit::Memory);
                    cap(&mut c.cpus_ever, &mut c.limit_ever, cpus(memory_ever), Limit::Memory);
                }
            }
        }
    }

    if !request.gres.is_empty() {
        let query = |ignore_existing: bool, memory: u64| GresFitQuery {
            job_id: job.job_id,
            job_node,
            requests: &request.gres,
            ignore_existing,
            available_memory: track_memory.then_some(memory),
        };
        if let Some(cpus) = ctx.gres.test_step_fit(&query(force, memory_now))? {
            cap(&mut c.cpus_now, &mut c.limit_now, cpus, Limit::Gres);
        }
        if let Some(cpus) = ctx.gres.test_step_fit(&query(true, memory_ever))? {
            cap(&mut c.cpus_ever, &mut c.limit_ever, cpus, Limit::Gres);
        }
    }
    Ok(c)
}

/// Greedy node selection: required nodes, then the given order, until the node, task and
/// CPU targets are met or `max_nodes` is reached.
fn select<'a>(
    ordered: &[&'a Candidate],
    slots: impl Fn(&Candidate) -> u32,
    cpus: impl Fn(&Candidate) -> u32,
    spec: &StepSpec,
    min_nodes: usize,
    max_nodes: usize,
) -> (Vec<&'a Candidate>, bool) {
    let mut chosen = Vec::new();
    let mut tasks = 0;
    let mut cpu_total = 0;
    let satisfied = |count: usize, tasks: u32, cpu_total: u32| {
        count >= min_nodes && tasks >= spec.num_tasks && cpu_total >= spec.cpu_count
    };
    for &c in ordered {
        if chosen.len() >= max_nodes {
            break;
        }
        if !c.required && (satisfied(chosen.len(), tasks, cpu_total) || slots(c) == 0) {
            continue;
        }
        chosen.push(c);
        tasks += slots(c);
        cpu_total += cpus(c);
    }
    let ok = satisfied(chosen.len(), tasks, cpu_total);
    (chosen, ok)
}

/// Proposes nodes and cores for a step inside the job's allocation.
pub(crate) fn pick_step(
    job: &JobRecord,
    request: &StepRequest,
    spec: &StepSpec,
    ctx: &PickContext,
) -> Result<StepPick, StepError> {
    let resources = job
        .resources()
        .ok_or(StepError::JobNotRunning(job.job_id))?;
    if !resources.has_node_bitmap() {
        log::error!(
            "Job {} has resources without node indices, cannot place steps",
            job.job_id
        );
        return Err(StepError::NodeConfigUnavailable);
    }
    let nhosts = resources.nhosts() as usize;
    let cpus_per_task = spec.cpus_per_task as u32;
    let overcommit = request.has_flag(StepFlags::OVERCOMMIT);
    let arbitrary = request.distribution == TaskDistribution::Arbitrary;

    let mut eligible: Vec<bool> = resources
        .node_indices()
        .iter()
        .map(|node| {
            ctx.nodes.is_up(*node)
                && (request.features.is_empty() || ctx.nodes.has_features(*node, &request.features))
        })
        .collect();
    for name in &request.exclude {
        let node = ctx
            .nodes
            .find_node(name)
            .ok_or_else(|| StepError::InvalidNodeName(name.clone()))?;
        if let Some(job_node) = resources.job_node_index(node) {
            eligible[job_node] = false;
        }
    }
    if let Some(relative) = request.relative {
        if relative as usize >= nhosts {
            return Err(StepError::InvalidRelative(relative));
        }
        eligible[..relative as usize].fill(false);
    }

    let mut required: Vec<usize> = Vec::new();
    let mut task_nodes: Vec<usize> = Vec::new();
    if let Some(names) = &request.node_list {
        for name in names {
            let node = ctx
                .nodes
                .find_node(name)
                .ok_or_else(|| StepError::InvalidNodeName(name.clone()))?;
            let job_node = resources
                .job_node_index(node)
                .ok_or_else(|| StepError::NodeNotInJob(name.clone()))?;
            task_nodes.push(job_node);
            if !required.contains(&job_node) {
                required.push(job_node);
            }
        }
        required.sort_unstable();
        if required.len() > spec.max_nodes as usize {
            return Err(StepError::InvalidNodeCount);
        }
        if required.iter().any(|job_node| !eligible[*job_node]) {
            return Err(StepError::NodeConfigUnavailable);
        }
    }
    let (min_nodes, max_nodes) = if arbitrary {
        if required.len() < spec.min_nodes as usize {
            return Err(StepError::InvalidNodeCount);
        }
        (required.len(), required.len())
    } else {
        (spec.min_nodes as usize, spec.max_nodes as usize)
    };

    let candidates = (0..nhosts)
        .filter(|job_node| eligible[*job_node])
        .map(|job_node| {
            node_capacity(
                job,
                resources,
                request,
                spec,
                job_node,
                required.contains(&job_node),
                ctx,
            )
        })
        .collect::<Result<Vec<Candidate>, StepError>>()?;

    let slots_ever = |c: &Candidate| task_slots(c.cpus_ever, cpus_per_task, overcommit);
    let slots_now = |c: &Candidate| task_slots(c.cpus_now, cpus_per_task, false);

    // Can the request ever be satisfied by this job?
    if let Some(c) = candidates
        .iter()
        .find(|c| c.required && slots_ever(c) == 0)
    {
        return Err(permanent_error(
            std::iter::once(c),
            request,
            StepError::NodeConfigUnavailable,
        ));
    }
    let mut hostable: Vec<&Candidate> = candidates.iter().filter(|c| slots_ever(c) > 0).collect();
    if hostable.len() < min_nodes {
        return Err(permanent_error(
            candidates.iter().filter(|c| slots_ever(c) == 0),
            request,
            StepError::NodeConfigUnavailable,
        ));
    }
    hostable.sort_by_key(|c| (!c.required, std::cmp::Reverse(c.cpus_ever), c.job_node));
    let best = &hostable[..max_nodes.min(hostable.len())];
    let tasks_ever: u32 = best.iter().map(|c| slots_ever(c)).sum();
    let cpus_ever: u32 = best.iter().map(|c| c.cpus_ever).sum();
    if !overcommit && (tasks_ever < spec.num_tasks || cpus_ever < spec.cpu_count) {
        return Err(permanent_error(
            candidates.iter(),
            request,
            StepError::TooManyCpus,
        ));
    }

    // Named nodes must have room now. Overcommit may only pile CPUs onto them.
    if let Some(c) = candidates.iter().find(|c| {
        c.required && (c.held || (!overcommit && !arbitrary && slots_now(c) == 0))
    }) {
        let error = busy_error(std::iter::once(c));
        log::debug!(
            "Step of job {} cannot start yet on job node {}: {error}",
            job.job_id,
            c.job_node
        );
        return Err(error);
    }

    // Required nodes first, then idle nodes, busy nodes last.
    let mut ordered: Vec<&Candidate> = candidates.iter().collect();
    ordered.sort_by_key(|c| (!c.required, c.busy, c.job_node));
    let (mut chosen, ok) = if arbitrary {
        let chosen: Vec<&Candidate> = ordered.iter().filter(|c| c.required).copied().collect();
        let ok = chosen.iter().all(|c| {
            let tasks = task_nodes.iter().filter(|n| **n == c.job_node).count() as u32;
            tasks * cpus_per_task <= c.cpus_now
        });
        (chosen, ok)
    } else {
        select(
            &ordered,
            slots_now,
            |c| c.cpus_now,
            spec,
            min_nodes,
            max_nodes,
        )
    };
    let mut oversubscribed = false;
    if !ok {
        if !overcommit {
            let error = busy_error(candidates.iter().filter(|c| c.cpus_now < c.cpus_ever));
            log::debug!("Step of job {} cannot start yet: {error}", job.job_id);
            return Err(error);
        }
        if !arbitrary {
            let ordered: Vec<&Candidate> = ordered
                .iter()
                .filter(|c| slots_ever(c) > 0 && !c.held)
                .copied()
                .collect();
            chosen = select(&ordered, slots_ever, |c| c.cpus_ever, spec, min_nodes, max_nodes).0;
            if chosen.len() < min_nodes {
                return Err(StepError::NodesBusy);
            }
        }
        oversubscribed = true;
    }
    chosen.sort_by_key(|c| c.job_node);

    let placement = if arbitrary {
        let positions: Vec<usize> = task_nodes
            .iter()
            .map(|job_node| chosen.iter().position(|c| c.job_node == *job_node).unwrap_or(0))
            .collect();
        arbitrary_placement(&positions, chosen.len())
    } else {
        let capacities: Vec<u32> = chosen
            .iter()
            .map(|c| {
                if oversubscribed {
                    slots_ever(c)
                } else {
                    slots_now(c)
                }
            })
            .collect();
        distribute_tasks(
            spec.num_tasks,
            &capacities,
            request.distribution,
            overcommit,
        )?
    };

    let whole = request.has_flag(StepFlags::WHOLE);
    let mut cpus: Vec<u32> = chosen
        .iter()
        .zip(&placement.tasks)
        .map(|(c, tasks)| {
            let claim = *tasks as u32 * cpus_per_task;
            let claim = if whole { claim.max(c.cpus_now) } else { claim };
            claim.min(resources.cpus[c.job_node] as u32)
        })
        .collect();
    // CPUs asked for beyond the task CPUs come only from free CPUs, so an oversubscribed
    // step is capped at its task CPUs.
    let mut extra = spec.cpu_count.saturating_sub(cpus.iter().sum());
    for (claim, c) in cpus.iter_mut().zip(&chosen) {
        let add = extra.min(c.cpus_now.saturating_sub(*claim));
        *claim += add;
        extra -= add;
    }
    if extra > 0 {
        log::debug!(
            "Step of job {} gets {extra} CPU(s) less than the {} requested",
            job.job_id,
            spec.cpu_count
        );
    }

    if ctx.config.track_memory
        && !request.has_flag(StepFlags::MEM_ZERO)
        && !request.has_flag(StepFlags::OVERLAP_FORCE)
    {
        for (claim, c) in cpus.iter().zip(&chosen) {
            let memory = request.memory.on_node(*claim);
            let allocated = resources.memory_allocated[c.job_node];
            if memory > allocated {
                return Err(StepError::InvalidTaskMemory);
            }
            if memory > allocated.saturating_sub(resources.memory_used[c.job_node]) {
                log::debug!(
                    "Step of job {} needs {memory} MB on job node {}, memory is busy",
                    job.job_id,
                    c.job_node
                );
                return Err(StepError::MemoryBusy);
            }
        }
    }

    let mut core_bitmap = Bitmap::new(resources.core_bitmap.size());
    for (claim, c) in cpus.iter().zip(&chosen) {
        let allocated_cores = resources.count_node_cores(c.job_node);
        if allocated_cores == 0 {
            continue;
        }
        let mut cpus_per_core = (resources.cpus[c.job_node] as usize / allocated_cores).max(1);
        if let Some(threads_per_core) = request.threads_per_core {
            cpus_per_core = cpus_per_core.min(threads_per_core as usize);
        }
        let cores_needed = (*claim as usize)
            .div_ceil(cpus_per_core)
            .min(allocated_cores);
        let affinity = if request.gres.is_empty() {
            None
        } else {
            ctx.gres
                .core_affinity(job.job_id, c.job_node, &request.gres)
        };
        pick_node_cores(
            resources,
            &CorePick {
                job_node: c.job_node,
                cores_needed,
                distribution: request.distribution,
                affinity: affinity.as_ref(),
                strict_binding: job.gres_enforce_bind,
                oversubscribe: overcommit,
                ignore_used: request.has_flag(StepFlags::OVERLAP_FORCE),
            },
            &mut core_bitmap,
        )?;
    }

    let track_memory = !request.has_flag(StepFlags::MEM_ZERO);
    let memory = cpus
        .iter()
        .map(|claim| {
            if track_memory {
                request.memory.on_node(*claim)
            } else {
                0
            }
        })
        .collect();
    let node_bitmap = Bitmap::from_indices(
        resources.node_bitmap().size(),
        chosen.iter().map(|c| c.node.as_num() as usize),
    );
    let cpus = cpus
        .into_iter()
        .map(|c| u16::try_from(c).unwrap_or(u16::MAX))
        .collect();
    Ok(StepPick {
        node_bitmap,
        cpus,
        memory,
        core_bitmap,
        placement,
        spec: *spec,
    })
}
