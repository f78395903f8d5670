use crate::scenario::{Operation, Scenario};
use anyhow::{Context, anyhow, bail};
use jobres::bitmap::Bitmap;
use jobres::job::{JobRecord, JobTable, save_state_to_file};
use jobres::plugins::{GresTable, NodeTable, NodeTopologyProvider, TopologySource};
use jobres::step::{ImplicitStep, StepError, StepManager};
use jobres::{ErrorKind, JobId, NodeIndex, StepId, format_comma_delimited};
use serde::Serialize;
use std::path::Path;

/// Outcome counts of a replayed scenario.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SimulationReport {
    pub applied: usize,
    /// Operations refused because resources were busy
    pub busy: usize,
    pub rejected: usize,
}

pub struct Simulation {
    manager: StepManager,
    jobs: JobTable,
}

impl Simulation {
    pub fn new(scenario: &Scenario) -> anyhow::Result<Self> {
        let nodes = scenario.node_table();
        let source = scenario.config.topology_source;

        let mut gres = GresTable::new();
        let mut job_nodes = Vec::with_capacity(scenario.jobs.len());
        for def in &scenario.jobs {
            let node_bitmap = nodes
                .bitmap_from_names(&def.nodes)
                .with_context(|| format!("Invalid node list of job {}", def.id))?;
            let node_count = node_bitmap.set_count();
            for gres_def in &def.gres {
                if gres_def.per_node.len() != node_count {
                    bail!(
                        "GRES {} of job {} lists {} node(s), the job has {node_count}",
                        gres_def.name,
                        def.id,
                        gres_def.per_node.len()
                    );
                }
                let cores = match &gres_def.cores {
                    Some(cores) => Some(
                        bound_cores(&nodes, source, &node_bitmap, cores)
                            .with_context(|| format!("Invalid cores of GRES {}", gres_def.name))?,
                    ),
                    None => None,
                };
                gres.add_job_gres(
                    JobId::new(def.id),
                    &gres_def.name,
                    gres_def.per_node.clone(),
                    cores,
                );
            }
            job_nodes.push(node_bitmap);
        }

        let manager =
            StepManager::new(scenario.config.clone(), Box::new(nodes)).with_gres(Box::new(gres));
        let mut jobs = JobTable::new();
        for (def, node_bitmap) in scenario.jobs.iter().zip(job_nodes) {
            let mut resources = manager.build_job_resources(&node_bitmap)?;
            for job_node in 0..resources.nhosts() as usize {
                let cpus = resources
                    .node_index(job_node)
                    .and_then(|node| manager.nodes().topology(node, source))
                    .map(|topology| topology.cpus)
                    .ok_or_else(|| anyhow!("Job {} has no topology for node {job_node}", def.id))?;
                resources.allocate_node(job_node, cpus, def.memory)?;
            }
            let mut job = JobRecord::new(JobId::new(def.id), resources);
            job.time_limit = def.time_limit;
            job.gres_enforce_bind = def.gres_enforce_bind;
            if jobs.insert(job).is_some() {
                bail!("Job {} is defined more than once", def.id);
            }
            log::debug!("Job {} allocated on {}", def.id, def.nodes.join(","));
        }
        Ok(Simulation { manager, jobs })
    }

    pub fn jobs(&self) -> &JobTable {
        &self.jobs
    }

    /// Applies operations in order. Failed operations are logged and skipped, unless `strict`
    /// is set, in which case the first failure is returned.
    pub fn run(&mut self, ops: &[Operation], strict: bool) -> anyhow::Result<SimulationReport> {
        let mut report = SimulationReport::default();
        for (index, op) in ops.iter().enumerate() {
            match self.apply(op) {
                Ok(outcome) => {
                    log::info!("#{index}: {outcome}");
                    report.applied += 1;
                }
                Err(error) if strict => {
                    return Err(error.context(format!("Operation #{index} failed")));
                }
                Err(error) => {
                    let kind = error
                        .downcast_ref::<jobres::Error>()
                        .map(|error| error.kind());
                    if kind == Some(ErrorKind::Retryable) {
                        log::warn!("#{index}: busy: {error:#}");
                        report.busy += 1;
                    } else {
                        log::warn!("#{index}: rejected: {error:#}");
                        report.rejected += 1;
                    }
                }
            }
        }
        Ok(report)
    }

    fn apply(&mut self, op: &Operation) -> anyhow::Result<String> {
        let outcome = match op {
            Operation::Create(create) => {
                let request = create.to_request()?;
                let step_id = self.manager.create_step(&mut self.jobs, request)?;
                format!("created step {step_id} on {}", self.step_nodes(step_id))
            }
            Operation::Batch { job } => {
                let step_id = self.manager.create_implicit_step(
                    &mut self.jobs,
                    JobId::new(*job),
                    ImplicitStep::Batch,
                )?;
                format!("created step {step_id} on {}", self.step_nodes(step_id))
            }
            Operation::Extern { job } => {
                let step_id = self.manager.create_implicit_step(
                    &mut self.jobs,
                    JobId::new(*job),
                    ImplicitStep::Extern,
                )?;
                format!("created step {step_id} on {}", self.step_nodes(step_id))
            }
            Operation::Complete { job, step } => {
                let step_id = step.step_id(*job);
                let callbacks = self.manager.complete_step(&mut self.jobs, step_id)?;
                with_callbacks(format!("completed step {step_id}"), &callbacks)
            }
            Operation::PartialComplete {
                job,
                step,
                first,
                last,
                exit_code,
            } => {
                let step_id = step.step_id(*job);
                let completion = self.manager.partial_complete(
                    &mut self.jobs,
                    step_id,
                    *first,
                    *last,
                    *exit_code,
                )?;
                let outcome = if completion.completed {
                    format!("step {step_id} completed on its last node(s)")
                } else {
                    format!(
                        "step {step_id} released nodes {first}-{last}, {} remaining",
                        completion.remaining
                    )
                };
                with_callbacks(outcome, &completion.callbacks)
            }
            Operation::Signal { job, step, signal } => {
                let target = self
                    .manager
                    .signal_step(&mut self.jobs, step.step_id(*job), *signal)?;
                format!(
                    "signal {} sent to step {} on {}",
                    target.signal,
                    target.step_id,
                    display_nodes(&target.nodes)
                )
            }
            Operation::TimeLimit { job, step, minutes } => {
                let count = self.manager.update_time_limit(
                    &mut self.jobs,
                    JobId::new(*job),
                    *step,
                    *minutes,
                )?;
                format!("time limit of {count} step(s) of job {job} updated")
            }
            Operation::Resize { job, node } => {
                let index = self
                    .manager
                    .nodes()
                    .find_node(node)
                    .ok_or_else(|| jobres::Error::from(StepError::InvalidNodeName(node.clone())))?;
                self.manager
                    .resize_job(&mut self.jobs, JobId::new(*job), index)?;
                format!("node {node} removed from job {job}")
            }
            Operation::Purge { job } => {
                self.manager.purge_job(&mut self.jobs, JobId::new(*job))?;
                format!("job {job} purged")
            }
        };
        Ok(outcome)
    }

    fn step_nodes(&self, step_id: StepId) -> String {
        self.jobs
            .find_job(step_id.job_id())
            .and_then(|job| job.find_step(step_id))
            .and_then(|step| step.layout.as_ref())
            .map(|layout| display_nodes(&layout.node_names))
            .unwrap_or_default()
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let version = self.manager.config().protocol_version;
        save_state_to_file(&self.jobs, version, path)
            .with_context(|| format!("Cannot save state to {}", path.display()))?;
        log::info!(
            "State of {} job(s) saved to {} (version {:#x})",
            self.jobs.len(),
            path.display(),
            version.as_num()
        );
        Ok(())
    }
}

fn display_nodes(nodes: &[String]) -> String {
    format_comma_delimited(nodes)
}

fn with_callbacks(outcome: String, callbacks: &[String]) -> String {
    if callbacks.is_empty() {
        outcome
    } else {
        format!("{outcome}; may retry: {}", format_comma_delimited(callbacks))
    }
}

/// Converts node-local core lists into one bitmap per job node.
fn bound_cores(
    nodes: &NodeTable,
    source: TopologySource,
    node_bitmap: &Bitmap,
    cores: &[Vec<usize>],
) -> anyhow::Result<Vec<Bitmap>> {
    if cores.len() != node_bitmap.set_count() {
        bail!(
            "{} core list(s) given for {} node(s)",
            cores.len(),
            node_bitmap.set_count()
        );
    }
    node_bitmap
        .ones()
        .zip(cores)
        .map(|(node, cores)| -> anyhow::Result<Bitmap> {
            let size = nodes
                .topology(NodeIndex::new(node as u32), source)
                .map(|topology| topology.total_cores() as usize)
                .ok_or_else(|| anyhow!("Node {node} has no topology"))?;
            if let Some(core) = cores.iter().find(|core| **core >= size) {
                bail!("Core {core} is outside of a node with {size} core(s)");
            }
            Ok(Bitmap::from_indices(size, cores.iter().copied()))
        })
        .collect()
}
