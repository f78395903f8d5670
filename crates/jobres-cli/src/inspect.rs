use jobres::job::{JobRecord, JobState, JobTable};
use jobres::step::{StepRecord, StepState};
use jobres::format_comma_delimited;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct JobSummary {
    pub job_id: u32,
    pub state: &'static str,
    pub time_limit: Option<u32>,
    pub nodes: Vec<NodeUsage>,
    pub steps: Vec<StepSummary>,
}

/// Claims on one node of a job.
#[derive(Debug, Serialize)]
pub struct NodeUsage {
    /// Global node index, missing for resource maps without a node bitmap
    pub node: Option<u32>,
    pub cpus: u16,
    pub cpus_used: u16,
    pub memory: u64,
    pub memory_used: u64,
    pub cores: usize,
    pub cores_used: usize,
}

#[derive(Debug, Serialize)]
pub struct StepSummary {
    pub step_id: String,
    pub name: String,
    pub state: &'static str,
    pub tasks: u32,
    pub nodes: Vec<String>,
    pub cpus: Vec<u16>,
    pub memory: Vec<u64>,
    pub exit_code: Option<i32>,
    pub time_limit: Option<u32>,
}

fn job_state_name(state: JobState) -> &'static str {
    match state {
        JobState::Running => "running",
        JobState::Suspended => "suspended",
        JobState::Completing => "completing",
    }
}

fn step_state_name(state: StepState) -> &'static str {
    match state {
        StepState::Pending => "pending",
        StepState::Running => "running",
        StepState::Completing => "completing",
    }
}

fn summarize_step(step: &StepRecord) -> StepSummary {
    StepSummary {
        step_id: step.id.to_string(),
        name: step.name.clone(),
        state: step_state_name(step.state),
        tasks: step.num_tasks,
        nodes: step
            .layout
            .as_ref()
            .map(|layout| layout.node_names.clone())
            .unwrap_or_default(),
        cpus: step.cpus_alloc.clone(),
        memory: step.memory_allocated.clone(),
        exit_code: step.exit_code,
        time_limit: step.time_limit,
    }
}

pub fn summarize_job(job: &JobRecord) -> JobSummary {
    let nodes = job
        .resources()
        .map(|resources| {
            (0..resources.nhosts() as usize)
                .map(|job_node| {
                    let (cores, cores_used) = resources
                        .node_core_range(job_node)
                        .map(|range| {
                            (
                                resources.core_bitmap().count_range(range.clone()),
                                resources.core_bitmap_used().count_range(range),
                            )
                        })
                        .unwrap_or_default();
                    NodeUsage {
                        node: resources.node_index(job_node).map(|node| node.as_num()),
                        cpus: resources.cpus()[job_node],
                        cpus_used: resources.cpus_used()[job_node],
                        memory: resources.memory_allocated()[job_node],
                        memory_used: resources.memory_used()[job_node],
                        cores,
                        cores_used,
                    }
                })
                .collect()
        })
        .unwrap_or_default();
    JobSummary {
        job_id: job.job_id.as_num(),
        state: job_state_name(job.state),
        time_limit: job.time_limit,
        nodes,
        steps: job.steps().iter().map(summarize_step).collect(),
    }
}

pub fn summarize_jobs(jobs: &JobTable) -> Vec<JobSummary> {
    jobs.sorted_jobs().into_iter().map(summarize_job).collect()
}

fn display_optional<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

pub fn print_jobs(jobs: &[JobSummary], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(jobs)?);
        return Ok(());
    }
    for job in jobs {
        println!(
            "Job {} ({}), {} node(s), time limit {}",
            job.job_id,
            job.state,
            job.nodes.len(),
            display_optional(job.time_limit)
        );
        for (job_node, usage) in job.nodes.iter().enumerate() {
            println!(
                "  node #{job_node} [{}]: cpus {}/{}, memory {}/{} MB, cores {}/{}",
                display_optional(usage.node),
                usage.cpus_used,
                usage.cpus,
                usage.memory_used,
                usage.memory,
                usage.cores_used,
                usage.cores
            );
        }
        for step in &job.steps {
            println!(
                "  step {} {:?} ({}): {} task(s) on {}, cpus {}, exit code {}",
                step.step_id,
                step.name,
                step.state,
                step.tasks,
                format_comma_delimited(&step.nodes),
                format_comma_delimited(&step.cpus),
                display_optional(step.exit_code)
            );
        }
    }
    Ok(())
}
