use anyhow::{Context, anyhow, bail};
use jobres::config::StepMgrConfig;
use jobres::plugins::{GresRequest, NodeRecord, NodeTable, NodeTopology};
use jobres::step::{MemoryRequest, StepFlags, StepRequest, StepRequestBuilder, TaskDistribution};
use jobres::{BATCH_STEP, EXTERN_STEP, INTERACTIVE_STEP, JobId, PENDING_STEP, StepId};
use serde::Deserialize;
use std::path::Path;

/// Cluster, jobs and a list of step operations replayed against them.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Scenario {
    #[serde(default)]
    pub config: StepMgrConfig,
    pub nodes: Vec<NodeDef>,
    #[serde(default)]
    pub jobs: Vec<JobDef>,
    #[serde(default)]
    pub ops: Vec<Operation>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeDef {
    pub name: String,
    pub sockets: u16,
    pub cores: u16,
    #[serde(default = "default_threads")]
    pub threads: u16,
    /// MB
    pub memory: u64,
    /// Layout reported by the node itself, when it differs from the configured one
    #[serde(default)]
    pub live: Option<LiveTopology>,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub down: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LiveTopology {
    pub sockets: u16,
    pub cores: u16,
    #[serde(default = "default_threads")]
    pub threads: u16,
}

fn default_threads() -> u16 {
    1
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobDef {
    pub id: u32,
    pub nodes: Vec<String>,
    /// MB allocated on every node
    pub memory: u64,
    #[serde(default)]
    pub time_limit: Option<u32>,
    #[serde(default)]
    pub gres_enforce_bind: bool,
    #[serde(default)]
    pub gres: Vec<JobGresDef>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobGresDef {
    pub name: String,
    /// Units on each job node
    pub per_node: Vec<u64>,
    /// Node-local cores the units of each job node are bound to
    #[serde(default)]
    pub cores: Option<Vec<Vec<usize>>>,
}

/// Step number or one of the reserved names.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(untagged)]
pub enum StepRef {
    Number(u32),
    Name(ReservedStep),
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReservedStep {
    Batch,
    Extern,
    Interactive,
    Pending,
}

impl StepRef {
    pub fn step_id(self, job: u32) -> StepId {
        let number = match self {
            StepRef::Number(number) => number,
            StepRef::Name(ReservedStep::Batch) => BATCH_STEP,
            StepRef::Name(ReservedStep::Extern) => EXTERN_STEP,
            StepRef::Name(ReservedStep::Interactive) => INTERACTIVE_STEP,
            StepRef::Name(ReservedStep::Pending) => PENDING_STEP,
        };
        StepId::new(JobId::new(job), number)
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", deny_unknown_fields)]
pub enum Operation {
    Create(CreateDef),
    Batch {
        job: u32,
    },
    Extern {
        job: u32,
    },
    Complete {
        job: u32,
        step: StepRef,
    },
    PartialComplete {
        job: u32,
        step: StepRef,
        first: u32,
        last: u32,
        #[serde(default)]
        exit_code: i32,
    },
    Signal {
        job: u32,
        step: StepRef,
        signal: i32,
    },
    TimeLimit {
        job: u32,
        #[serde(default)]
        step: Option<u32>,
        #[serde(default)]
        minutes: Option<u32>,
    },
    Resize {
        job: u32,
        node: String,
    },
    Purge {
        job: u32,
    },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateDef {
    pub job: u32,
    #[serde(default)]
    pub step: Option<u32>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub tasks: Option<u32>,
    #[serde(default)]
    pub cpus: Option<u32>,
    #[serde(default)]
    pub cpus_per_task: Option<u16>,
    #[serde(default)]
    pub min_nodes: Option<u32>,
    #[serde(default)]
    pub max_nodes: Option<u32>,
    #[serde(default)]
    pub mem_per_node: Option<u64>,
    #[serde(default)]
    pub mem_per_cpu: Option<u64>,
    #[serde(default)]
    pub gres: Vec<GresRequest>,
    /// Names of `StepFlags`, case insensitive
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub nodes: Option<Vec<String>>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub relative: Option<u32>,
    #[serde(default)]
    pub distribution: Option<TaskDistribution>,
    #[serde(default)]
    pub threads_per_core: Option<u16>,
    #[serde(default)]
    pub time_limit: Option<u32>,
    #[serde(default)]
    pub callback: Option<String>,
}

fn parse_flags(names: &[String]) -> anyhow::Result<StepFlags> {
    names.iter().try_fold(StepFlags::empty(), |flags, name| {
        StepFlags::from_name(&name.to_uppercase())
            .map(|flag| flags | flag)
            .ok_or_else(|| anyhow!("Unknown step flag '{name}'"))
    })
}

impl CreateDef {
    pub fn to_request(&self) -> anyhow::Result<StepRequest> {
        let memory = match (self.mem_per_node, self.mem_per_cpu) {
            (Some(_), Some(_)) => bail!("mem_per_node and mem_per_cpu are mutually exclusive"),
            (Some(memory), None) => MemoryRequest::PerNode(memory),
            (None, Some(memory)) => MemoryRequest::PerCpu(memory),
            (None, None) => MemoryRequest::None,
        };
        let mut builder = StepRequestBuilder::default()
            .job_id(JobId::new(self.job))
            .memory(memory)
            .gres(self.gres.clone())
            .flags(parse_flags(&self.flags)?)
            .exclude(self.exclude.clone())
            .features(self.features.clone())
            .distribution(self.distribution.unwrap_or_default());
        if let Some(step) = self.step {
            builder = builder.step_id(step);
        }
        if let Some(name) = &self.name {
            builder = builder.name(name.as_str());
        }
        if let Some(tasks) = self.tasks {
            builder = builder.num_tasks(tasks);
        }
        if let Some(cpus) = self.cpus {
            builder = builder.cpu_count(cpus);
        }
        if let Some(cpus_per_task) = self.cpus_per_task {
            builder = builder.cpus_per_task(cpus_per_task);
        }
        if let Some(min_nodes) = self.min_nodes {
            builder = builder.min_nodes(min_nodes);
        }
        if let Some(max_nodes) = self.max_nodes {
            builder = builder.max_nodes(max_nodes);
        }
        if let Some(nodes) = &self.nodes {
            builder = builder.node_list(nodes.clone());
        }
        if let Some(relative) = self.relative {
            builder = builder.relative(relative);
        }
        if let Some(threads_per_core) = self.threads_per_core {
            builder = builder.threads_per_core(threads_per_core);
        }
        if let Some(time_limit) = self.time_limit {
            builder = builder.time_limit(time_limit);
        }
        if let Some(callback) = &self.callback {
            builder = builder.callback(callback.as_str());
        }
        Ok(builder.build()?)
    }
}

impl Scenario {
    pub fn parse(content: &str) -> anyhow::Result<Scenario> {
        let scenario: Scenario = toml::from_str(content)?;
        if scenario.nodes.is_empty() {
            bail!("Scenario defines no nodes");
        }
        Ok(scenario)
    }

    pub fn load(path: &Path) -> anyhow::Result<Scenario> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot read scenario {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid scenario {}", path.display()))
    }

    pub fn node_table(&self) -> NodeTable {
        NodeTable::new(
            self.nodes
                .iter()
                .map(|def| {
                    let mut record = NodeRecord::new(
                        def.name.clone(),
                        NodeTopology::new(def.sockets, def.cores, def.threads, def.memory),
                    );
                    record.live = def.live.as_ref().map(|live| {
                        NodeTopology::new(live.sockets, live.cores, live.threads, def.memory)
                    });
                    record.features = def.features.clone();
                    record.down = def.down;
                    record
                })
                .collect(),
        )
    }
}
