use crate::internal::common::Map;
use crate::internal::common::bitmap::Bitmap;
use crate::internal::common::ids::NodeIndex;
use crate::internal::step::error::StepError;
use serde::{Deserialize, Serialize};

/// Which view of a node's hardware is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopologySource {
    /// The administrator-configured layout
    #[default]
    Configured,
    /// The layout reported by the running node daemon
    Live,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTopology {
    pub sockets: u16,
    pub cores: u16,
    pub threads: u16,
    pub cpus: u16,
    /// Memory in MB
    pub real_memory: u64,
}

impl NodeTopology {
    pub fn new(sockets: u16, cores: u16, threads: u16, real_memory: u64) -> Self {
        NodeTopology {
            sockets,
            cores,
            threads,
            cpus: sockets * cores * threads,
            real_memory,
        }
    }

    #[inline]
    pub fn total_cores(&self) -> u32 {
        self.sockets as u32 * self.cores as u32
    }
}

/// Read access to the cluster's node table.
pub trait NodeTopologyProvider {
    fn node_count(&self) -> usize;

    fn node_name(&self, node: NodeIndex) -> Option<&str>;

    fn find_node(&self, name: &str) -> Option<NodeIndex>;

    fn topology(&self, node: NodeIndex, source: TopologySource) -> Option<NodeTopology>;

    fn is_up(&self, node: NodeIndex) -> bool;

    /// Returns true if the node has every feature in `features`.
    fn has_features(&self, node: NodeIndex, features: &[String]) -> bool;

    fn lookup(&self, name: &str, source: TopologySource) -> Option<NodeTopology> {
        self.find_node(name)
            .and_then(|node| self.topology(node, source))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub name: String,
    pub config: NodeTopology,
    #[serde(default)]
    pub live: Option<NodeTopology>,
    #[serde(default)]
    pub down: bool,
    #[serde(default)]
    pub features: Vec<String>,
}

impl NodeRecord {
    pub fn new(name: impl Into<String>, config: NodeTopology) -> Self {
        NodeRecord {
            name: name.into(),
            config,
            live: None,
            down: false,
            features: Vec::new(),
        }
    }
}

/// Static in-memory node table.
#[derive(Debug, Default, Clone)]
pub struct NodeTable {
    nodes: Vec<NodeRecord>,
    by_name: Map<String, NodeIndex>,
}

impl NodeTable {
    pub fn new(nodes: Vec<NodeRecord>) -> Self {
        let by_name = nodes
            .iter()
            .enumerate()
            .map(|(index, node)| (node.name.clone(), NodeIndex::new(index as u32)))
            .collect();
        NodeTable { nodes, by_name }
    }

    pub fn get_node(&self, node: NodeIndex) -> Option<&NodeRecord> {
        self.nodes.get(node.as_num() as usize)
    }

    pub fn get_node_mut(&mut self, node: NodeIndex) -> Option<&mut NodeRecord> {
        self.nodes.get_mut(node.as_num() as usize)
    }

    pub fn set_down(&mut self, node: NodeIndex, down: bool) {
        if let Some(record) = self.get_node_mut(node) {
            record.down = down;
        }
    }

    /// Builds a bitmap over the whole table from node names.
    pub fn bitmap_from_names<S: AsRef<str>>(&self, names: &[S]) -> Result<Bitmap, StepError> {
        let mut bitmap = Bitmap::new(self.nodes.len());
        for name in names {
            let node = self
                .find_node(name.as_ref())
                .ok_or_else(|| StepError::InvalidNodeName(name.as_ref().to_string()))?;
            bitmap.set(node.as_num() as usize);
        }
        Ok(bitmap)
    }
}

impl NodeTopologyProvider for NodeTable {
    fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn node_name(&self, node: NodeIndex) -> Option<&str> {
        self.get_node(node).map(|n| n.name.as_str())
    }

    fn find_node(&self, name: &str) -> Option<NodeIndex> {
        self.by_name.get(name).copied()
    }

    fn topology(&self, node: NodeIndex, source: TopologySource) -> Option<NodeTopology> {
        let record = self.get_node(node)?;
        match source {
            TopologySource::Configured => Some(record.config),
            TopologySource::Live => Some(record.live.unwrap_or(record.config)),
        }
    }

    fn is_up(&self, node: NodeIndex) -> bool {
        self.get_node(node).is_some_and(|n| !n.down)
    }

    fn has_features(&self, node: NodeIndex, features: &[String]) -> bool {
        self.get_node(node)
            .is_some_and(|n| features.iter().all(|f| n.features.contains(f)))
    }
}
