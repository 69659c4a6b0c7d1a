//! Core data model: the immutable graph document parsed from YAML/JSON.
//!
//! A [`GraphDocument`] is produced once, at load time, and shared read-only
//! (`Arc<GraphDocument>`) across every component that needs it for the lifetime of an
//! execution. Nothing in this module runs a node; see [`crate::scheduler`] for that.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{GraphError, Result};

/// Node identifier — unique within a graph.
pub type NodeId = String;

/// Edge identifier — unique within a graph.
pub type EdgeId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Action,
    Decision,
    Data,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeProperties {
    pub display_name: Option<String>,
    pub handler: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    pub kind: NodeKind,
    #[serde(flatten)]
    pub properties: NodeProperties,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Sequence,
    Conditional,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
    In,
    Contains,
    WithinHours,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: ConditionOperator,
    pub value: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub id: EdgeId,
    pub from: NodeId,
    pub to: NodeId,
    pub kind: EdgeKind,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardType {
    Rbac,
    RateLimit,
    Audit,
    Custom,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardSelector {
    #[serde(default)]
    pub nodes: Vec<NodeId>,
    #[serde(default)]
    pub edges: Vec<EdgeId>,
}

impl GuardSelector {
    pub fn applies_to_node(&self, node: &str) -> bool {
        self.nodes.iter().any(|n| n == node)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardDeclaration {
    pub name: String,
    #[serde(rename = "type")]
    pub guard_type: GuardType,
    pub apply_to: GuardSelector,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "RetryConfig::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "RetryConfig::default_backoff_multiplier")]
    pub backoff_multiplier: u32,
    #[serde(default)]
    pub retry_on_errors: Vec<String>,
    #[serde(default)]
    pub no_retry_errors: Vec<String>,
}

impl RetryConfig {
    fn default_max_attempts() -> u32 {
        3
    }
    fn default_backoff_multiplier() -> u32 {
        2
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_max_attempts(),
            backoff_multiplier: Self::default_backoff_multiplier(),
            retry_on_errors: Vec::new(),
            no_retry_errors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    #[serde(default = "ConcurrencyConfig::default_max_parallel")]
    pub max_parallel: u32,
}

impl ConcurrencyConfig {
    fn default_max_parallel() -> u32 {
        5
    }
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_parallel: Self::default_max_parallel(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    #[serde(default = "GraphConfig::default_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
}

impl GraphConfig {
    fn default_timeout() -> u64 {
        300
    }
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            timeout_secs: Self::default_timeout(),
            retry: RetryConfig::default(),
            concurrency: ConcurrencyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphMetadata {
    pub name: String,
    #[serde(default = "GraphMetadata::default_version")]
    pub version: String,
}

impl GraphMetadata {
    fn default_version() -> String {
        "0.1.0".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphSpec {
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
    #[serde(default)]
    pub guards: Vec<GuardDeclaration>,
    #[serde(default)]
    pub config: GraphConfig,
}

/// The immutable, parsed graph document. Shared read-only across an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDocument {
    pub metadata: GraphMetadata,
    pub spec: GraphSpec,
}

impl GraphDocument {
    /// Parse a graph document from YAML source.
    pub fn from_yaml(source: &str) -> Result<Self> {
        serde_yaml::from_str(source)
            .map_err(|e| GraphError::ConfigInvalid(format!("invalid graph YAML: {e}")))
    }

    /// Parse a graph document from JSON source.
    pub fn from_json(source: &str) -> Result<Self> {
        serde_json::from_str(source)
            .map_err(|e| GraphError::ConfigInvalid(format!("invalid graph JSON: {e}")))
    }

    /// Parse either encoding, sniffing on the first non-whitespace byte.
    pub fn from_str_auto(source: &str) -> Result<Self> {
        let trimmed = source.trim_start();
        if trimmed.starts_with('{') {
            Self::from_json(source)
        } else {
            Self::from_yaml(source)
        }
    }

    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.spec.nodes.iter().find(|n| n.id == id)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.spec.nodes.iter().map(|n| &n.id)
    }

    /// Edges whose `from` is the given node id.
    pub fn outgoing_edges<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a EdgeSpec> {
        self.spec.edges.iter().filter(move |e| e.from == node)
    }

    /// Edges whose `to` is the given node id.
    pub fn incoming_edges<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a EdgeSpec> {
        self.spec.edges.iter().filter(move |e| e.to == node)
    }

    pub fn guards_for_node<'a>(&'a self, node: &'a str) -> impl Iterator<Item = &'a GuardDeclaration> {
        self.spec
            .guards
            .iter()
            .filter(move |g| g.apply_to.applies_to_node(node))
    }

    /// I1: every edge references existing nodes.
    pub fn check_edges_reference_existing_nodes(&self) -> Result<()> {
        let ids: HashMap<&str, ()> = self.spec.nodes.iter().map(|n| (n.id.as_str(), ())).collect();
        for edge in &self.spec.edges {
            if !ids.contains_key(edge.from.as_str()) {
                return Err(GraphError::EdgeDangling {
                    edge: edge.id.clone(),
                    node: edge.from.clone(),
                });
            }
            if !ids.contains_key(edge.to.as_str()) {
                return Err(GraphError::EdgeDangling {
                    edge: edge.id.clone(),
                    node: edge.to.clone(),
                });
            }
        }
        Ok(())
    }
}
