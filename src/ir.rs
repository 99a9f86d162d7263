use serde::{Deserialize, Serialize};

use crate::config::RoutingAlgorithm;

/// A positioned diagram node as supplied by the external layout stage.
/// Coordinates are normalized to `[0, 1]` in both axes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowNode {
    pub name: String,
    pub x: f32,
    pub y: f32,
}

impl FlowNode {
    pub fn new(name: impl Into<String>, x: f32, y: f32) -> Self {
        Self {
            name: name.into(),
            x,
            y,
        }
    }
}

/// A flow between two nodes, referenced by index into the node array.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowLink {
    pub source: usize,
    pub target: usize,
    pub value: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customdata: Option<serde_json::Value>,
}

impl FlowLink {
    pub fn new(source: usize, target: usize, value: f32) -> Self {
        Self {
            source,
            target,
            value,
            color: None,
            customdata: None,
        }
    }
}

/// Structured per-node detail a host application may expose to sharpen
/// classification. All fields are optional; anything absent falls back to
/// the heuristic rules.
#[derive(Debug, Clone, Default)]
pub struct NodeBreakdown {
    /// Explicit category name ("source", "transformation", ...).
    pub category: Option<String>,
    /// Domain tag carried through to `NodeInfo::energy_type`.
    pub energy_type: Option<String>,
    pub level: Option<u8>,
}

/// Optional capability interface for host-provided node metadata.
/// Resolved once at engine construction; a `None` result (or no provider at
/// all) degrades to heuristic-only classification.
pub trait NodeMetadataProvider: Send {
    fn node_breakdown(&self, name: &str) -> Option<NodeBreakdown>;
}

/// Per-call options for `RoutingEngine::calculate_routes`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingOptions {
    /// Override the configured algorithm for this call only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<RoutingAlgorithm>,
    /// Skip the crossing-resolution stage and return the initial curves.
    #[serde(default)]
    pub skip_optimization: bool,
    /// Seed for the one intentionally randomized conflict nudge. Fixed by
    /// default so repeated runs are reproducible; hosts may randomize it.
    #[serde(default = "default_nudge_seed")]
    pub nudge_seed: u64,
}

fn default_nudge_seed() -> u64 {
    0x9e37_79b9_7f4a_7c15
}

impl Default for RoutingOptions {
    fn default() -> Self {
        Self {
            algorithm: None,
            skip_optimization: false,
            nudge_seed: default_nudge_seed(),
        }
    }
}
