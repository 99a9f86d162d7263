use std::collections::VecDeque;
use std::time::Instant;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use crate::config::RoutingConfig;
use crate::error::{RoutingError, Stage};
use crate::ir::{FlowLink, FlowNode, NodeMetadataProvider};
use crate::routing::geometry::BoundingBox;

// ── Classification thresholds ───────────────────────────────────────
/// Magnitude thresholds as fractions of the largest link value, ascending
/// priority. A flow at or above a threshold takes that classification.
const PRIMARY_FLOW_RATIO: f32 = 0.5;
const SECONDARY_FLOW_RATIO: f32 = 0.25;
const TRANSFORMATION_FLOW_RATIO: f32 = 0.1;

/// Position cutoffs for the degree-based node-type fallback.
const SOURCE_X_MAX: f32 = 0.3;
const CONSUMPTION_X_MIN: f32 = 0.7;

/// Bottleneck flagging threshold on the combined score.
const BOTTLENECK_THRESHOLD: f32 = 0.7;
/// Normalizer for the connectivity-ratio component of the bottleneck score.
const CONNECTIVITY_RATIO_SCALE: f32 = 1000.0;

/// Deepest level a node can be assigned.
const MAX_LEVEL: u8 = 10;

/// Minimum node box height so zero-flow nodes still present a collision
/// target.
const MIN_NODE_HEIGHT_RATIO: f32 = 0.08;

static SOURCE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(coal|gas|oil|solar|wind|nuclear|hydro|biomass|geothermal|import|supply|source|extraction)\b").unwrap()
});
static TRANSFORMATION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(plant|refiner\w*|generat\w*|convert\w*|transform\w*|turbine|boiler|reactor|processing)\b").unwrap()
});
static DISTRIBUTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(grid|network|distribut\w*|transmission|pipeline|storage|substation)\b")
        .unwrap()
});
static CONSUMPTION_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(demand|consum\w*|residential|industr\w*|commercial|transport\w*|export|losses|end.use)\b").unwrap()
});
static PRIMARY_FLOW_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(primary|main|backbone|trunk|total)\b").unwrap());
static SECONDARY_FLOW_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(secondary|auxiliary|aux|branch)\b").unwrap());
/// Embedded value/markup suffixes a data source may append to node names,
/// e.g. `"Coal<br>120 TWh"` or `"Gas [45.2]"`.
static NAME_SUFFIX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:<br\s*/?\s*>.*|\s*\[[^\]]*\]\s*$|\s*\([^)]*\)\s*$|\s*:\s*[\d.,]+.*$)").unwrap()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    Source,
    Transformation,
    Distribution,
    Consumption,
    Hub,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowType {
    Primary,
    Secondary,
    Transformation,
    Distribution,
}

impl FlowType {
    /// Fixed per-type priority multiplier; scaled by the configured weights
    /// where the config differs from the defaults.
    pub fn weight(self, config: &RoutingConfig) -> f32 {
        match self {
            FlowType::Primary => config.primary_flow_weight,
            FlowType::Secondary => config.secondary_flow_weight,
            FlowType::Transformation => config.transformation_flow_weight,
            FlowType::Distribution => config.distribution_flow_weight,
        }
    }
}

/// One classified flow attached to a node, from the node's point of view.
#[derive(Debug, Clone)]
pub struct FlowRef {
    pub neighbor: usize,
    pub value: f32,
    pub flow_type: FlowType,
    pub priority: f32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Centrality {
    pub degree: f32,
    pub flow: f32,
    pub betweenness: f32,
    pub overall: f32,
}

/// Structural and statistical summary of one node. Built once per
/// `map_hierarchy` call and immutable afterwards.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    pub index: usize,
    pub name: String,
    pub node_type: NodeType,
    pub level: u8,
    pub column: usize,
    pub x: f32,
    pub y: f32,
    pub bbox: BoundingBox,
    pub parents: Vec<usize>,
    pub children: Vec<usize>,
    pub incoming: Vec<FlowRef>,
    pub outgoing: Vec<FlowRef>,
    pub energy_type: String,
    pub in_degree: usize,
    pub out_degree: usize,
    pub total_flow: f32,
    pub centrality: Centrality,
    pub bottleneck_score: f32,
    pub is_bottleneck: bool,
}

/// The hierarchy map: per-node summaries plus the graph-wide maxima the
/// route calculator normalizes against.
#[derive(Debug, Clone)]
pub struct HierarchyMap {
    pub nodes: Vec<NodeInfo>,
    pub max_total_flow: f32,
    pub max_link_value: f32,
}

impl HierarchyMap {
    pub fn node(&self, index: usize) -> Option<&NodeInfo> {
        self.nodes.get(index)
    }
}

/// Strip any embedded value/markup suffix from a raw node name.
pub fn display_name(raw: &str) -> String {
    let cleaned = NAME_SUFFIX_RE.replace(raw, "");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        raw.trim().to_string()
    } else {
        cleaned.to_string()
    }
}

fn type_from_name(name: &str) -> Option<NodeType> {
    // Pattern order mirrors classification priority; the first category
    // whose pattern matches wins.
    if SOURCE_RE.is_match(name) {
        return Some(NodeType::Source);
    }
    if TRANSFORMATION_RE.is_match(name) {
        return Some(NodeType::Transformation);
    }
    if DISTRIBUTION_RE.is_match(name) {
        return Some(NodeType::Distribution);
    }
    if CONSUMPTION_RE.is_match(name) {
        return Some(NodeType::Consumption);
    }
    None
}

fn type_from_category(category: &str) -> Option<NodeType> {
    match category.to_ascii_lowercase().as_str() {
        "source" => Some(NodeType::Source),
        "transformation" => Some(NodeType::Transformation),
        "distribution" => Some(NodeType::Distribution),
        "consumption" => Some(NodeType::Consumption),
        "hub" => Some(NodeType::Hub),
        _ => None,
    }
}

fn heuristic_type(x: f32, in_degree: usize, out_degree: usize) -> NodeType {
    if in_degree == 0 && x < SOURCE_X_MAX {
        NodeType::Source
    } else if out_degree == 0 && x > CONSUMPTION_X_MIN {
        NodeType::Consumption
    } else if in_degree > 1 || out_degree > 1 {
        NodeType::Transformation
    } else {
        NodeType::Distribution
    }
}

fn energy_tag(name: &str) -> String {
    SOURCE_RE
        .find(name)
        .map(|m| m.as_str().to_ascii_lowercase())
        .unwrap_or_else(|| "unspecified".to_string())
}

/// Classify one flow. Name-pattern rules on the link label and on the two
/// endpoint names take precedence; otherwise the magnitude is matched
/// against the ascending thresholds.
pub fn classify_flow(
    label: Option<&str>,
    source_name: &str,
    target_name: &str,
    value: f32,
    max_value: f32,
) -> FlowType {
    let haystack = match label {
        Some(text) => format!("{text} {source_name} {target_name}"),
        None => format!("{source_name} {target_name}"),
    };
    if PRIMARY_FLOW_RE.is_match(&haystack) {
        return FlowType::Primary;
    }
    if SECONDARY_FLOW_RE.is_match(&haystack) {
        return FlowType::Secondary;
    }
    if TRANSFORMATION_RE.is_match(&haystack) {
        return FlowType::Transformation;
    }
    if DISTRIBUTION_RE.is_match(&haystack) {
        return FlowType::Distribution;
    }

    let ratio = if max_value > 0.0 { value / max_value } else { 0.0 };
    if ratio >= PRIMARY_FLOW_RATIO {
        FlowType::Primary
    } else if ratio >= SECONDARY_FLOW_RATIO {
        FlowType::Secondary
    } else if ratio >= TRANSFORMATION_FLOW_RATIO {
        FlowType::Transformation
    } else {
        FlowType::Distribution
    }
}

fn link_label(link: &FlowLink) -> Option<&str> {
    link.customdata.as_ref().and_then(|data| data.as_str())
}

/// Longest-path ranks from the in-degree-zero frontier. Falls back to
/// all-zero ranks when the graph has a cycle (the topological order is then
/// incomplete and rank propagation would be unstable).
fn assign_ranks(node_count: usize, links: &[(usize, usize)]) -> Vec<usize> {
    let mut indegree = vec![0usize; node_count];
    let mut outgoing: Vec<Vec<usize>> = vec![Vec::new(); node_count];
    for &(from, to) in links {
        indegree[to] += 1;
        outgoing[from].push(to);
    }
    let mut queue: VecDeque<usize> = indegree
        .iter()
        .enumerate()
        .filter_map(|(idx, deg)| (*deg == 0).then_some(idx))
        .collect();
    let mut work = indegree.clone();
    let mut topo = Vec::with_capacity(node_count);
    while let Some(node) = queue.pop_front() {
        topo.push(node);
        for &to in &outgoing[node] {
            work[to] -= 1;
            if work[to] == 0 {
                queue.push_back(to);
            }
        }
    }
    let mut ranks = vec![0usize; node_count];
    if topo.len() == node_count {
        for &node in &topo {
            for &to in &outgoing[node] {
                ranks[to] = ranks[to].max(ranks[node] + 1);
            }
        }
    }
    ranks
}

/// Build the hierarchy map from raw nodes and links. `deadline`, when set,
/// is checked cooperatively between nodes; exceeding it returns a
/// `StageTimeout` so the orchestrator can fall back.
pub fn map_hierarchy(
    nodes: &[FlowNode],
    links: &[FlowLink],
    provider: Option<&dyn NodeMetadataProvider>,
    config: &RoutingConfig,
    deadline: Option<Instant>,
) -> Result<HierarchyMap, RoutingError> {
    if nodes.is_empty() {
        return Err(RoutingError::EmptyInput);
    }
    let node_count = nodes.len();

    // Accumulate degree and flow totals, skipping (and warning about)
    // links whose endpoints do not resolve.
    let mut valid_links: Vec<(usize, &FlowLink)> = Vec::with_capacity(links.len());
    let mut in_degree = vec![0usize; node_count];
    let mut out_degree = vec![0usize; node_count];
    let mut in_total = vec![0.0f32; node_count];
    let mut out_total = vec![0.0f32; node_count];
    let mut max_link_value = 0.0f32;
    for (idx, link) in links.iter().enumerate() {
        if link.source >= node_count || link.target >= node_count {
            warn!(
                link = idx,
                source = link.source,
                target = link.target,
                node_count,
                "link references a missing node; skipped in hierarchy"
            );
            continue;
        }
        let value = link.value.max(0.0);
        out_degree[link.source] += 1;
        in_degree[link.target] += 1;
        out_total[link.source] += value;
        in_total[link.target] += value;
        max_link_value = max_link_value.max(value);
        valid_links.push((idx, link));
    }

    let rank_edges: Vec<(usize, usize)> = valid_links
        .iter()
        .map(|(_, link)| (link.source, link.target))
        .collect();
    let ranks = assign_ranks(node_count, &rank_edges);

    let totals: Vec<f32> = (0..node_count)
        .map(|idx| in_total[idx].max(out_total[idx]))
        .collect();
    let max_total = totals.iter().copied().fold(0.0f32, f32::max).max(f32::EPSILON);

    let mut infos = Vec::with_capacity(node_count);
    for (idx, raw) in nodes.iter().enumerate() {
        if let Some(deadline) = deadline
            && Instant::now() >= deadline
        {
            return Err(RoutingError::StageTimeout {
                stage: Stage::Hierarchy,
            });
        }

        let name = display_name(&raw.name);
        let breakdown = provider.and_then(|p| p.node_breakdown(&raw.name));

        let mut node_type = breakdown
            .as_ref()
            .and_then(|b| b.category.as_deref())
            .and_then(type_from_category)
            .or_else(|| type_from_name(&name))
            .unwrap_or_else(|| heuristic_type(raw.x, in_degree[idx], out_degree[idx]));
        if in_degree[idx] + out_degree[idx] >= config.hub_degree_threshold {
            node_type = NodeType::Hub;
        }

        let level = breakdown
            .as_ref()
            .and_then(|b| b.level)
            .unwrap_or(ranks[idx].min(MAX_LEVEL as usize) as u8)
            .min(MAX_LEVEL);

        let energy_type = breakdown
            .as_ref()
            .and_then(|b| b.energy_type.clone())
            .unwrap_or_else(|| energy_tag(&name));

        let height = (totals[idx] / max_total).max(MIN_NODE_HEIGHT_RATIO)
            * config.node_height_scale;
        let bbox = BoundingBox::centered(raw.x, raw.y, config.node_width, height);

        infos.push(NodeInfo {
            index: idx,
            name,
            node_type,
            level,
            column: ranks[idx],
            x: raw.x,
            y: raw.y,
            bbox,
            parents: Vec::new(),
            children: Vec::new(),
            incoming: Vec::new(),
            outgoing: Vec::new(),
            energy_type,
            in_degree: in_degree[idx],
            out_degree: out_degree[idx],
            total_flow: totals[idx],
            centrality: Centrality::default(),
            bottleneck_score: 0.0,
            is_bottleneck: false,
        });
    }

    // Attach classified flows now that every node has a display name.
    for (_, link) in &valid_links {
        let value = link.value.max(0.0);
        let flow_type = classify_flow(
            link_label(link),
            &infos[link.source].name,
            &infos[link.target].name,
            value,
            max_link_value,
        );
        let normalized = if max_link_value > 0.0 {
            (value / max_link_value).min(1.0)
        } else {
            0.0
        };
        let priority = normalized * flow_type.weight(config);

        infos[link.source].children.push(link.target);
        infos[link.source].outgoing.push(FlowRef {
            neighbor: link.target,
            value,
            flow_type,
            priority,
        });
        infos[link.target].parents.push(link.source);
        infos[link.target].incoming.push(FlowRef {
            neighbor: link.source,
            value,
            flow_type,
            priority,
        });
    }

    // Centrality and bottleneck scoring.
    for info in &mut infos {
        let degree = if node_count > 1 {
            (info.in_degree + info.out_degree) as f32 / (node_count - 1) as f32
        } else {
            0.0
        };
        let flow = info.total_flow / max_total;
        let betweenness = if info.in_degree > 0 && info.out_degree > 0 {
            info.in_degree.min(info.out_degree) as f32
                / info.in_degree.max(info.out_degree) as f32
        } else {
            0.0
        };
        let overall = (degree + flow + betweenness) / 3.0;
        info.centrality = Centrality {
            degree,
            flow,
            betweenness,
            overall,
        };

        let connectivity_ratio =
            info.total_flow * (info.in_degree + info.out_degree) as f32;
        info.bottleneck_score =
            (overall + (connectivity_ratio / CONNECTIVITY_RATIO_SCALE).min(1.0)) / 2.0;
        info.is_bottleneck = info.bottleneck_score > BOTTLENECK_THRESHOLD;
    }

    // Validation pass: parent/child references must resolve. They are
    // built from already-filtered links, so a failure here indicates an
    // internal inconsistency worth surfacing, but never a hard error.
    for info in &infos {
        for &parent in &info.parents {
            if parent >= node_count {
                warn!(node = info.index, parent, "unresolved parent reference");
            }
        }
        for &child in &info.children {
            if child >= node_count {
                warn!(node = info.index, child, "unresolved child reference");
            }
        }
    }

    Ok(HierarchyMap {
        nodes: infos,
        max_total_flow: max_total,
        max_link_value,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::NodeBreakdown;

    fn simple_inputs() -> (Vec<FlowNode>, Vec<FlowLink>) {
        let nodes = vec![
            FlowNode::new("Coal<br>120 TWh", 0.05, 0.3),
            FlowNode::new("Power Plant", 0.5, 0.4),
            FlowNode::new("Residential", 0.95, 0.4),
        ];
        let links = vec![FlowLink::new(0, 1, 120.0), FlowLink::new(1, 2, 80.0)];
        (nodes, links)
    }

    #[test]
    fn strips_value_suffix_from_names() {
        assert_eq!(display_name("Coal<br>120 TWh"), "Coal");
        assert_eq!(display_name("Gas [45.2]"), "Gas");
        assert_eq!(display_name("Wind: 12.5 TWh"), "Wind");
        assert_eq!(display_name("Plain"), "Plain");
    }

    #[test]
    fn classifies_by_name_patterns_first() {
        let (nodes, links) = simple_inputs();
        let hierarchy =
            map_hierarchy(&nodes, &links, None, &RoutingConfig::default(), None).unwrap();
        assert_eq!(hierarchy.nodes[0].node_type, NodeType::Source);
        assert_eq!(hierarchy.nodes[1].node_type, NodeType::Transformation);
        assert_eq!(hierarchy.nodes[2].node_type, NodeType::Consumption);
    }

    #[test]
    fn heuristics_cover_unnamed_nodes() {
        let nodes = vec![
            FlowNode::new("n0", 0.1, 0.5),
            FlowNode::new("n1", 0.5, 0.5),
            FlowNode::new("n2", 0.5, 0.2),
            FlowNode::new("n3", 0.9, 0.5),
        ];
        let links = vec![
            FlowLink::new(0, 1, 5.0),
            FlowLink::new(0, 2, 5.0),
            FlowLink::new(1, 3, 5.0),
            FlowLink::new(2, 3, 5.0),
        ];
        let hierarchy =
            map_hierarchy(&nodes, &links, None, &RoutingConfig::default(), None).unwrap();
        // in-degree 0 and far left wins over the branching rule
        assert_eq!(hierarchy.nodes[0].node_type, NodeType::Source);
        // out-degree 0 and far right
        assert_eq!(hierarchy.nodes[3].node_type, NodeType::Consumption);
        // interior pass-through without branching
        assert_eq!(hierarchy.nodes[1].node_type, NodeType::Distribution);
    }

    #[test]
    fn magnitude_thresholds_order_flow_types() {
        assert_eq!(classify_flow(None, "a", "b", 100.0, 100.0), FlowType::Primary);
        assert_eq!(classify_flow(None, "a", "b", 30.0, 100.0), FlowType::Secondary);
        assert_eq!(
            classify_flow(None, "a", "b", 15.0, 100.0),
            FlowType::Transformation
        );
        assert_eq!(
            classify_flow(None, "a", "b", 2.0, 100.0),
            FlowType::Distribution
        );
    }

    #[test]
    fn priority_scales_with_magnitude_and_type() {
        let (nodes, links) = simple_inputs();
        let config = RoutingConfig::default();
        let hierarchy = map_hierarchy(&nodes, &links, None, &config, None).unwrap();
        // "Power Plant" in the haystack pins the flow to Transformation
        // before the magnitude thresholds are consulted.
        let coal_out = &hierarchy.nodes[0].outgoing[0];
        assert_eq!(coal_out.flow_type, FlowType::Transformation);
        let expected = RoutingConfig::default().transformation_flow_weight;
        assert!((coal_out.priority - expected).abs() < 1e-6);
    }

    #[test]
    fn invalid_link_is_skipped_not_fatal() {
        let (nodes, mut links) = simple_inputs();
        links.push(FlowLink::new(0, 99, 5.0));
        let hierarchy =
            map_hierarchy(&nodes, &links, None, &RoutingConfig::default(), None).unwrap();
        assert_eq!(hierarchy.nodes.len(), 3);
        assert_eq!(hierarchy.nodes[0].out_degree, 1);
    }

    #[test]
    fn provider_overrides_classification() {
        struct Fixed;
        impl NodeMetadataProvider for Fixed {
            fn node_breakdown(&self, name: &str) -> Option<NodeBreakdown> {
                (name == "Power Plant").then(|| NodeBreakdown {
                    category: Some("distribution".to_string()),
                    energy_type: Some("electricity".to_string()),
                    level: Some(3),
                })
            }
        }
        let (nodes, links) = simple_inputs();
        let hierarchy = map_hierarchy(
            &nodes,
            &links,
            Some(&Fixed),
            &RoutingConfig::default(),
            None,
        )
        .unwrap();
        assert_eq!(hierarchy.nodes[1].node_type, NodeType::Distribution);
        assert_eq!(hierarchy.nodes[1].energy_type, "electricity");
        assert_eq!(hierarchy.nodes[1].level, 3);
    }

    #[test]
    fn hub_threshold_retypes_dense_nodes() {
        let mut nodes = vec![FlowNode::new("center", 0.5, 0.5)];
        let mut links = Vec::new();
        for i in 0..6 {
            nodes.push(FlowNode::new(format!("leaf{i}"), 0.9, 0.1 * i as f32));
            links.push(FlowLink::new(0, i + 1, 1.0));
        }
        let hierarchy =
            map_hierarchy(&nodes, &links, None, &RoutingConfig::default(), None).unwrap();
        assert_eq!(hierarchy.nodes[0].node_type, NodeType::Hub);
    }

    #[test]
    fn centrality_ranges_are_sane() {
        let (nodes, links) = simple_inputs();
        let hierarchy =
            map_hierarchy(&nodes, &links, None, &RoutingConfig::default(), None).unwrap();
        for info in &hierarchy.nodes {
            assert!(info.centrality.degree >= 0.0 && info.centrality.degree <= 1.0);
            assert!(info.centrality.flow >= 0.0 && info.centrality.flow <= 1.0);
            assert!(info.centrality.betweenness >= 0.0 && info.centrality.betweenness <= 1.0);
            assert!(info.bottleneck_score >= 0.0 && info.bottleneck_score <= 1.0);
        }
        // middle node passes everything through: betweenness 1
        assert!((hierarchy.nodes[1].centrality.betweenness - 1.0).abs() < 1e-6);
    }

    #[test]
    fn expired_deadline_times_out() {
        let (nodes, links) = simple_inputs();
        let deadline = Instant::now() - std::time::Duration::from_millis(1);
        let err = map_hierarchy(
            &nodes,
            &links,
            None,
            &RoutingConfig::default(),
            Some(deadline),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            RoutingError::StageTimeout {
                stage: Stage::Hierarchy
            }
        ));
    }
}
