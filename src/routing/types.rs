use crate::hierarchy::FlowType;
use crate::routing::geometry::{BoundingBox, Point, sample_cubic, svg_cubic_path};

/// The renderable geometry of one link curve.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutePath {
    /// P0 anchor, P1/P2 interior, P3 anchor.
    pub control: [Point; 4],
    pub curvature: f32,
    pub samples: Vec<Point>,
    /// SVG-style `M … C …` command string.
    pub svg_path: String,
}

impl RoutePath {
    pub fn from_control(control: [Point; 4], curvature: f32, sample_count: usize) -> Self {
        Self {
            samples: sample_cubic(&control, sample_count),
            svg_path: svg_cubic_path(&control),
            control,
            curvature,
        }
    }

    /// Re-derive samples and path string after the control points were
    /// nudged in place.
    pub fn rebuild(&mut self, sample_count: usize) {
        self.samples = sample_cubic(&self.control, sample_count);
        self.svg_path = svg_cubic_path(&self.control);
    }
}

/// A node region the initial curve pierced; renderers and later passes
/// treat it as keep-out space.
#[derive(Debug, Clone, PartialEq)]
pub struct AvoidanceZone {
    pub node: usize,
    pub center: Point,
    pub radius: f32,
}

/// Placement of a route within a group of parallel links between one node
/// pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MultiLinkInfo {
    pub group_size: usize,
    /// Rank within the group, descending by value.
    pub position: usize,
    /// Signed vertical offset applied to both anchors.
    pub offset: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RouteMeta {
    pub priority: f32,
    pub flow_type: FlowType,
    /// Z-order layer. Routes on different layers render stacked and are
    /// not considered crossing conflicts of one another.
    pub layer: u8,
    pub avoidance_zones: Vec<AvoidanceZone>,
    /// Human-readable records of conflict resolutions applied to this route.
    pub resolved_conflicts: Vec<String>,
    pub multi_link: Option<MultiLinkInfo>,
}

/// One routed link. Created by the route calculator, nudged in place by
/// the crossing resolver, owned by the orchestrator once returned.
#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub id: String,
    pub source: usize,
    pub target: usize,
    pub value: f32,
    pub color: String,
    pub path: RoutePath,
    pub meta: RouteMeta,
}

impl Route {
    pub fn endpoints_shared_with(&self, other: &Route) -> bool {
        self.source == other.source
            || self.source == other.target
            || self.target == other.source
            || self.target == other.target
    }

    pub fn same_node_pair(&self, other: &Route) -> bool {
        let a = (self.source.min(self.target), self.source.max(self.target));
        let b = (other.source.min(other.target), other.source.max(other.target));
        a == b
    }
}

/// Node box lookup used by the collision pass; decouples the calculator
/// from where the boxes came from (hierarchy or fallback defaults).
#[derive(Debug, Clone)]
pub struct NodeBoxes {
    pub boxes: Vec<BoundingBox>,
}

impl NodeBoxes {
    pub fn get(&self, index: usize) -> Option<&BoundingBox> {
        self.boxes.get(index)
    }
}
