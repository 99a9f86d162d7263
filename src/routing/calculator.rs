use std::collections::BTreeMap;
use std::time::Instant;

use tracing::warn;

use crate::config::{RoutingAlgorithm, RoutingConfig};
use crate::error::{RoutingError, Stage};
use crate::hierarchy::{FlowType, HierarchyMap, NodeType, classify_flow};
use crate::ir::{FlowLink, FlowNode};
use crate::routing::geometry::{Point, distance};
use crate::routing::types::{
    AvoidanceZone, MultiLinkInfo, NodeBoxes, Route, RouteMeta, RoutePath,
};

// ── Anchoring ───────────────────────────────────────────────────────
/// Fraction of node height by which an anchor slides along the link's
/// direction angle.
const ANCHOR_ANGLE_RATIO: f32 = 0.3;

// ── Multi-link separation ───────────────────────────────────────────
/// Zero-centered offset patterns for parallel-link groups of size 2..=5.
const OFFSETS_2: [f32; 2] = [0.5, -0.5];
const OFFSETS_3: [f32; 3] = [0.7, 0.0, -0.7];
const OFFSETS_4: [f32; 4] = [0.9, 0.3, -0.3, -0.9];
const OFFSETS_5: [f32; 5] = [1.0, 0.5, 0.0, -0.5, -1.0];
/// Spread factor for the general-k pattern.
const GENERAL_OFFSET_SPREAD: f32 = 0.8;

// ── Curvature ───────────────────────────────────────────────────────
/// Distance factor cap: curvature stops growing past this multiple.
const DISTANCE_FACTOR_CAP: f32 = 1.5;
/// Horizontal control-point offset as a fraction of Δx.
const CONTROL_DX_RATIO: f32 = 0.4;
/// Per-position horizontal perturbation applied within a multi-link group.
const CONTROL_DX_JITTER: f32 = 0.1;
/// Amplitude step of the alternating per-group curvature adjustment.
const GROUP_CURVE_STEP: f32 = 0.05;
/// Vertical bow of the curve per unit of effective curvature.
const CURVE_BOW_RATIO: f32 = 0.5;

// ── Priority ────────────────────────────────────────────────────────
/// Magnitude adjustment band for route priority: priority is scaled into
/// [MAGNITUDE_BASE, MAGNITUDE_BASE + MAGNITUDE_SPAN] by normalized value.
const MAGNITUDE_BASE: f32 = 0.75;
const MAGNITUDE_SPAN: f32 = 0.25;

/// Default node-indexed palette when a link carries no color.
const ROUTE_PALETTE: [&str; 10] = [
    "#4e79a7", "#f28e2c", "#e15759", "#76b7b2", "#59a14f", "#edc949", "#af7aa1", "#ff9da7",
    "#9c755f", "#bab0ab",
];

/// Curvature multiplier for a source→target node-type pair.
fn flow_pair_multiplier(source: NodeType, target: NodeType) -> f32 {
    match (source, target) {
        (NodeType::Source, NodeType::Transformation) => 0.7,
        (NodeType::Source, NodeType::Distribution) => 0.9,
        (NodeType::Source, NodeType::Consumption) => 0.8,
        (NodeType::Transformation, NodeType::Distribution) => 1.2,
        (NodeType::Transformation, NodeType::Consumption) => 1.1,
        (NodeType::Distribution, NodeType::Consumption) => 1.0,
        (NodeType::Hub, _) | (_, NodeType::Hub) => 1.0,
        _ => 1.0,
    }
}

/// Symmetric, zero-centered vertical offset for position `i` in a group of
/// `k` parallel links.
pub fn multi_link_offset(position: usize, group_size: usize) -> f32 {
    match group_size {
        0 | 1 => 0.0,
        2 => OFFSETS_2[position.min(1)],
        3 => OFFSETS_3[position.min(2)],
        4 => OFFSETS_4[position.min(3)],
        5 => OFFSETS_5[position.min(4)],
        k => {
            let center = (k - 1) as f32 / 2.0;
            (center - position.min(k - 1) as f32) / center * GENERAL_OFFSET_SPREAD
        }
    }
}

/// Deterministic curvature adjustment that alternates sign by group
/// position so parallel links bow apart.
fn group_curvature_adjustment(position: usize, group_size: usize) -> f32 {
    if group_size <= 1 {
        return 0.0;
    }
    let amplitude = GROUP_CURVE_STEP * (position / 2 + 1) as f32;
    if position % 2 == 0 { amplitude } else { -amplitude }
}

fn validate_links(links: &[FlowLink], node_count: usize) -> Result<(), RoutingError> {
    for (idx, link) in links.iter().enumerate() {
        let bad = if link.source >= node_count {
            Some(link.source)
        } else if link.target >= node_count {
            Some(link.target)
        } else {
            None
        };
        if let Some(index) = bad {
            return Err(RoutingError::InvalidNodeReference {
                link: idx,
                index,
                node_count,
            });
        }
    }
    Ok(())
}

fn route_color(link: &FlowLink) -> String {
    link.color
        .clone()
        .unwrap_or_else(|| ROUTE_PALETTE[link.source % ROUTE_PALETTE.len()].to_string())
}

/// Group links by unordered node pair; each group sorted descending by
/// value (ties broken by link index for determinism).
fn group_parallel_links(links: &[FlowLink]) -> BTreeMap<(usize, usize), Vec<usize>> {
    let mut groups: BTreeMap<(usize, usize), Vec<usize>> = BTreeMap::new();
    for (idx, link) in links.iter().enumerate() {
        let key = (link.source.min(link.target), link.source.max(link.target));
        groups.entry(key).or_default().push(idx);
    }
    for members in groups.values_mut() {
        members.sort_by(|&a, &b| {
            links[b]
                .value
                .partial_cmp(&links[a].value)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cmp(&b))
        });
    }
    groups
}

struct CurveSpec {
    start: Point,
    end: Point,
    curvature: f32,
    position: usize,
    group_size: usize,
}

/// Build the four control points for one curve.
fn control_points(spec: &CurveSpec) -> [Point; 4] {
    let (x0, y0) = spec.start;
    let (x3, y3) = spec.end;
    let dx = x3 - x0;
    let jitter = 1.0 + multi_link_offset(spec.position, spec.group_size) * CONTROL_DX_JITTER;
    let ctrl_dx = dx * CONTROL_DX_RATIO * jitter;
    let bow = spec.curvature * (y3 - y0) * CURVE_BOW_RATIO
        + group_curvature_adjustment(spec.position, spec.group_size) * dx.abs();
    [
        (x0, y0),
        (x0 + ctrl_dx, y0 + bow),
        (x3 - ctrl_dx, y3 - bow),
        (x3, y3),
    ]
}

/// Shift the interior control points of a curve that pierces node boxes
/// until it clears them or the iteration cap is reached. Returns the zones
/// that triggered shifts. Never fails; a capped curve is kept best-effort.
fn resolve_node_collisions(
    route_id: &str,
    control: &mut [Point; 4],
    source: usize,
    target: usize,
    boxes: &NodeBoxes,
    config: &RoutingConfig,
) -> Vec<AvoidanceZone> {
    let sample_count = config.effective_curve_samples();
    let margin = config.node_margin;
    let mut zones: Vec<AvoidanceZone> = Vec::new();

    for _ in 0..config.collision_iteration_cap {
        let samples = crate::routing::geometry::sample_cubic(control, sample_count);
        let mut shifted = false;
        for (node_idx, bbox) in boxes.boxes.iter().enumerate() {
            if node_idx == source || node_idx == target {
                continue;
            }
            let expanded = bbox.expanded(margin);
            let Some(&hit) = samples.iter().find(|p| expanded.contains(**p)) else {
                continue;
            };
            let center = bbox.center();
            let shift = bbox.height + margin * 2.0;
            let direction = if hit.1 < center.1 { -1.0 } else { 1.0 };
            control[1].1 += shift * direction;
            control[2].1 += shift * direction;
            if !zones.iter().any(|zone| zone.node == node_idx) {
                zones.push(AvoidanceZone {
                    node: node_idx,
                    center,
                    radius: config.avoidance_radius.max(bbox.height / 2.0 + margin),
                });
            }
            shifted = true;
            break;
        }
        if !shifted {
            return zones;
        }
    }

    warn!(
        route = route_id,
        cap = config.collision_iteration_cap,
        "node collision cap reached; keeping best-effort curve"
    );
    zones
}

/// Compute the initial optimized route set: anchored, separation-offset,
/// curvature-shaped cubic curves with per-curve node avoidance.
pub fn calculate_optimized_routes(
    links: &[FlowLink],
    nodes: &[FlowNode],
    hierarchy: &HierarchyMap,
    config: &RoutingConfig,
    algorithm: RoutingAlgorithm,
    deadline: Option<Instant>,
) -> Result<Vec<Route>, RoutingError> {
    if nodes.is_empty() || links.is_empty() {
        return Err(RoutingError::EmptyInput);
    }
    validate_links(links, nodes.len())?;

    let boxes = NodeBoxes {
        boxes: hierarchy.nodes.iter().map(|info| info.bbox).collect(),
    };
    let groups = group_parallel_links(links);
    let mut routes: Vec<Option<Route>> = vec![None; links.len()];

    for members in groups.values() {
        let group_size = members.len();
        for (position, &link_idx) in members.iter().enumerate() {
            if let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                return Err(RoutingError::StageTimeout {
                    stage: Stage::Calculation,
                });
            }
            let link = &links[link_idx];
            let source_info = &hierarchy.nodes[link.source];
            let target_info = &hierarchy.nodes[link.target];

            // Anchor at the facing edges of the two node boxes, slid along
            // the link's direction angle.
            let angle = (target_info.y - source_info.y).atan2(target_info.x - source_info.x);
            let start_slide = angle.sin() * source_info.bbox.height * ANCHOR_ANGLE_RATIO;
            let end_slide = angle.sin() * target_info.bbox.height * ANCHOR_ANGLE_RATIO;
            let node_height = source_info.bbox.height.max(target_info.bbox.height);
            let separation = multi_link_offset(position, group_size)
                * config.link_separation
                * (1.0 + node_height);
            let start = (
                source_info.bbox.right(),
                source_info.y + start_slide + separation,
            );
            let end = (
                target_info.bbox.left(),
                target_info.y + end_slide + separation,
            );

            if !(start.0.is_finite()
                && start.1.is_finite()
                && end.0.is_finite()
                && end.1.is_finite())
            {
                return Err(RoutingError::DegenerateGeometry(format!(
                    "non-finite anchor for link {link_idx}"
                )));
            }

            let span = distance(start, end);
            let curvature = config.curvature
                * (span * 2.0).min(DISTANCE_FACTOR_CAP)
                * flow_pair_multiplier(source_info.node_type, target_info.node_type)
                * algorithm.curvature_scale();

            let mut control = control_points(&CurveSpec {
                start,
                end,
                curvature,
                position,
                group_size,
            });

            let value = link.value.max(0.0);
            let flow_type = classify_flow(
                link.customdata.as_ref().and_then(|d| d.as_str()),
                &source_info.name,
                &target_info.name,
                value,
                hierarchy.max_link_value,
            );
            let normalized = if hierarchy.max_link_value > 0.0 {
                (value / hierarchy.max_link_value).min(1.0)
            } else {
                0.0
            };
            let priority = normalized
                * flow_type.weight(config)
                * (MAGNITUDE_BASE + MAGNITUDE_SPAN * normalized);

            let id = format!("link-{link_idx}");
            let zones =
                resolve_node_collisions(&id, &mut control, link.source, link.target, &boxes, config);

            let multi_link = (group_size > 1).then(|| MultiLinkInfo {
                group_size,
                position,
                offset: separation,
            });

            routes[link_idx] = Some(Route {
                id,
                source: link.source,
                target: link.target,
                value,
                color: route_color(link),
                path: RoutePath::from_control(
                    control,
                    curvature,
                    config.effective_curve_samples(),
                ),
                meta: RouteMeta {
                    priority,
                    flow_type,
                    layer: 0,
                    avoidance_zones: zones,
                    resolved_conflicts: Vec::new(),
                    multi_link,
                },
            });
        }
    }

    Ok(routes.into_iter().flatten().collect())
}

/// Simplified fallback routing: no hierarchy, flat node boxes, low
/// curvature, no collision or crossing work. Invalid links are skipped
/// with a warning instead of failing the whole fallback.
pub fn fallback_routes(
    links: &[FlowLink],
    nodes: &[FlowNode],
    config: &RoutingConfig,
) -> Result<Vec<Route>, RoutingError> {
    if nodes.is_empty() || links.is_empty() {
        return Err(RoutingError::EmptyInput);
    }
    let half_width = config.node_width / 2.0;
    let max_value = links
        .iter()
        .map(|link| link.value.max(0.0))
        .fold(0.0f32, f32::max);

    let groups = group_parallel_links(links);
    let mut routes: Vec<Option<Route>> = vec![None; links.len()];
    for members in groups.values() {
        let group_size = members.len();
        for (position, &link_idx) in members.iter().enumerate() {
            let link = &links[link_idx];
            let (Some(source), Some(target)) = (nodes.get(link.source), nodes.get(link.target))
            else {
                warn!(link = link_idx, "invalid link skipped in fallback routing");
                continue;
            };
            let separation = multi_link_offset(position, group_size) * config.link_separation;
            let start = (source.x + half_width, source.y + separation);
            let end = (target.x - half_width, target.y + separation);
            let curvature =
                config.curvature * RoutingAlgorithm::ArcMinimal.curvature_scale();
            let control = control_points(&CurveSpec {
                start,
                end,
                curvature,
                position,
                group_size,
            });
            let value = link.value.max(0.0);
            let normalized = if max_value > 0.0 { value / max_value } else { 0.0 };
            routes[link_idx] = Some(Route {
                id: format!("link-{link_idx}"),
                source: link.source,
                target: link.target,
                value,
                color: route_color(link),
                path: RoutePath::from_control(control, curvature, config.effective_curve_samples()),
                meta: RouteMeta {
                    priority: normalized,
                    flow_type: FlowType::Distribution,
                    layer: 0,
                    avoidance_zones: Vec::new(),
                    resolved_conflicts: Vec::new(),
                    multi_link: (group_size > 1).then(|| MultiLinkInfo {
                        group_size,
                        position,
                        offset: separation,
                    }),
                },
            });
        }
    }
    let routes: Vec<Route> = routes.into_iter().flatten().collect();
    if routes.is_empty() {
        return Err(RoutingError::EmptyInput);
    }
    Ok(routes)
}

/// Last-resort default: straight lines between node centers. Every valid
/// link gets a route; the caller can always render something.
pub fn straight_line_routes(
    links: &[FlowLink],
    nodes: &[FlowNode],
    config: &RoutingConfig,
) -> Vec<Route> {
    let mut routes = Vec::with_capacity(links.len());
    for (link_idx, link) in links.iter().enumerate() {
        let (Some(source), Some(target)) = (nodes.get(link.source), nodes.get(link.target)) else {
            warn!(link = link_idx, "invalid link dropped from straight-line routes");
            continue;
        };
        let start = (source.x, source.y);
        let end = (target.x, target.y);
        let control = [
            start,
            (
                start.0 + (end.0 - start.0) / 3.0,
                start.1 + (end.1 - start.1) / 3.0,
            ),
            (
                start.0 + (end.0 - start.0) * 2.0 / 3.0,
                start.1 + (end.1 - start.1) * 2.0 / 3.0,
            ),
            end,
        ];
        routes.push(Route {
            id: format!("link-{link_idx}"),
            source: link.source,
            target: link.target,
            value: link.value.max(0.0),
            color: route_color(link),
            path: RoutePath::from_control(control, 0.0, config.effective_curve_samples()),
            meta: RouteMeta {
                priority: 0.0,
                flow_type: FlowType::Distribution,
                layer: 0,
                avoidance_zones: Vec::new(),
                resolved_conflicts: Vec::new(),
                multi_link: None,
            },
        });
    }
    routes
}
