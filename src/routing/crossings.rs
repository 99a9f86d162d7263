use std::collections::{BTreeMap, HashSet};
use std::f32::consts::FRAC_PI_2;
use std::time::Instant;

use tracing::debug;

use crate::config::RoutingConfig;
use crate::routing::geometry::{
    Point, min_sample_separation, sample_cubic, segment_angle, segment_intersection,
};
use crate::routing::types::Route;

// ── Severity scoring ────────────────────────────────────────────────
// Heuristic constants carried over verbatim; no stated optimality
// criterion. See DESIGN.md before tuning.
const SEVERITY_BASE: f32 = 0.5;
/// Weight of the near-perpendicular angle factor.
const ANGLE_WEIGHT: f32 = 0.3;
/// Weight of the midpoint-proximity factor.
const MIDPOINT_WEIGHT: f32 = 0.25;
/// Weight of the priority-difference factor.
const PRIORITY_WEIGHT: f32 = 0.2;
/// Divisor of the log-scaled magnitude ratio.
const MAGNITUDE_LOG_DIVISOR: f32 = 10.0;
/// Cap on the magnitude-ratio multiplier.
const MAGNITUDE_FACTOR_CAP: f32 = 1.2;

// ── Strategy selection ──────────────────────────────────────────────
/// Crossings flatter than this are "shallow" and get a vertical offset.
const SHALLOW_ANGLE_RAD: f32 = 0.35;
/// Half-width of the parametric band around t=0.5 counted as "midpoint".
const MIDPOINT_BAND: f32 = 0.15;
/// Priority difference that triggers the path-deviation strategy.
const PRIORITY_GAP: f32 = 0.3;
/// Link-separation boost applied by the last-resort pass.
const LAST_RESORT_SEPARATION_BOOST: f32 = 1.5;

/// Classification of one crossing, ordered by resolution precedence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CrossingKind {
    ParallelOverlap,
    PrimaryPrimary,
    PrimarySecondary,
    SecondarySecondary,
    Mixed,
}

/// One detected conflict between two routes. Transient: recomputed every
/// detection pass, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Crossing {
    pub route1: usize,
    pub route2: usize,
    pub point: Point,
    pub severity: f32,
    pub kind: CrossingKind,
    pub t1: f32,
    pub t2: f32,
    /// Acute intersection angle in radians.
    pub angle: f32,
}

/// Outcome summary of one `resolve_route_conflicts` run.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResolutionReport {
    pub initial_crossings: usize,
    pub final_crossings: usize,
    pub iterations: u32,
    pub last_resort: bool,
}

/// xorshift64* — the single intentionally randomized nudge draws from
/// this so tests can pin the seed.
#[derive(Debug, Clone)]
pub struct NudgeRng {
    state: u64,
}

impl NudgeRng {
    pub fn new(seed: u64) -> Self {
        Self {
            state: seed.max(1),
        }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_f491_4f6c_dd1d)
    }

    /// Uniform draw in `[-1, 1)`.
    pub fn next_signed(&mut self) -> f32 {
        (self.next_u64() >> 40) as f32 / (1u64 << 24) as f32 * 2.0 - 1.0
    }
}

fn classify_pair(a: &Route, b: &Route) -> CrossingKind {
    use crate::hierarchy::FlowType::*;
    match (a.meta.flow_type, b.meta.flow_type) {
        (Primary, Primary) => CrossingKind::PrimaryPrimary,
        (Primary, Secondary) | (Secondary, Primary) => CrossingKind::PrimarySecondary,
        (Secondary, Secondary) => CrossingKind::SecondarySecondary,
        _ => CrossingKind::Mixed,
    }
}

fn severity_for(
    a: &Route,
    b: &Route,
    angle: f32,
    t1: f32,
    t2: f32,
) -> f32 {
    let angle_factor = 1.0 + ANGLE_WEIGHT * (angle / FRAC_PI_2).clamp(0.0, 1.0);
    let midpointness = (1.0 - ((t1 - 0.5).abs() + (t2 - 0.5).abs())).clamp(0.0, 1.0);
    let midpoint_factor = 1.0 + MIDPOINT_WEIGHT * midpointness;
    let priority_factor = 1.0 + PRIORITY_WEIGHT * (a.meta.priority - b.meta.priority).abs();
    let (hi, lo) = if a.value >= b.value {
        (a.value, b.value)
    } else {
        (b.value, a.value)
    };
    let magnitude_factor = if lo > 0.0 {
        (1.0 + (hi / lo).ln() / MAGNITUDE_LOG_DIVISOR).min(MAGNITUDE_FACTOR_CAP)
    } else {
        MAGNITUDE_FACTOR_CAP
    };
    (SEVERITY_BASE * angle_factor * midpoint_factor * priority_factor * magnitude_factor)
        .clamp(0.0, 1.0)
}

/// Detect pairwise conflicts over the full route set.
///
/// Pairs sharing a source or target node are topologically adjacent, not
/// visual crossings, and are never reported — except that routes between
/// the *same* node pair are checked for parallel overlap. Pairs on
/// different z-layers render stacked and are skipped entirely.
pub fn detect_crossings(routes: &[Route], config: &RoutingConfig) -> Vec<Crossing> {
    let samples = config.effective_detection_samples();
    let polylines: Vec<Vec<Point>> = routes
        .iter()
        .map(|route| sample_cubic(&route.path.control, samples))
        .collect();

    let mut crossings = Vec::new();
    for i in 0..routes.len() {
        for j in (i + 1)..routes.len() {
            let (a, b) = (&routes[i], &routes[j]);
            if a.meta.layer != b.meta.layer {
                continue;
            }
            if a.same_node_pair(b) {
                let separation = min_sample_separation(&polylines[i], &polylines[j]);
                if separation < config.link_separation {
                    let point = (
                        (a.path.control[1].0 + b.path.control[1].0) / 2.0,
                        (a.path.control[1].1 + b.path.control[1].1) / 2.0,
                    );
                    crossings.push(Crossing {
                        route1: i,
                        route2: j,
                        point,
                        severity: severity_for(a, b, 0.0, 0.5, 0.5),
                        kind: CrossingKind::ParallelOverlap,
                        t1: 0.5,
                        t2: 0.5,
                        angle: 0.0,
                    });
                }
                continue;
            }
            if a.endpoints_shared_with(b) {
                continue;
            }

            let pa = &polylines[i];
            let pb = &polylines[j];
            'pair: for si in 0..pa.len() - 1 {
                for sj in 0..pb.len() - 1 {
                    let Some((point, t, u)) =
                        segment_intersection(pa[si], pa[si + 1], pb[sj], pb[sj + 1])
                    else {
                        continue;
                    };
                    let t1 = (si as f32 + t) / (pa.len() - 1) as f32;
                    let t2 = (sj as f32 + u) / (pb.len() - 1) as f32;
                    let angle = segment_angle(pa[si], pa[si + 1], pb[sj], pb[sj + 1]);
                    crossings.push(Crossing {
                        route1: i,
                        route2: j,
                        point,
                        severity: severity_for(a, b, angle, t1, t2),
                        kind: classify_pair(a, b),
                        t1,
                        t2,
                        angle,
                    });
                    // One conflict per pair is enough to drive resolution.
                    break 'pair;
                }
            }
        }
    }
    crossings
}

/// Index of the route that should move: the lower-priority one, ties
/// broken toward the smaller value, then the higher index.
fn mover_of(routes: &[Route], crossing: &Crossing) -> (usize, usize) {
    let (a, b) = (crossing.route1, crossing.route2);
    let (ra, rb) = (&routes[a], &routes[b]);
    let a_moves = match ra
        .meta
        .priority
        .partial_cmp(&rb.meta.priority)
        .unwrap_or(std::cmp::Ordering::Equal)
    {
        std::cmp::Ordering::Less => true,
        std::cmp::Ordering::Greater => false,
        std::cmp::Ordering::Equal => ra.value <= rb.value,
    };
    if a_moves { (a, b) } else { (b, a) }
}

fn shift_interior(route: &mut Route, dy: f32, samples: usize) {
    route.path.control[1].1 += dy;
    route.path.control[2].1 += dy;
    route.path.rebuild(samples);
}

fn record(route: &mut Route, kind: CrossingKind, severity: f32, strategy: &str) {
    route
        .meta
        .resolved_conflicts
        .push(format!("{kind:?} s={severity:.2} {strategy}"));
}

/// Apply one type-specific nudge for a single crossing. Returns true when
/// any route changed.
fn apply_strategy(
    routes: &mut [Route],
    crossing: &Crossing,
    config: &RoutingConfig,
    rng: &mut NudgeRng,
) -> bool {
    let samples = config.effective_curve_samples();
    let separation = config.link_separation;
    let (mover, keeper) = mover_of(routes, crossing);

    match crossing.kind {
        // Parallel siblings: push the pair apart symmetrically.
        CrossingKind::ParallelOverlap => {
            let above = routes[mover].path.control[1].1 >= routes[keeper].path.control[1].1;
            let sign = if above { 1.0 } else { -1.0 };
            shift_interior(&mut routes[mover], sign * separation, samples);
            shift_interior(&mut routes[keeper], -sign * separation, samples);
            record(&mut routes[mover], crossing.kind, crossing.severity, "separate");
            record(&mut routes[keeper], crossing.kind, crossing.severity, "separate");
            true
        }
        // Two primary flows: stack them on different z-layers instead of
        // bending either backbone.
        CrossingKind::PrimaryPrimary => {
            let layer = routes[keeper].meta.layer + 1;
            if routes[mover].meta.layer == layer {
                return false;
            }
            routes[mover].meta.layer = layer;
            record(&mut routes[mover], crossing.kind, crossing.severity, "layer");
            true
        }
        // Two secondary flows: adaptive counter-curvature, falling back to
        // the generic nudge when adaptive features are off.
        CrossingKind::SecondarySecondary if config.adaptive_features => {
            let magnitude = separation * (1.0 + crossing.severity);
            shift_interior(&mut routes[mover], magnitude, samples);
            shift_interior(&mut routes[keeper], -magnitude * 0.5, samples);
            record(&mut routes[mover], crossing.kind, crossing.severity, "adaptive-curvature");
            record(&mut routes[keeper], crossing.kind, crossing.severity, "adaptive-curvature");
            true
        }
        _ => {
            let priority_gap = (routes[crossing.route1].meta.priority
                - routes[crossing.route2].meta.priority)
                .abs();
            if crossing.angle < SHALLOW_ANGLE_RAD {
                // Shallow crossings respond best to plain vertical offset.
                let sign = if routes[mover].path.control[1].1 >= crossing.point.1 {
                    1.0
                } else {
                    -1.0
                };
                shift_interior(
                    &mut routes[mover],
                    sign * separation * (1.0 + crossing.severity),
                    samples,
                );
                record(&mut routes[mover], crossing.kind, crossing.severity, "vertical-offset");
            } else if (crossing.t1 - 0.5).abs() < MIDPOINT_BAND
                && (crossing.t2 - 0.5).abs() < MIDPOINT_BAND
            {
                // Midpoint crossings: bow the mover harder away from the
                // intersection.
                let sign = if routes[mover].path.control[1].1 >= crossing.point.1 {
                    1.0
                } else {
                    -1.0
                };
                let route = &mut routes[mover];
                route.path.curvature *= 1.0 + crossing.severity * 0.5;
                shift_interior(route, sign * separation * (1.0 + crossing.severity), samples);
                record(&mut routes[mover], crossing.kind, crossing.severity, "curvature-increase");
            } else if priority_gap > PRIORITY_GAP {
                // Large priority gap: deviate the minor route around the
                // intersection point.
                let route = &mut routes[mover];
                let dx = route.path.control[3].0 - route.path.control[0].0;
                let sign = if route.path.control[1].1 >= crossing.point.1 {
                    1.0
                } else {
                    -1.0
                };
                route.path.control[1].0 -= dx * 0.05;
                route.path.control[2].0 += dx * 0.05;
                route.path.control[1].1 += sign * separation * (1.0 + crossing.severity);
                route.path.control[2].1 += sign * separation * (1.0 + crossing.severity);
                route.path.rebuild(samples);
                record(&mut routes[mover], crossing.kind, crossing.severity, "path-deviation");
            } else {
                // Generic priority-biased nudge; the one intentionally
                // randomized path in the engine.
                let dy = rng.next_signed() * separation * (1.0 + priority_gap);
                shift_interior(&mut routes[mover], dy, samples);
                record(&mut routes[mover], crossing.kind, crossing.severity, "generic-nudge");
            }
            true
        }
    }
}

/// One resolution pass: group by classification, most severe first, one
/// nudge per affected route.
pub fn resolve_conflicts(
    routes: &mut [Route],
    crossings: &[Crossing],
    config: &RoutingConfig,
    rng: &mut NudgeRng,
) -> usize {
    let mut groups: BTreeMap<CrossingKind, Vec<&Crossing>> = BTreeMap::new();
    for crossing in crossings {
        groups.entry(crossing.kind).or_default().push(crossing);
    }
    let mut touched: HashSet<usize> = HashSet::new();
    let mut applied = 0usize;
    for group in groups.values_mut() {
        group.sort_by(|a, b| {
            b.severity
                .partial_cmp(&a.severity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.route1.cmp(&b.route1))
                .then(a.route2.cmp(&b.route2))
        });
        for crossing in group.iter() {
            if touched.contains(&crossing.route1) || touched.contains(&crossing.route2) {
                continue;
            }
            if apply_strategy(routes, crossing, config, rng) {
                touched.insert(crossing.route1);
                touched.insert(crossing.route2);
                applied += 1;
            }
        }
    }
    applied
}

/// Iterative detect→resolve loop with convergence, monotonicity rollback,
/// and the last-resort separation pass. The crossing count on return is
/// never higher than the initial count.
pub fn optimize_route_set(
    routes: &mut Vec<Route>,
    config: &RoutingConfig,
    seed: u64,
    deadline: Option<Instant>,
) -> ResolutionReport {
    let mut rng = NudgeRng::new(seed);
    let mut crossings = detect_crossings(routes, config);
    let initial = crossings.len();
    let mut report = ResolutionReport {
        initial_crossings: initial,
        final_crossings: initial,
        iterations: 0,
        last_resort: false,
    };
    if initial == 0 {
        return report;
    }

    let mut current = initial;
    for _ in 0..config.max_iterations {
        if let Some(deadline) = deadline
            && Instant::now() >= deadline
        {
            debug!("optimization budget elapsed; keeping current route set");
            break;
        }
        report.iterations += 1;
        let snapshot = routes.clone();
        let applied = resolve_conflicts(routes, &crossings, config, &mut rng);
        if applied == 0 {
            break;
        }
        let next = detect_crossings(routes, config);
        if next.len() > current {
            // A pass that made things worse is rolled back wholesale.
            *routes = snapshot;
            break;
        }
        let reduction = (current - next.len()) as f32 / initial as f32;
        current = next.len();
        crossings = next;
        if current == 0 || reduction < config.convergence_threshold {
            break;
        }
    }

    // Last resort: when more than half the original conflicts survive,
    // push every touched route apart with a boosted separation, then keep
    // whichever route set detects fewer crossings. The configured
    // separation itself is never altered.
    if current * 2 > initial {
        report.last_resort = true;
        let snapshot = routes.clone();
        let boosted = config.link_separation * LAST_RESORT_SEPARATION_BOOST;
        let samples = config.effective_curve_samples();
        let mut involved: Vec<usize> = crossings
            .iter()
            .flat_map(|crossing| [crossing.route1, crossing.route2])
            .collect();
        involved.sort_unstable();
        involved.dedup();
        for (rank, &route_idx) in involved.iter().enumerate() {
            let sign = if rank % 2 == 0 { 1.0 } else { -1.0 };
            shift_interior(&mut routes[route_idx], sign * boosted, samples);
            record(
                &mut routes[route_idx],
                CrossingKind::Mixed,
                1.0,
                "last-resort-separation",
            );
        }
        let after = detect_crossings(routes, config).len();
        if after > current {
            *routes = snapshot;
        } else {
            current = after;
        }
    }

    report.final_crossings = current;
    report
}
