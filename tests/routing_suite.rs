//! End-to-end routing scenarios exercised through the public engine
//! surface.

use std::thread::sleep;
use std::time::{Duration, Instant};

use sankey_router::routing::crossings::detect_crossings;
use sankey_router::{
    ConfigPatch, FlowLink, FlowNode, NodeBreakdown, NodeMetadataProvider, RoutingConfig,
    RoutingEngine, RoutingOptions,
};

fn x_pattern() -> (Vec<FlowNode>, Vec<FlowLink>) {
    let nodes = vec![
        FlowNode::new("A", 0.0, 0.2),
        FlowNode::new("B", 1.0, 0.2),
        FlowNode::new("C", 0.0, 0.8),
        FlowNode::new("D", 1.0, 0.8),
    ];
    let links = vec![FlowLink::new(0, 3, 10.0), FlowLink::new(2, 1, 10.0)];
    (nodes, links)
}

fn energy_chain() -> (Vec<FlowNode>, Vec<FlowLink>) {
    let nodes = vec![
        FlowNode::new("Coal", 0.05, 0.2),
        FlowNode::new("Gas", 0.05, 0.5),
        FlowNode::new("Power Station", 0.45, 0.35),
        FlowNode::new("Grid", 0.7, 0.35),
        FlowNode::new("Homes", 0.95, 0.2),
        FlowNode::new("Industry", 0.95, 0.6),
    ];
    let links = vec![
        FlowLink::new(0, 2, 40.0),
        FlowLink::new(1, 2, 25.0),
        FlowLink::new(2, 3, 60.0),
        FlowLink::new(3, 4, 35.0),
        FlowLink::new(3, 5, 25.0),
    ];
    (nodes, links)
}

#[test]
fn crossing_x_resolves_to_zero() {
    let (nodes, links) = x_pattern();
    let engine = RoutingEngine::new(RoutingConfig::default());

    let unoptimized = engine
        .calculate_routes(
            &links,
            &nodes,
            &RoutingOptions {
                skip_optimization: true,
                ..RoutingOptions::default()
            },
        )
        .unwrap();
    let initial = detect_crossings(&unoptimized, &engine.config());
    assert_eq!(initial.len(), 1, "the X pattern crosses exactly once");

    let optimized = engine
        .calculate_routes(&links, &nodes, &RoutingOptions::default())
        .unwrap();
    let remaining = detect_crossings(&optimized, &engine.config());
    assert!(remaining.is_empty(), "default config resolves the X fully");
}

#[test]
fn parallel_group_gets_symmetric_offsets() {
    let nodes = vec![FlowNode::new("A", 0.1, 0.5), FlowNode::new("B", 0.9, 0.5)];
    let links = vec![
        FlowLink::new(0, 1, 5.0),
        FlowLink::new(0, 1, 10.0),
        FlowLink::new(0, 1, 15.0),
    ];
    let engine = RoutingEngine::new(RoutingConfig::default());
    let routes = engine
        .calculate_routes(
            &links,
            &nodes,
            &RoutingOptions {
                skip_optimization: true,
                ..RoutingOptions::default()
            },
        )
        .unwrap();

    let infos: Vec<_> = routes
        .iter()
        .map(|route| route.meta.multi_link.expect("grouped route"))
        .collect();
    assert!(infos.iter().all(|info| info.group_size == 3));

    let mut offsets: Vec<f32> = infos.iter().map(|info| info.offset).collect();
    let sum: f32 = offsets.iter().sum();
    assert!(sum.abs() < 1e-6, "offsets are zero-sum, got {sum}");
    offsets.sort_by(|a, b| a.partial_cmp(b).unwrap());
    assert!(offsets[0] < offsets[1] && offsets[1] < offsets[2]);

    // Ranks run in descending value order, so the largest link sits first.
    assert_eq!(infos[2].position, 0);
    assert_eq!(infos[0].position, 2);
}

struct SlowProvider;

impl NodeMetadataProvider for SlowProvider {
    fn node_breakdown(&self, _name: &str) -> Option<NodeBreakdown> {
        sleep(Duration::from_millis(5));
        None
    }
}

#[test]
fn timeout_falls_back_without_erroring() {
    let (nodes, links) = energy_chain();
    let engine = RoutingEngine::with_provider(RoutingConfig::default(), Box::new(SlowProvider));
    engine.update_config(&ConfigPatch {
        max_calculation_time_ms: Some(1),
        ..ConfigPatch::default()
    });

    let started = Instant::now();
    let routes = engine
        .calculate_routes(&links, &nodes, &RoutingOptions::default())
        .unwrap();
    assert!(!routes.is_empty(), "fallback still produces routes");
    assert_eq!(routes.len(), links.len());
    assert!(
        started.elapsed() < Duration::from_secs(2),
        "soft timeout keeps the overhead bounded"
    );
    assert!(engine.performance_metrics().fallback_rate > 0.0);
}

#[test]
fn out_of_range_update_is_rejected_per_field() {
    let engine = RoutingEngine::new(RoutingConfig::default());
    let before = engine.config();

    let report = engine.update_config(&ConfigPatch {
        curvature: Some(5.0),
        max_iterations: Some(20),
        ..ConfigPatch::default()
    });

    assert!(!report.changed("curvature"));
    assert!(report.changed("max_iterations"));
    let after = engine.config();
    assert_eq!(after.curvature, before.curvature);
    assert_eq!(after.max_iterations, 20);
}

#[test]
fn identical_inputs_are_idempotent_and_cached() {
    let (nodes, links) = energy_chain();
    let engine = RoutingEngine::new(RoutingConfig::default());
    let options = RoutingOptions::default();

    let first = engine.calculate_routes(&links, &nodes, &options).unwrap();
    let second = engine.calculate_routes(&links, &nodes, &options).unwrap();
    assert_eq!(first, second);

    let metrics = engine.performance_metrics();
    assert_eq!(metrics.total_calculations, 1);
    assert_eq!(metrics.cache_hits, 1);
    assert!(metrics.cache_hit_rate > 0.0);
}

#[test]
fn cold_cache_runs_are_deterministic() {
    let (nodes, links) = energy_chain();
    let options = RoutingOptions::default();

    let run = || {
        let engine = RoutingEngine::new(RoutingConfig::default());
        engine.calculate_routes(&links, &nodes, &options).unwrap()
    };
    let first = run();
    let second = run();
    for (a, b) in first.iter().zip(&second) {
        assert_eq!(a.path.control, b.path.control);
        assert_eq!(a.path.svg_path, b.path.svg_path);
    }
}

#[test]
fn resolution_never_increases_crossings() {
    let (nodes, links) = x_pattern();
    let engine = RoutingEngine::new(RoutingConfig::default());
    let config = engine.config();

    let mut routes = engine
        .calculate_routes(
            &links,
            &nodes,
            &RoutingOptions {
                skip_optimization: true,
                ..RoutingOptions::default()
            },
        )
        .unwrap();
    let before = detect_crossings(&routes, &config).len();
    let report = engine.optimize_routes(&mut routes);
    assert_eq!(report.initial_crossings, before);
    assert!(report.final_crossings <= before);
    assert!(detect_crossings(&routes, &config).len() <= before);
}

#[test]
fn disjoint_routes_report_no_crossings() {
    let nodes = vec![
        FlowNode::new("A", 0.1, 0.1),
        FlowNode::new("B", 0.9, 0.1),
        FlowNode::new("C", 0.1, 0.9),
        FlowNode::new("D", 0.9, 0.9),
    ];
    let links = vec![FlowLink::new(0, 1, 8.0), FlowLink::new(2, 3, 8.0)];
    let engine = RoutingEngine::new(RoutingConfig::default());
    let routes = engine
        .calculate_routes(&links, &nodes, &RoutingOptions::default())
        .unwrap();
    assert!(detect_crossings(&routes, &engine.config()).is_empty());
}

#[test]
fn shared_endpoint_routes_never_cross() {
    let nodes = vec![
        FlowNode::new("Hub", 0.1, 0.5),
        FlowNode::new("North", 0.9, 0.1),
        FlowNode::new("South", 0.9, 0.9),
    ];
    let links = vec![FlowLink::new(0, 1, 10.0), FlowLink::new(0, 2, 10.0)];
    let engine = RoutingEngine::new(RoutingConfig::default());
    let routes = engine
        .calculate_routes(&links, &nodes, &RoutingOptions::default())
        .unwrap();
    assert!(detect_crossings(&routes, &engine.config()).is_empty());
}

#[test]
fn dense_graph_routes_every_link_and_stays_monotone() {
    // 3 columns x 4 rows, each node feeding the aligned and the mirrored
    // node of the next column, so crossings pile up mid-diagram.
    let mut nodes = Vec::new();
    for col in 0..3 {
        for row in 0..4 {
            nodes.push(FlowNode::new(
                format!("n{col}_{row}"),
                col as f32 / 2.0,
                (row as f32 + 0.5) / 4.0,
            ));
        }
    }
    let mut links = Vec::new();
    for col in 0..2 {
        for row in 0..4 {
            let from = col * 4 + row;
            links.push(FlowLink::new(from, (col + 1) * 4 + row, 10.0 + row as f32));
            links.push(FlowLink::new(from, (col + 1) * 4 + (3 - row), 4.0 + row as f32));
        }
    }

    let engine = RoutingEngine::new(RoutingConfig::default());
    let config = engine.config();
    let mut routes = engine
        .calculate_routes(
            &links,
            &nodes,
            &RoutingOptions {
                skip_optimization: true,
                ..RoutingOptions::default()
            },
        )
        .unwrap();
    assert_eq!(routes.len(), links.len(), "every link gets a route");

    let before = detect_crossings(&routes, &config).len();
    let report = engine.optimize_routes(&mut routes);
    assert_eq!(report.initial_crossings, before);
    assert!(report.final_crossings <= before);
    assert!(detect_crossings(&routes, &config).len() <= before);

    let full = engine
        .calculate_routes(&links, &nodes, &RoutingOptions::default())
        .unwrap();
    assert_eq!(full.len(), links.len());
}

#[test]
fn graceful_degradation_off_surfaces_errors() {
    let nodes = vec![FlowNode::new("A", 0.1, 0.5)];
    let links = vec![FlowLink::new(0, 9, 10.0)];
    let engine = RoutingEngine::new(RoutingConfig {
        graceful_degradation: false,
        ..RoutingConfig::default()
    });
    let result = engine.calculate_routes(&links, &nodes, &RoutingOptions::default());
    assert!(result.is_err());
}

#[test]
fn algorithm_override_applies_per_call() {
    use sankey_router::RoutingAlgorithm;

    let (nodes, links) = energy_chain();
    let engine = RoutingEngine::new(RoutingConfig {
        cache_enabled: false,
        ..RoutingConfig::default()
    });
    let base = engine
        .calculate_routes(
            &links,
            &nodes,
            &RoutingOptions {
                skip_optimization: true,
                ..RoutingOptions::default()
            },
        )
        .unwrap();
    let smooth = engine
        .calculate_routes(
            &links,
            &nodes,
            &RoutingOptions {
                algorithm: Some(RoutingAlgorithm::SplineSmooth),
                skip_optimization: true,
                ..RoutingOptions::default()
            },
        )
        .unwrap();
    let pairs = base.iter().zip(&smooth);
    assert!(
        pairs.clone().any(|(a, b)| a.path.control != b.path.control),
        "spline-smooth bends harder than the default"
    );
    for (a, b) in pairs {
        assert_eq!(a.path.control[0], b.path.control[0]);
        assert_eq!(a.path.control[3], b.path.control[3]);
    }
}
