//! The routing orchestrator: owns the active configuration snapshot, the
//! route and hierarchy caches, and the calculation metrics. All shared
//! state lives behind one mutex, which doubles as the single-in-flight
//! guard: a second caller blocks until the current calculation finishes.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{ConfigPatch, ConfigUpdateReport, PerformanceMode, RoutingAlgorithm, RoutingConfig};
use crate::error::RoutingError;
use crate::hierarchy::{HierarchyMap, map_hierarchy};
use crate::ir::{FlowLink, FlowNode, NodeMetadataProvider, RoutingOptions};
use crate::routing::Route;
use crate::routing::calculator::{calculate_optimized_routes, fallback_routes, straight_line_routes};
use crate::routing::crossings::{ResolutionReport, optimize_route_set};

// ── Auto-optimization ───────────────────────────────────────────────
/// Fraction of the total budget a calculation may consume before the
/// engine starts degrading itself.
const AUTO_OPT_TRIGGER_FRACTION: f32 = 0.8;
/// Iteration cap imposed at tier 1 and above.
const AUTO_OPT_ITERATION_CAP: u32 = 5;
/// Highest degradation tier.
const AUTO_OPT_MAX_TIER: u8 = 3;

// ── Fallback ────────────────────────────────────────────────────────
/// Iteration cap used by the fallback configuration.
const FALLBACK_ITERATION_CAP: u32 = 3;

/// Recent calculation durations retained for percentile reporting.
const DURATION_WINDOW: usize = 256;

/// Observability snapshot returned by `RoutingEngine::performance_metrics`.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct PerformanceMetrics {
    pub total_calculations: u64,
    pub average_time_ms: f32,
    pub p50_ms: f32,
    pub p90_ms: f32,
    pub p99_ms: f32,
    /// Hits over (hits + misses); 0 before the first lookup.
    pub cache_hit_rate: f32,
    pub cache_hits: u64,
    /// Fraction of non-cached calculations that went through fallback.
    pub fallback_rate: f32,
    /// Mean fractional crossing reduction across optimized calculations.
    pub crossing_reduction: f32,
    /// Current auto-optimization tier, 0 when not degraded.
    pub auto_optimization_tier: u8,
}

#[derive(Debug, Default)]
struct MetricsState {
    total_calculations: u64,
    durations_ms: VecDeque<f32>,
    cache_hits: u64,
    cache_misses: u64,
    fallback_count: u64,
    optimized_count: u64,
    crossing_reduction_sum: f32,
}

impl MetricsState {
    fn record_duration(&mut self, elapsed: Duration) {
        if self.durations_ms.len() == DURATION_WINDOW {
            self.durations_ms.pop_front();
        }
        self.durations_ms.push_back(elapsed.as_secs_f32() * 1_000.0);
    }

    fn record_report(&mut self, report: &ResolutionReport) {
        if report.initial_crossings > 0 {
            let reduced = report.initial_crossings - report.final_crossings;
            self.crossing_reduction_sum += reduced as f32 / report.initial_crossings as f32;
            self.optimized_count += 1;
        }
    }

    fn snapshot(&self, auto_tier: u8) -> PerformanceMetrics {
        let mut sorted: Vec<f32> = self.durations_ms.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let percentile = |p: f32| -> f32 {
            if sorted.is_empty() {
                return 0.0;
            }
            let rank = (p * (sorted.len() - 1) as f32).round() as usize;
            sorted[rank.min(sorted.len() - 1)]
        };
        let lookups = self.cache_hits + self.cache_misses;
        PerformanceMetrics {
            total_calculations: self.total_calculations,
            average_time_ms: if sorted.is_empty() {
                0.0
            } else {
                sorted.iter().sum::<f32>() / sorted.len() as f32
            },
            p50_ms: percentile(0.5),
            p90_ms: percentile(0.9),
            p99_ms: percentile(0.99),
            cache_hit_rate: if lookups == 0 {
                0.0
            } else {
                self.cache_hits as f32 / lookups as f32
            },
            cache_hits: self.cache_hits,
            fallback_rate: if self.total_calculations == 0 {
                0.0
            } else {
                self.fallback_count as f32 / self.total_calculations as f32
            },
            crossing_reduction: if self.optimized_count == 0 {
                0.0
            } else {
                self.crossing_reduction_sum / self.optimized_count as f32
            },
            auto_optimization_tier: auto_tier,
        }
    }
}

/// Insertion-ordered bounded cache. Small enough that a scan-free
/// HashMap plus an order queue beats pulling in an LRU crate.
#[derive(Debug)]
struct BoundedCache<V> {
    entries: HashMap<u64, V>,
    order: VecDeque<u64>,
}

impl<V> BoundedCache<V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&self, key: u64) -> Option<&V> {
        self.entries.get(&key)
    }

    fn insert(&mut self, key: u64, value: V, cap: usize) {
        if self.entries.contains_key(&key) {
            self.entries.insert(key, value);
            return;
        }
        while self.entries.len() >= cap.max(1)
            && let Some(oldest) = self.order.pop_front()
        {
            self.entries.remove(&oldest);
        }
        self.entries.insert(key, value);
        self.order.push_back(key);
    }

    fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

struct EngineState {
    config: RoutingConfig,
    route_cache: BoundedCache<Vec<Route>>,
    hierarchy_cache: BoundedCache<HierarchyMap>,
    metrics: MetricsState,
    auto_tier: u8,
    provider: Option<Box<dyn NodeMetadataProvider>>,
}

/// The public entry point. One engine per diagram surface; cheap to keep
/// alive across recalculations because the caches live on it.
pub struct RoutingEngine {
    state: Mutex<EngineState>,
}

impl RoutingEngine {
    pub fn new(config: RoutingConfig) -> Self {
        Self::build(config, None)
    }

    pub fn with_provider(
        config: RoutingConfig,
        provider: Box<dyn NodeMetadataProvider>,
    ) -> Self {
        Self::build(config, Some(provider))
    }

    fn build(config: RoutingConfig, provider: Option<Box<dyn NodeMetadataProvider>>) -> Self {
        Self {
            state: Mutex::new(EngineState {
                config,
                route_cache: BoundedCache::new(),
                hierarchy_cache: BoundedCache::new(),
                metrics: MetricsState::default(),
                auto_tier: 0,
                provider,
            }),
        }
    }

    /// Route every link. Exactly one calculation runs at a time; callers
    /// arriving mid-calculation block on the state lock. Unless graceful
    /// degradation is disabled, every valid link comes back with a route.
    pub fn calculate_routes(
        &self,
        links: &[FlowLink],
        nodes: &[FlowNode],
        options: &RoutingOptions,
    ) -> Result<Vec<Route>, RoutingError> {
        let mut state = self.lock();
        let config = effective_config(&state.config, state.auto_tier);

        let cache_key = route_cache_key(links, nodes, &config, options);
        if config.cache_enabled {
            if let Some(routes) = state.route_cache.get(cache_key) {
                let routes = routes.clone();
                state.metrics.cache_hits += 1;
                debug!(key = cache_key, "route cache hit");
                return Ok(routes);
            }
            state.metrics.cache_misses += 1;
        }

        let start = Instant::now();
        let outcome = run_calculation(&mut state, &config, links, nodes, options, start);
        let elapsed = start.elapsed();
        state.metrics.total_calculations += 1;
        state.metrics.record_duration(elapsed);

        let routes = match outcome {
            Outcome::Primary(routes, report) => {
                if let Some(report) = report {
                    state.metrics.record_report(&report);
                }
                if config.cache_enabled {
                    let cap = config.cache_max_entries;
                    state.route_cache.insert(cache_key, routes.clone(), cap);
                }
                routes
            }
            Outcome::Fallback(routes) => {
                state.metrics.fallback_count += 1;
                routes
            }
            Outcome::Failed(err) => return Err(err),
        };

        maybe_degrade(&mut state, &config, elapsed);
        Ok(routes)
    }

    /// Re-run crossing resolution over an already-calculated route set,
    /// in place, under the current configuration.
    pub fn optimize_routes(&self, routes: &mut Vec<Route>) -> ResolutionReport {
        let mut state = self.lock();
        let config = effective_config(&state.config, state.auto_tier);
        let report = optimize_route_set(
            routes,
            &config,
            RoutingOptions::default().nudge_seed,
            None,
        );
        state.metrics.record_report(&report);
        report
    }

    /// Apply a partial configuration update. Invalid fields are dropped
    /// per field; a change to any geometry-significant field invalidates
    /// the route cache before the new snapshot takes effect.
    pub fn update_config(&self, patch: &ConfigPatch) -> ConfigUpdateReport {
        let mut state = self.lock();
        let report = state.config.apply_patch(patch);
        for rejected in &report.rejected {
            warn!(field = rejected.field, reason = %rejected.reason, "config field rejected");
        }
        if report.cache_invalidated {
            state.route_cache.clear();
            state.hierarchy_cache.clear();
        }
        report
    }

    /// The active configuration snapshot, before auto-optimization tiers.
    pub fn config(&self) -> RoutingConfig {
        self.lock().config.clone()
    }

    pub fn clear_cache(&self) {
        let mut state = self.lock();
        state.route_cache.clear();
        state.hierarchy_cache.clear();
    }

    pub fn performance_metrics(&self) -> PerformanceMetrics {
        let state = self.lock();
        state.metrics.snapshot(state.auto_tier)
    }

    /// Undo any self-imposed degradation from slow calculations.
    pub fn reset_auto_optimization(&self) {
        self.lock().auto_tier = 0;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EngineState> {
        // A panic mid-calculation leaves no torn state worth keeping.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

enum Outcome {
    Primary(Vec<Route>, Option<ResolutionReport>),
    Fallback(Vec<Route>),
    Failed(RoutingError),
}

fn run_calculation(
    state: &mut EngineState,
    config: &RoutingConfig,
    links: &[FlowLink],
    nodes: &[FlowNode],
    options: &RoutingOptions,
    start: Instant,
) -> Outcome {
    let total = Duration::from_millis(config.max_calculation_time_ms);
    let hierarchy_deadline = start + total.mul_f32(config.hierarchy_time_fraction);
    let calculation_deadline = start
        + total.mul_f32(config.hierarchy_time_fraction + config.calculation_time_fraction);
    let final_deadline = start + total;

    match primary_routes(
        state,
        config,
        links,
        nodes,
        options,
        hierarchy_deadline,
        calculation_deadline,
        final_deadline,
    ) {
        Ok((routes, report)) => Outcome::Primary(routes, report),
        Err(err) if err.recoverable() => {
            warn!(error = %err, "primary routing failed; falling back");
            let fallback_config = fallback_config(config);
            match fallback_routes(links, nodes, &fallback_config) {
                Ok(routes) => Outcome::Fallback(routes),
                Err(fallback_err) if config.graceful_degradation => {
                    warn!(error = %fallback_err, "fallback failed; using straight lines");
                    Outcome::Fallback(straight_line_routes(links, nodes, &fallback_config))
                }
                Err(fallback_err) => Outcome::Failed(RoutingError::FallbackFailed {
                    source: Box::new(fallback_err),
                }),
            }
        }
        Err(err) => Outcome::Failed(err),
    }
}

#[allow(clippy::too_many_arguments)]
fn primary_routes(
    state: &mut EngineState,
    config: &RoutingConfig,
    links: &[FlowLink],
    nodes: &[FlowNode],
    options: &RoutingOptions,
    hierarchy_deadline: Instant,
    calculation_deadline: Instant,
    final_deadline: Instant,
) -> Result<(Vec<Route>, Option<ResolutionReport>), RoutingError> {
    let hierarchy_key = hierarchy_cache_key(links, nodes, config);
    let hierarchy = match state.hierarchy_cache.get(hierarchy_key) {
        Some(cached) => cached.clone(),
        None => {
            let built = map_hierarchy(
                nodes,
                links,
                state.provider.as_deref(),
                config,
                Some(hierarchy_deadline),
            )?;
            if config.cache_enabled {
                let cap = config.cache_max_entries;
                state
                    .hierarchy_cache
                    .insert(hierarchy_key, built.clone(), cap);
            }
            built
        }
    };

    let algorithm = options.algorithm.unwrap_or(config.algorithm);
    let mut routes = calculate_optimized_routes(
        links,
        nodes,
        &hierarchy,
        config,
        algorithm,
        Some(calculation_deadline),
    )?;

    let report = if options.skip_optimization {
        None
    } else {
        Some(optimize_route_set(
            &mut routes,
            config,
            options.nudge_seed,
            Some(final_deadline),
        ))
    };
    Ok((routes, report))
}

/// Simpler algorithm, fewer iterations, adaptive features off.
fn fallback_config(config: &RoutingConfig) -> RoutingConfig {
    let mut fallback = config.clone();
    fallback.algorithm = RoutingAlgorithm::ArcMinimal;
    fallback.max_iterations = config.max_iterations.min(FALLBACK_ITERATION_CAP);
    fallback.adaptive_features = false;
    fallback
}

/// The configured snapshot with the current degradation tier applied.
/// The stored config is never mutated by degradation.
fn effective_config(config: &RoutingConfig, tier: u8) -> RoutingConfig {
    let mut effective = config.clone();
    if tier >= 1 {
        effective.max_iterations = effective.max_iterations.min(AUTO_OPT_ITERATION_CAP);
    }
    if tier >= 2 {
        effective.adaptive_features = false;
    }
    if tier >= 3 {
        effective.performance_mode = PerformanceMode::Performance;
    }
    effective
}

fn maybe_degrade(state: &mut EngineState, config: &RoutingConfig, elapsed: Duration) {
    let budget = Duration::from_millis(config.max_calculation_time_ms);
    if elapsed > budget.mul_f32(AUTO_OPT_TRIGGER_FRACTION) && state.auto_tier < AUTO_OPT_MAX_TIER {
        state.auto_tier += 1;
        warn!(
            tier = state.auto_tier,
            elapsed_ms = elapsed.as_millis() as u64,
            "slow calculation; raising auto-optimization tier"
        );
    }
}

fn route_cache_key(
    links: &[FlowLink],
    nodes: &[FlowNode],
    config: &RoutingConfig,
    options: &RoutingOptions,
) -> u64 {
    let mut hasher = std::hash::DefaultHasher::new();
    hash_json(&mut hasher, links);
    hash_json(&mut hasher, nodes);
    hash_json(&mut hasher, config);
    hash_json(&mut hasher, options);
    hasher.finish()
}

fn hierarchy_cache_key(links: &[FlowLink], nodes: &[FlowNode], config: &RoutingConfig) -> u64 {
    let mut hasher = std::hash::DefaultHasher::new();
    hash_json(&mut hasher, links);
    hash_json(&mut hasher, nodes);
    // Every config field the hierarchy bakes into its output: box shape,
    // hub typing, and the flow weights behind `FlowRef::priority`.
    config.hub_degree_threshold.hash(&mut hasher);
    config.node_width.to_bits().hash(&mut hasher);
    config.node_height_scale.to_bits().hash(&mut hasher);
    config.primary_flow_weight.to_bits().hash(&mut hasher);
    config.secondary_flow_weight.to_bits().hash(&mut hasher);
    config.transformation_flow_weight.to_bits().hash(&mut hasher);
    config.distribution_flow_weight.to_bits().hash(&mut hasher);
    hasher.finish()
}

/// Hash a value via its canonical JSON form. Slower than a derived Hash
/// but stable across the f32 fields, and the inputs are small.
fn hash_json<T: Serialize + ?Sized>(hasher: &mut std::hash::DefaultHasher, value: &T) {
    match serde_json::to_string(value) {
        Ok(json) => json.hash(hasher),
        Err(_) => 0u8.hash(hasher),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::NodeBreakdown;

    fn simple_inputs() -> (Vec<FlowNode>, Vec<FlowLink>) {
        let nodes = vec![
            FlowNode::new("Coal", 0.1, 0.3),
            FlowNode::new("Power Plant", 0.5, 0.4),
            FlowNode::new("Homes", 0.9, 0.5),
        ];
        let links = vec![FlowLink::new(0, 1, 12.0), FlowLink::new(1, 2, 9.0)];
        (nodes, links)
    }

    #[test]
    fn every_link_gets_a_route() {
        let (nodes, links) = simple_inputs();
        let engine = RoutingEngine::new(RoutingConfig::default());
        let routes = engine
            .calculate_routes(&links, &nodes, &RoutingOptions::default())
            .unwrap();
        assert_eq!(routes.len(), links.len());
        for route in &routes {
            assert!(route.path.svg_path.starts_with("M "));
        }
    }

    #[test]
    fn identical_calls_hit_the_cache() {
        let (nodes, links) = simple_inputs();
        let engine = RoutingEngine::new(RoutingConfig::default());
        let options = RoutingOptions::default();
        let first = engine.calculate_routes(&links, &nodes, &options).unwrap();
        let second = engine.calculate_routes(&links, &nodes, &options).unwrap();
        assert_eq!(first, second);
        let metrics = engine.performance_metrics();
        assert_eq!(metrics.cache_hits, 1);
        assert_eq!(metrics.total_calculations, 1);
    }

    #[test]
    fn significant_config_change_invalidates_cache() {
        let (nodes, links) = simple_inputs();
        let engine = RoutingEngine::new(RoutingConfig::default());
        let options = RoutingOptions::default();
        engine.calculate_routes(&links, &nodes, &options).unwrap();

        let report = engine.update_config(&ConfigPatch {
            curvature: Some(0.5),
            ..ConfigPatch::default()
        });
        assert!(report.cache_invalidated);

        engine.calculate_routes(&links, &nodes, &options).unwrap();
        let metrics = engine.performance_metrics();
        assert_eq!(metrics.cache_hits, 0);
        assert_eq!(metrics.total_calculations, 2);
    }

    #[test]
    fn rejected_config_field_keeps_prior_value() {
        let engine = RoutingEngine::new(RoutingConfig::default());
        let before = engine.config().curvature;
        let report = engine.update_config(&ConfigPatch {
            curvature: Some(5.0),
            ..ConfigPatch::default()
        });
        assert!(!report.changed("curvature"));
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(engine.config().curvature, before);
    }

    #[test]
    fn clear_cache_forces_recalculation() {
        let (nodes, links) = simple_inputs();
        let engine = RoutingEngine::new(RoutingConfig::default());
        let options = RoutingOptions::default();
        engine.calculate_routes(&links, &nodes, &options).unwrap();
        engine.clear_cache();
        engine.calculate_routes(&links, &nodes, &options).unwrap();
        assert_eq!(engine.performance_metrics().total_calculations, 2);
    }

    #[test]
    fn invalid_link_falls_back_instead_of_erroring() {
        let (nodes, mut links) = simple_inputs();
        links.push(FlowLink::new(0, 99, 4.0));
        let engine = RoutingEngine::new(RoutingConfig::default());
        let routes = engine
            .calculate_routes(&links, &nodes, &RoutingOptions::default())
            .unwrap();
        // The out-of-range link is dropped; the valid ones survive.
        assert_eq!(routes.len(), 2);
        assert!(engine.performance_metrics().fallback_rate > 0.0);
    }

    #[test]
    fn degradation_tiers_reduce_the_effective_config() {
        let config = RoutingConfig::default();
        let tier0 = effective_config(&config, 0);
        assert_eq!(tier0, config);
        let tier1 = effective_config(&config, 1);
        assert_eq!(tier1.max_iterations, AUTO_OPT_ITERATION_CAP);
        let tier2 = effective_config(&config, 2);
        assert!(!tier2.adaptive_features);
        let tier3 = effective_config(&config, 3);
        assert_eq!(tier3.performance_mode, PerformanceMode::Performance);
    }

    #[test]
    fn metrics_percentiles_are_ordered() {
        let mut metrics = MetricsState::default();
        for ms in [1.0f32, 2.0, 3.0, 40.0, 5.0, 6.0] {
            metrics.record_duration(Duration::from_secs_f32(ms / 1_000.0));
        }
        let snapshot = metrics.snapshot(0);
        assert!(snapshot.p50_ms <= snapshot.p90_ms);
        assert!(snapshot.p90_ms <= snapshot.p99_ms);
        assert!(snapshot.average_time_ms > 0.0);
    }

    struct StaticProvider;

    impl NodeMetadataProvider for StaticProvider {
        fn node_breakdown(&self, name: &str) -> Option<NodeBreakdown> {
            (name == "Power Plant").then(|| NodeBreakdown {
                category: Some("transformation".into()),
                energy_type: Some("electricity".into()),
                level: Some(2),
            })
        }
    }

    #[test]
    fn provider_backed_engine_routes_normally() {
        let (nodes, links) = simple_inputs();
        let engine =
            RoutingEngine::with_provider(RoutingConfig::default(), Box::new(StaticProvider));
        let routes = engine
            .calculate_routes(&links, &nodes, &RoutingOptions::default())
            .unwrap();
        assert_eq!(routes.len(), 2);
    }

    #[test]
    fn hierarchy_key_tracks_flow_weights() {
        let (nodes, links) = simple_inputs();
        let config = RoutingConfig::default();
        let base = hierarchy_cache_key(&links, &nodes, &config);
        assert_eq!(base, hierarchy_cache_key(&links, &nodes, &config));

        // A weight-only change feeds FlowRef::priority, so it must miss
        // the cached map.
        let reweighted = RoutingConfig {
            secondary_flow_weight: 0.5,
            ..config.clone()
        };
        assert_ne!(base, hierarchy_cache_key(&links, &nodes, &reweighted));

        // Curvature does not affect the hierarchy; the key may stay put.
        let curved = RoutingConfig {
            curvature: 0.7,
            ..config
        };
        assert_eq!(base, hierarchy_cache_key(&links, &nodes, &curved));
    }

    #[test]
    fn bounded_cache_evicts_oldest() {
        let mut cache: BoundedCache<u32> = BoundedCache::new();
        cache.insert(1, 10, 2);
        cache.insert(2, 20, 2);
        cache.insert(3, 30, 2);
        assert!(cache.get(1).is_none());
        assert_eq!(cache.get(2), Some(&20));
        assert_eq!(cache.get(3), Some(&30));
    }
}
