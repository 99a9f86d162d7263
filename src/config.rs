use std::path::Path;

use serde::{Deserialize, Serialize};

/// Curve construction variants. All three share one procedure and differ
/// only in the curvature scale they apply.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingAlgorithm {
    #[default]
    BezierOptimized,
    SplineSmooth,
    ArcMinimal,
}

impl RoutingAlgorithm {
    pub fn curvature_scale(self) -> f32 {
        match self {
            RoutingAlgorithm::BezierOptimized => 1.0,
            RoutingAlgorithm::SplineSmooth => 1.3,
            RoutingAlgorithm::ArcMinimal => 0.6,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RoutingAlgorithm::BezierOptimized => "bezier-optimized",
            RoutingAlgorithm::SplineSmooth => "spline-smooth",
            RoutingAlgorithm::ArcMinimal => "arc-minimal",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PerformanceMode {
    Quality,
    #[default]
    Balanced,
    Performance,
}

impl PerformanceMode {
    pub fn as_str(self) -> &'static str {
        match self {
            PerformanceMode::Quality => "quality",
            PerformanceMode::Balanced => "balanced",
            PerformanceMode::Performance => "performance",
        }
    }

    /// Sample-count multiplier; Performance trades curve fidelity for time.
    pub fn sample_scale(self) -> f32 {
        match self {
            PerformanceMode::Quality => 1.5,
            PerformanceMode::Balanced => 1.0,
            PerformanceMode::Performance => 0.6,
        }
    }
}

/// The flat, versioned routing configuration. One canonical snapshot is
/// active in the engine at a time; calculators receive a copy by value and
/// never observe a mid-calculation change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutingConfig {
    pub version: u32,

    // Curve geometry
    /// Base curvature of every link curve, in [0, 1].
    pub curvature: f32,
    /// Target vertical separation between parallel links, normalized units.
    pub link_separation: f32,
    /// Margin added around node boxes during collision avoidance.
    pub node_margin: f32,
    /// Radius of recorded avoidance zones around pierced nodes.
    pub avoidance_radius: f32,
    pub algorithm: RoutingAlgorithm,
    pub performance_mode: PerformanceMode,

    // Iteration bounds
    /// Cap on detect→resolve passes in the crossing resolver.
    pub max_iterations: u32,
    /// Cap on per-curve node-collision shift passes.
    pub collision_iteration_cap: u32,
    /// Samples per curve for collision avoidance and rendering polylines.
    pub curve_samples: usize,
    /// Samples per curve for crossing detection.
    pub detection_samples: usize,
    /// Stop iterating when the fractional crossing reduction since the
    /// first pass drops below this value.
    pub convergence_threshold: f32,

    // Time budgets
    pub max_calculation_time_ms: u64,
    /// Fraction of the total budget granted to hierarchy mapping.
    pub hierarchy_time_fraction: f32,
    /// Fraction of the total budget granted to route calculation.
    pub calculation_time_fraction: f32,

    // Flow-type priority weights
    pub primary_flow_weight: f32,
    pub secondary_flow_weight: f32,
    pub transformation_flow_weight: f32,
    pub distribution_flow_weight: f32,

    // Behavior switches
    pub adaptive_features: bool,
    pub graceful_degradation: bool,
    pub cache_enabled: bool,
    pub cache_max_entries: usize,

    // Hierarchy shape
    /// Combined degree at or above which a node is re-typed as a hub.
    pub hub_degree_threshold: usize,
    /// Node box width in normalized units.
    pub node_width: f32,
    /// Node box height per unit of normalized total flow.
    pub node_height_scale: f32,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            version: 1,
            curvature: 0.3,
            link_separation: 0.02,
            node_margin: 0.01,
            avoidance_radius: 0.05,
            algorithm: RoutingAlgorithm::BezierOptimized,
            performance_mode: PerformanceMode::Balanced,
            max_iterations: 10,
            collision_iteration_cap: 8,
            curve_samples: 20,
            detection_samples: 30,
            convergence_threshold: 0.05,
            max_calculation_time_ms: 5_000,
            hierarchy_time_fraction: 0.3,
            calculation_time_fraction: 0.6,
            primary_flow_weight: 1.0,
            secondary_flow_weight: 0.8,
            transformation_flow_weight: 0.6,
            distribution_flow_weight: 0.4,
            adaptive_features: true,
            graceful_degradation: true,
            cache_enabled: true,
            cache_max_entries: 64,
            hub_degree_threshold: 6,
            node_width: 0.02,
            node_height_scale: 0.15,
        }
    }
}

/// Partial configuration update. Every field mirrors `RoutingConfig`;
/// absent fields leave the active value untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigPatch {
    pub curvature: Option<f32>,
    pub link_separation: Option<f32>,
    pub node_margin: Option<f32>,
    pub avoidance_radius: Option<f32>,
    pub algorithm: Option<RoutingAlgorithm>,
    pub performance_mode: Option<PerformanceMode>,
    pub max_iterations: Option<u32>,
    pub collision_iteration_cap: Option<u32>,
    pub curve_samples: Option<usize>,
    pub detection_samples: Option<usize>,
    pub convergence_threshold: Option<f32>,
    pub max_calculation_time_ms: Option<u64>,
    pub hierarchy_time_fraction: Option<f32>,
    pub calculation_time_fraction: Option<f32>,
    pub primary_flow_weight: Option<f32>,
    pub secondary_flow_weight: Option<f32>,
    pub transformation_flow_weight: Option<f32>,
    pub distribution_flow_weight: Option<f32>,
    pub adaptive_features: Option<bool>,
    pub graceful_degradation: Option<bool>,
    pub cache_enabled: Option<bool>,
    pub cache_max_entries: Option<usize>,
    pub hub_degree_threshold: Option<usize>,
    pub node_width: Option<f32>,
    pub node_height_scale: Option<f32>,
}

/// Outcome of a single rejected patch field.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RejectedField {
    pub field: &'static str,
    pub reason: String,
}

/// Outcome of `RoutingEngine::update_config`. Invalid fields are dropped,
/// never fatal; the caller can inspect what actually changed.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ConfigUpdateReport {
    pub applied: Vec<&'static str>,
    pub rejected: Vec<RejectedField>,
    /// True when a geometry-significant field changed and the route cache
    /// was invalidated.
    pub cache_invalidated: bool,
}

impl ConfigUpdateReport {
    pub fn changed(&self, field: &str) -> bool {
        self.applied.iter().any(|name| *name == field)
    }
}

/// Fields whose change alters route geometry; updating any of them must
/// invalidate the route cache before new entries are written.
const SIGNIFICANT_FIELDS: [&str; 8] = [
    "curvature",
    "link_separation",
    "node_margin",
    "avoidance_radius",
    "algorithm",
    "performance_mode",
    "max_iterations",
    "collision_iteration_cap",
];

impl RoutingConfig {
    /// Apply a partial update, validating field by field. Out-of-range
    /// values are reported and skipped; in-range values replace the
    /// current ones and bump the snapshot version.
    pub fn apply_patch(&mut self, patch: &ConfigPatch) -> ConfigUpdateReport {
        let mut report = ConfigUpdateReport::default();

        macro_rules! ranged {
            ($field:ident, $lo:expr, $hi:expr) => {
                if let Some(value) = patch.$field {
                    if value >= $lo && value <= $hi {
                        if self.$field != value {
                            self.$field = value;
                            report.applied.push(stringify!($field));
                        }
                    } else {
                        report.rejected.push(RejectedField {
                            field: stringify!($field),
                            reason: format!(
                                "{value} outside [{lo}, {hi}]",
                                lo = $lo,
                                hi = $hi
                            ),
                        });
                    }
                }
            };
        }
        macro_rules! plain {
            ($field:ident) => {
                if let Some(value) = patch.$field {
                    if self.$field != value {
                        self.$field = value;
                        report.applied.push(stringify!($field));
                    }
                }
            };
        }

        ranged!(curvature, 0.0, 1.0);
        ranged!(link_separation, 0.0, 0.2);
        ranged!(node_margin, 0.0, 0.1);
        ranged!(avoidance_radius, 0.0, 0.3);
        plain!(algorithm);
        plain!(performance_mode);
        ranged!(max_iterations, 1, 100);
        ranged!(collision_iteration_cap, 1, 50);
        ranged!(curve_samples, 8, 200);
        ranged!(detection_samples, 8, 200);
        ranged!(convergence_threshold, 0.0, 1.0);
        ranged!(max_calculation_time_ms, 1, 600_000);
        ranged!(hierarchy_time_fraction, 0.05, 0.9);
        ranged!(calculation_time_fraction, 0.05, 0.9);
        ranged!(primary_flow_weight, 0.0, 2.0);
        ranged!(secondary_flow_weight, 0.0, 2.0);
        ranged!(transformation_flow_weight, 0.0, 2.0);
        ranged!(distribution_flow_weight, 0.0, 2.0);
        plain!(adaptive_features);
        plain!(graceful_degradation);
        plain!(cache_enabled);
        ranged!(cache_max_entries, 1, 4096);
        ranged!(hub_degree_threshold, 2, 64);
        ranged!(node_width, 0.001, 0.2);
        ranged!(node_height_scale, 0.01, 1.0);

        report.cache_invalidated = report
            .applied
            .iter()
            .any(|field| SIGNIFICANT_FIELDS.contains(field));
        if !report.applied.is_empty() {
            self.version += 1;
        }
        report
    }

    /// Effective per-curve sample count after the performance mode scaling.
    pub fn effective_curve_samples(&self) -> usize {
        ((self.curve_samples as f32 * self.performance_mode.sample_scale()) as usize).max(8)
    }

    pub fn effective_detection_samples(&self) -> usize {
        ((self.detection_samples as f32 * self.performance_mode.sample_scale()) as usize).max(8)
    }
}

/// One entry of the flat configuration schema a host UI can turn into
/// controls.
#[derive(Debug, Clone, Serialize)]
pub struct ConfigFieldSchema {
    pub name: &'static str,
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub variants: Vec<&'static str>,
    pub default: serde_json::Value,
    pub description: &'static str,
}

fn number(
    name: &'static str,
    min: f64,
    max: f64,
    default: f64,
    description: &'static str,
) -> ConfigFieldSchema {
    ConfigFieldSchema {
        name,
        kind: "number",
        min: Some(min),
        max: Some(max),
        variants: Vec::new(),
        default: serde_json::json!(default),
        description,
    }
}

fn integer(
    name: &'static str,
    min: f64,
    max: f64,
    default: u64,
    description: &'static str,
) -> ConfigFieldSchema {
    ConfigFieldSchema {
        name,
        kind: "integer",
        min: Some(min),
        max: Some(max),
        variants: Vec::new(),
        default: serde_json::json!(default),
        description,
    }
}

fn boolean(name: &'static str, default: bool, description: &'static str) -> ConfigFieldSchema {
    ConfigFieldSchema {
        name,
        kind: "boolean",
        min: None,
        max: None,
        variants: Vec::new(),
        default: serde_json::json!(default),
        description,
    }
}

fn choice(
    name: &'static str,
    variants: &[&'static str],
    default: &'static str,
    description: &'static str,
) -> ConfigFieldSchema {
    ConfigFieldSchema {
        name,
        kind: "enum",
        min: None,
        max: None,
        variants: variants.to_vec(),
        default: serde_json::json!(default),
        description,
    }
}

/// The full schema, kept in declaration order of `RoutingConfig`.
pub fn config_schema() -> Vec<ConfigFieldSchema> {
    let defaults = RoutingConfig::default();
    vec![
        number(
            "curvature",
            0.0,
            1.0,
            defaults.curvature as f64,
            "Base curvature applied to every link curve",
        ),
        number(
            "link_separation",
            0.0,
            0.2,
            defaults.link_separation as f64,
            "Vertical separation between parallel links",
        ),
        number(
            "node_margin",
            0.0,
            0.1,
            defaults.node_margin as f64,
            "Margin around node boxes during collision avoidance",
        ),
        number(
            "avoidance_radius",
            0.0,
            0.3,
            defaults.avoidance_radius as f64,
            "Radius of avoidance zones recorded around pierced nodes",
        ),
        choice(
            "algorithm",
            &["bezier-optimized", "spline-smooth", "arc-minimal"],
            defaults.algorithm.as_str(),
            "Curve construction variant",
        ),
        choice(
            "performance_mode",
            &["quality", "balanced", "performance"],
            defaults.performance_mode.as_str(),
            "Trade curve fidelity against calculation time",
        ),
        integer(
            "max_iterations",
            1.0,
            100.0,
            defaults.max_iterations as u64,
            "Cap on crossing-resolution passes",
        ),
        integer(
            "collision_iteration_cap",
            1.0,
            50.0,
            defaults.collision_iteration_cap as u64,
            "Cap on per-curve node-collision shifts",
        ),
        integer(
            "curve_samples",
            8.0,
            200.0,
            defaults.curve_samples as u64,
            "Polyline samples per curve",
        ),
        integer(
            "detection_samples",
            8.0,
            200.0,
            defaults.detection_samples as u64,
            "Samples per curve during crossing detection",
        ),
        number(
            "convergence_threshold",
            0.0,
            1.0,
            defaults.convergence_threshold as f64,
            "Fractional crossing reduction below which iteration stops",
        ),
        integer(
            "max_calculation_time_ms",
            1.0,
            600_000.0,
            defaults.max_calculation_time_ms,
            "Wall-clock budget for one full calculation",
        ),
        number(
            "hierarchy_time_fraction",
            0.05,
            0.9,
            defaults.hierarchy_time_fraction as f64,
            "Share of the budget granted to hierarchy mapping",
        ),
        number(
            "calculation_time_fraction",
            0.05,
            0.9,
            defaults.calculation_time_fraction as f64,
            "Share of the budget granted to route calculation",
        ),
        number(
            "primary_flow_weight",
            0.0,
            2.0,
            defaults.primary_flow_weight as f64,
            "Priority multiplier for primary flows",
        ),
        number(
            "secondary_flow_weight",
            0.0,
            2.0,
            defaults.secondary_flow_weight as f64,
            "Priority multiplier for secondary flows",
        ),
        number(
            "transformation_flow_weight",
            0.0,
            2.0,
            defaults.transformation_flow_weight as f64,
            "Priority multiplier for transformation flows",
        ),
        number(
            "distribution_flow_weight",
            0.0,
            2.0,
            defaults.distribution_flow_weight as f64,
            "Priority multiplier for distribution flows",
        ),
        boolean(
            "adaptive_features",
            defaults.adaptive_features,
            "Enable adaptive curvature and layering strategies",
        ),
        boolean(
            "graceful_degradation",
            defaults.graceful_degradation,
            "Return straight-line routes instead of erroring when fallback fails",
        ),
        boolean("cache_enabled", defaults.cache_enabled, "Enable the route cache"),
        integer(
            "cache_max_entries",
            1.0,
            4096.0,
            defaults.cache_max_entries as u64,
            "Maximum retained route-cache entries",
        ),
        integer(
            "hub_degree_threshold",
            2.0,
            64.0,
            defaults.hub_degree_threshold as u64,
            "Combined degree at which a node is classified as a hub",
        ),
        number(
            "node_width",
            0.001,
            0.2,
            defaults.node_width as f64,
            "Node box width in normalized units",
        ),
        number(
            "node_height_scale",
            0.01,
            1.0,
            defaults.node_height_scale as f64,
            "Node box height per unit of normalized total flow",
        ),
    ]
}

/// Load a configuration file (JSON5) and overlay it on the defaults. Any
/// invalid field in the file is dropped with the same per-field rules as a
/// runtime patch.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<RoutingConfig> {
    let mut config = RoutingConfig::default();
    let Some(path) = path else {
        return Ok(config);
    };
    let raw = std::fs::read_to_string(path)?;
    let patch: ConfigPatch = json5::from_str(&raw)?;
    let report = config.apply_patch(&patch);
    for rejected in &report.rejected {
        tracing::warn!(
            field = rejected.field,
            reason = %rejected.reason,
            "config file field rejected"
        );
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_curvature() {
        let mut config = RoutingConfig::default();
        let before = config.curvature;
        let report = config.apply_patch(&ConfigPatch {
            curvature: Some(5.0),
            ..Default::default()
        });
        assert_eq!(config.curvature, before);
        assert!(report.applied.is_empty());
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.rejected[0].field, "curvature");
        assert!(!report.cache_invalidated);
    }

    #[test]
    fn mixed_patch_applies_only_valid_fields() {
        let mut config = RoutingConfig::default();
        let report = config.apply_patch(&ConfigPatch {
            curvature: Some(0.5),
            link_separation: Some(9.0),
            max_iterations: Some(20),
            ..Default::default()
        });
        assert_eq!(config.curvature, 0.5);
        assert_eq!(config.link_separation, RoutingConfig::default().link_separation);
        assert_eq!(config.max_iterations, 20);
        assert!(report.changed("curvature"));
        assert!(report.changed("max_iterations"));
        assert!(report.cache_invalidated);
    }

    #[test]
    fn noop_patch_keeps_version() {
        let mut config = RoutingConfig::default();
        let version = config.version;
        let report = config.apply_patch(&ConfigPatch::default());
        assert_eq!(config.version, version);
        assert!(report.applied.is_empty());
    }

    #[test]
    fn insignificant_field_does_not_invalidate_cache() {
        let mut config = RoutingConfig::default();
        let report = config.apply_patch(&ConfigPatch {
            cache_max_entries: Some(128),
            ..Default::default()
        });
        assert!(report.changed("cache_max_entries"));
        assert!(!report.cache_invalidated);
    }

    #[test]
    fn schema_covers_every_patchable_field() {
        let schema = config_schema();
        let patch_fields = serde_json::to_value(ConfigPatch::default()).unwrap();
        let patch_fields = patch_fields.as_object().unwrap();
        assert_eq!(schema.len(), patch_fields.len());
        for entry in &schema {
            assert!(
                patch_fields.contains_key(entry.name),
                "schema field {} missing from patch",
                entry.name
            );
        }
    }
}
