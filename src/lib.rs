//! Link routing engine for Sankey-style flow diagrams.
//!
//! Takes positioned nodes and value-weighted links from an external
//! layout stage and produces renderer-ready cubic Bezier routes: parallel
//! links fan out with symmetric offsets, curves bend around node boxes,
//! and an iterative resolver untangles visual crossings by flow-type
//! priority. The [`RoutingEngine`] orchestrates the pipeline with
//! caching, cooperative stage timeouts, and a fallback chain that always
//! yields a drawable route per valid link.
//!
//! ```no_run
//! use sankey_router::{FlowLink, FlowNode, RoutingConfig, RoutingEngine, RoutingOptions};
//!
//! let nodes = vec![
//!     FlowNode::new("Solar", 0.1, 0.3),
//!     FlowNode::new("Grid", 0.5, 0.4),
//!     FlowNode::new("Industry", 0.9, 0.5),
//! ];
//! let links = vec![FlowLink::new(0, 1, 30.0), FlowLink::new(1, 2, 24.0)];
//! let engine = RoutingEngine::new(RoutingConfig::default());
//! let routes = engine.calculate_routes(&links, &nodes, &RoutingOptions::default())?;
//! for route in &routes {
//!     println!("{} -> {}", route.id, route.path.svg_path);
//! }
//! # Ok::<(), sankey_router::RoutingError>(())
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod hierarchy;
pub mod ir;
pub mod routing;

pub use config::{
    ConfigFieldSchema, ConfigPatch, ConfigUpdateReport, PerformanceMode, RoutingAlgorithm,
    RoutingConfig, config_schema, load_config,
};
pub use engine::{PerformanceMetrics, RoutingEngine};
pub use error::{RoutingError, Stage};
pub use hierarchy::{FlowType, HierarchyMap, NodeInfo, NodeType};
pub use ir::{FlowLink, FlowNode, NodeBreakdown, NodeMetadataProvider, RoutingOptions};
pub use routing::{Route, RouteMeta, RoutePath};
pub use routing::crossings::{Crossing, CrossingKind, ResolutionReport};
